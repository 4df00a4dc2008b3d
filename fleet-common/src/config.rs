// This file is part of wallet-fleet.
// Copyright (C) 2025 Midnight Foundation
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Load a configuration of type `T` from the given YAML file, overridden by `FLEET_`-prefixed
/// environment variables with `__` as the nesting separator, e.g.
/// `FLEET_CHAINS__ETHEREUM__NETWORK=sepolia`. Unknown fields are accepted and ignored.
pub fn load<T>(path: impl AsRef<Path>) -> Result<T, figment::Error>
where
    T: DeserializeOwned,
{
    Figment::new()
        .merge(Yaml::file(path.as_ref()))
        .merge(Env::prefixed("FLEET_").split("__"))
        .extract()
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        name: String,
        count: usize,
    }

    #[test]
    fn test_load_with_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                "name: fleet\ncount: 3\nignored_field: true\n",
            )?;
            jail.set_env("FLEET_COUNT", "7");

            let config = super::load::<TestConfig>("config.yaml")?;
            assert_eq!(config.name, "fleet");
            assert_eq!(config.count, 7);

            Ok(())
        });
    }
}
