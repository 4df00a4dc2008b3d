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

use serde::{Deserialize, Serialize};

/// A managed wallet: a driver-controlled address plus the tokens it is expected to hold.
/// Addresses are unique within a chain key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub address: String,

    #[serde(default)]
    pub tokens: Vec<TokenConfig>,

    /// Driver-specific configuration; opaque to the core, handed to the driver verbatim.
    #[serde(default)]
    pub driver_config: serde_json::Value,
}

impl Wallet {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tokens: Vec::new(),
            driver_config: serde_json::Value::Null,
        }
    }
}

/// One token a wallet or price feed knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,

    #[serde(default)]
    pub coingecko_id: Option<String>,

    #[serde(default)]
    pub token_address: Option<String>,
}

impl TokenConfig {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            coingecko_id: None,
            token_address: None,
        }
    }
}
