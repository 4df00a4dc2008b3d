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

use derive_more::{AsRef, Display, From, Into};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// The closed set of chains the fleet knows how to manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainName {
    Ethereum,
    Polygon,
    Bsc,
    Avalanche,
    Solana,
}

impl ChainName {
    pub const ALL: [ChainName; 5] = [
        ChainName::Ethereum,
        ChainName::Polygon,
        ChainName::Bsc,
        ChainName::Avalanche,
        ChainName::Solana,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainName::Ethereum => "ethereum",
            ChainName::Polygon => "polygon",
            ChainName::Bsc => "bsc",
            ChainName::Avalanche => "avalanche",
            ChainName::Solana => "solana",
        }
    }

    /// The network assumed when a chain configuration does not name one.
    pub fn default_network(&self) -> Network {
        match self {
            ChainName::Solana => Network::from("mainnet-beta"),
            _ => Network::from("mainnet"),
        }
    }

    /// Symbol of the chain's native token.
    pub fn native_symbol(&self) -> &'static str {
        match self {
            ChainName::Ethereum => "ETH",
            ChainName::Polygon => "POL",
            ChainName::Bsc => "BNB",
            ChainName::Avalanche => "AVAX",
            ChainName::Solana => "SOL",
        }
    }
}

impl fmt::Display for ChainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainName {
    type Err = UnknownChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChainName::ALL
            .into_iter()
            .find(|chain| chain.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownChainError(s.to_owned()))
    }
}

#[derive(Debug, Error)]
#[error("unknown chain {0}")]
pub struct UnknownChainError(pub String);

/// Chain-scoped network name, e.g. `mainnet` or `sepolia`.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Display, From, Into, AsRef, Serialize, Deserialize,
)]
pub struct Network(String);

impl Network {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Network {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// The (chain, network) pair identifying one managed domain. Each `ChainKey` is exclusively
/// owned by a single chain wallet manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainKey {
    chain: ChainName,
    network: Network,
}

impl ChainKey {
    pub fn new(chain: ChainName, network: Network) -> Self {
        Self { chain, network }
    }

    pub fn chain(&self) -> ChainName {
        self.chain
    }

    pub fn network(&self) -> &Network {
        &self.network
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain, self.network)
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::{ChainKey, ChainName, UnknownChainError};
    use assert_matches::assert_matches;

    #[test]
    fn test_chain_name_round_trip() {
        for chain in ChainName::ALL {
            let parsed = chain.as_str().parse::<ChainName>();
            assert_matches!(parsed, Ok(c) if c == chain);
        }

        let parsed = "ETHEREUM".parse::<ChainName>();
        assert_matches!(parsed, Ok(ChainName::Ethereum));

        let parsed = "dogecoin".parse::<ChainName>();
        assert_matches!(parsed, Err(UnknownChainError(name)) if name == "dogecoin");
    }

    #[test]
    fn test_default_networks() {
        assert_eq!(ChainName::Ethereum.default_network().as_str(), "mainnet");
        assert_eq!(ChainName::Solana.default_network().as_str(), "mainnet-beta");
    }

    #[test]
    fn test_chain_key_display() {
        let key = ChainKey::new(ChainName::Bsc, ChainName::Bsc.default_network());
        assert_eq!(key.to_string(), "bsc:mainnet");
    }
}
