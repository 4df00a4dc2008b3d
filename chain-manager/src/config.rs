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

use fleet_common::domain::{ChainKey, Network, TokenConfig, Wallet};
use serde::Deserialize;
use std::time::Duration;

/// Per-chain section of the fleet configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainConfig {
    /// Network to manage; falls back to the chain's default network.
    pub network: Option<Network>,

    #[serde(default)]
    pub wallets: Vec<Wallet>,

    #[serde(default)]
    pub wallet_balance: WalletBalanceConfig,

    #[serde(default)]
    pub rebalance: RebalanceConfig,

    #[serde(default)]
    pub price_feed: ChainPriceFeedConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletBalanceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub scheduled: ScheduledConfig,
}

impl Default for WalletBalanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scheduled: ScheduledConfig::default(),
        }
    }
}

/// A periodic background activity. Without an interval the activity is off and only explicit
/// calls take effect.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduledConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
}

impl Default for ScheduledConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RebalanceConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Free-form strategy name; unknown names disable rebalancing for the chain.
    #[serde(default)]
    pub strategy: Option<String>,

    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,

    /// Wallets whose native balance falls below this (in human-scaled units) are topped up.
    #[serde(default)]
    pub min_balance_threshold: f64,

    /// Advisory driver hint, raw units.
    #[serde(default)]
    pub max_gas_price: Option<u128>,

    /// Advisory driver hint.
    #[serde(default)]
    pub gas_limit: Option<u64>,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: None,
            interval: None,
            min_balance_threshold: 0.0,
            max_gas_price: None,
            gas_limit: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainPriceFeedConfig {
    #[serde(default)]
    pub supported_tokens: Vec<TokenConfig>,
}

/// Resolved configuration a [ChainWalletManager](crate::ChainWalletManager) is built from.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub key: ChainKey,
    pub wallets: Vec<Wallet>,

    /// `None` disables scheduled polling; balances then refresh only on explicit pulls.
    pub poll_interval: Option<Duration>,

    pub rebalance: RebalanceConfig,
    pub supported_tokens: Vec<TokenConfig>,
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use crate::config::ChainConfig;
    use std::time::Duration;

    #[test]
    fn test_chain_config_defaults() {
        let config = serde_json::from_str::<ChainConfig>("{}").expect("empty config is valid");

        assert!(config.network.is_none());
        assert!(config.wallet_balance.enabled);
        assert!(config.wallet_balance.scheduled.enabled);
        assert!(config.wallet_balance.scheduled.interval.is_none());
        assert!(!config.rebalance.enabled);
    }

    #[test]
    fn test_humantime_intervals() {
        let config = serde_json::from_str::<ChainConfig>(
            r#"{
                "wallet_balance": { "scheduled": { "interval": "30s" } },
                "rebalance": { "enabled": true, "strategy": "evenly-redistribute", "interval": "5m" }
            }"#,
        )
        .expect("config is valid");

        assert_eq!(
            config.wallet_balance.scheduled.interval,
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.rebalance.interval, Some(Duration::from_secs(300)));
    }
}
