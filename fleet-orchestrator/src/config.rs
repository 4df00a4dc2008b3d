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

use chain_manager::config::{ChainConfig, ScheduledConfig};
use serde::Deserialize;
use std::{collections::HashMap, num::NonZeroUsize, time::Duration};

/// Top-level fleet configuration. Chains are keyed by name; unknown names are rejected or
/// skipped depending on `fail_on_invalid_chain`. Unknown fields anywhere are accepted and
/// ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_true")]
    pub fail_on_invalid_chain: bool,

    #[serde(default = "default_true")]
    pub fail_on_invalid_tokens: bool,

    /// Default poll interval for chains that do not configure their own.
    #[serde(default, with = "humantime_serde")]
    pub balance_poll_interval: Option<Duration>,

    /// Concurrency bound for cross-chain fanout operations.
    #[serde(default = "default_fanout_limit")]
    pub fanout_limit: NonZeroUsize,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub price_feed: PriceFeedOptions,

    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            fail_on_invalid_chain: true,
            fail_on_invalid_tokens: true,
            balance_poll_interval: None,
            fanout_limit: default_fanout_limit(),
            metrics: MetricsConfig::default(),
            price_feed: PriceFeedOptions::default(),
            chains: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Scrape path, kept for embedders that mount the exporter themselves; the built-in
    /// listener answers on any path.
    #[serde(default = "default_metrics_path")]
    pub path: String,

    /// Whether to bind the built-in scrape listener.
    #[serde(default = "default_true")]
    pub serve: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            path: default_metrics_path(),
            serve: true,
        }
    }
}

/// Selects the price feed mode: disabled, on-demand (lazy fetch with caching) or scheduled
/// (periodic background refresh of all supported tokens).
#[derive(Debug, Clone, Deserialize)]
pub struct PriceFeedOptions {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_price_scheduled")]
    pub scheduled: ScheduledConfig,

    /// How long an on-demand quote stays fresh.
    #[serde(default = "default_price_max_age", with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for PriceFeedOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            scheduled: default_price_scheduled(),
            max_age: default_price_max_age(),
        }
    }
}

const fn default_true() -> bool {
    true
}

fn default_fanout_limit() -> NonZeroUsize {
    NonZeroUsize::new(4).expect("4 is non-zero")
}

const fn default_metrics_port() -> u16 {
    9000
}

fn default_metrics_path() -> String {
    "/metrics".to_owned()
}

fn default_price_scheduled() -> ScheduledConfig {
    ScheduledConfig {
        enabled: false,
        interval: None,
    }
}

const fn default_price_max_age() -> Duration {
    Duration::from_secs(60)
}
