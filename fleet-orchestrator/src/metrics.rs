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

use crate::config::MetricsConfig;
use fleet_common::domain::{EventBus, FleetEvent};
use log::{debug, warn};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::{SystemTime, UNIX_EPOCH};

const WALLET_BALANCE: &str = "fleet_wallet_balance";
const BALANCE_UPDATES: &str = "fleet_balance_updates_total";
const LAST_UPDATE: &str = "fleet_balance_last_update_seconds";
const ACTIVE_WALLETS: &str = "fleet_active_wallets";
const LOCK_PERIOD: &str = "fleet_wallet_lock_period_seconds";
const REBALANCES_STARTED: &str = "fleet_rebalances_started_total";
const REBALANCES_FINISHED: &str = "fleet_rebalances_finished_total";
const REBALANCE_ERRORS: &str = "fleet_rebalance_errors_total";
const CHAIN_ERRORS: &str = "fleet_chain_errors_total";

/// Event-driven metrics recorder. Pure in-memory recording via the `metrics` facade; no I/O
/// happens on the emitting task.
pub struct MetricsSink;

impl MetricsSink {
    pub fn new() -> Self {
        describe_gauge!(WALLET_BALANCE, "Last observed balance per wallet and token");
        describe_counter!(BALANCE_UPDATES, "Completed balance refreshes per chain");
        describe_gauge!(LAST_UPDATE, "Unix timestamp of the last balance refresh");
        describe_gauge!(ACTIVE_WALLETS, "Currently locked wallets per chain");
        describe_histogram!(LOCK_PERIOD, "How long wallets were locked");
        describe_counter!(REBALANCES_STARTED, "Rebalance cycles started");
        describe_counter!(REBALANCES_FINISHED, "Rebalance cycles finished");
        describe_counter!(REBALANCE_ERRORS, "Failed rebalance instructions");
        describe_counter!(CHAIN_ERRORS, "Background chain errors");

        Self
    }

    /// Subscribe a sink to all events of the given bus.
    pub fn install_on(bus: &EventBus) {
        let sink = Self::new();
        bus.on_any(move |event| sink.record(event));
    }

    pub fn record(&self, event: &FleetEvent) {
        match event {
            FleetEvent::Balances { key, new, .. } => {
                let chain = key.chain().to_string();
                let network = key.network().to_string();

                counter!(BALANCE_UPDATES, "chain" => chain.clone(), "network" => network.clone())
                    .increment(1);
                gauge!(LAST_UPDATE, "chain" => chain.clone(), "network" => network.clone())
                    .set(unix_now());

                for (address, balances) in new.iter() {
                    for balance in balances {
                        // Unparsable amounts are skipped, not zeroed.
                        let Some(value) = balance.formatted_value() else {
                            continue;
                        };
                        gauge!(
                            WALLET_BALANCE,
                            "chain" => chain.clone(),
                            "network" => network.clone(),
                            "address" => address.to_owned(),
                            "symbol" => balance.symbol.clone()
                        )
                        .set(value);
                    }
                }
            }

            FleetEvent::Error { chain, .. } => {
                counter!(CHAIN_ERRORS, "chain" => chain.to_string()).increment(1);
            }

            FleetEvent::RebalanceStarted { key, strategy, .. } => {
                counter!(
                    REBALANCES_STARTED,
                    "chain" => key.chain().to_string(),
                    "strategy" => strategy.clone()
                )
                .increment(1);
            }

            FleetEvent::RebalanceFinished { key, strategy, .. } => {
                counter!(
                    REBALANCES_FINISHED,
                    "chain" => key.chain().to_string(),
                    "strategy" => strategy.clone()
                )
                .increment(1);
            }

            FleetEvent::RebalanceError { key, strategy, .. } => {
                counter!(
                    REBALANCE_ERRORS,
                    "chain" => key.chain().to_string(),
                    "strategy" => strategy.clone()
                )
                .increment(1);
            }

            FleetEvent::ActiveWalletsCount { key, count } => {
                gauge!(
                    ACTIVE_WALLETS,
                    "chain" => key.chain().to_string(),
                    "network" => key.network().to_string()
                )
                .set(*count as f64);
            }

            FleetEvent::WalletsLockPeriod { key, address, held_for } => {
                histogram!(
                    LOCK_PERIOD,
                    "chain" => key.chain().to_string(),
                    "address" => address.clone()
                )
                .record(held_for.as_secs_f64());
            }
        }
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind the built-in Prometheus scrape listener. The listener answers on any path; the
/// configured path is informational for embedders.
pub fn serve_metrics(config: &MetricsConfig) {
    let result = PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.port))
        .install();

    match result {
        Ok(()) => debug!(port = config.port, path:% = config.path; "metrics listener bound"),
        Err(error) => warn!(error:%, port = config.port; "cannot bind metrics listener"),
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use crate::metrics::MetricsSink;
    use fleet_common::domain::{ChainKey, ChainName, FleetEvent, SharedSnapshot};
    use std::time::Duration;

    // Without an installed recorder the macros are no-ops; this covers the matching itself.
    #[test]
    fn test_record_covers_all_events() {
        let sink = MetricsSink::new();
        let key = ChainKey::new(ChainName::Ethereum, ChainName::Ethereum.default_network());

        sink.record(&FleetEvent::Balances {
            key: key.clone(),
            new: SharedSnapshot::default(),
            previous: SharedSnapshot::default(),
        });
        sink.record(&FleetEvent::Error {
            chain: ChainName::Ethereum,
            message: "boom".to_owned(),
        });
        sink.record(&FleetEvent::ActiveWalletsCount { key: key.clone(), count: 2 });
        sink.record(&FleetEvent::WalletsLockPeriod {
            key,
            address: "0xa".to_owned(),
            held_for: Duration::from_millis(12),
        });
    }
}
