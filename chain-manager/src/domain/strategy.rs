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

use crate::{config::RebalanceConfig, domain::PriceSheet};
use fleet_common::domain::{BalanceSnapshot, RebalanceInstruction};
use log::warn;
use std::sync::Arc;

/// A rebalance strategy: a pure function from the latest balance table (and an optional price
/// sheet) to transfer instructions. Implementations must not perform I/O.
pub trait RebalanceStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a failed instruction aborts the rest of the batch.
    fn atomic(&self) -> bool {
        false
    }

    fn plan(
        &self,
        balances: &BalanceSnapshot,
        prices: Option<&PriceSheet>,
    ) -> Vec<RebalanceInstruction>;
}

/// Map a configured strategy name to a built-in strategy. Unknown names disable rebalancing
/// for the chain.
pub fn resolve(config: &RebalanceConfig) -> Option<Arc<dyn RebalanceStrategy>> {
    if !config.enabled {
        return None;
    }

    match config.strategy.as_deref() {
        Some(EvenlyRedistribute::NAME) => Some(Arc::new(EvenlyRedistribute::new(
            config.min_balance_threshold,
        ))),

        Some(other) => {
            warn!(strategy:% = other; "unknown rebalance strategy, rebalancing disabled");
            None
        }

        None => {
            warn!("rebalance enabled without a strategy, rebalancing disabled");
            None
        }
    }
}

/// Levels native balances toward the fleet mean: wallets whose human-scaled native balance is
/// below the configured threshold are topped up from wallets above the mean. Amounts are
/// computed in raw units.
#[derive(Debug, Clone)]
pub struct EvenlyRedistribute {
    min_balance_threshold: f64,
}

impl EvenlyRedistribute {
    pub const NAME: &'static str = "evenly-redistribute";

    pub fn new(min_balance_threshold: f64) -> Self {
        Self {
            min_balance_threshold,
        }
    }
}

impl RebalanceStrategy for EvenlyRedistribute {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn plan(
        &self,
        balances: &BalanceSnapshot,
        _prices: Option<&PriceSheet>,
    ) -> Vec<RebalanceInstruction> {
        // Native holdings with parsable amounts, sorted by address for deterministic plans.
        let mut native = balances
            .iter()
            .filter_map(|(address, balances)| {
                let balance = balances.iter().find(|balance| balance.is_native)?;
                Some((address, balance.raw_value()?, balance.formatted_value()?))
            })
            .collect::<Vec<_>>();
        native.sort_by_key(|(address, ..)| *address);

        if native.len() < 2 {
            return Vec::new();
        }

        let total: u128 = native.iter().map(|(_, raw, _)| raw).sum();
        let mean = total / native.len() as u128;

        let mut surplus = native
            .iter()
            .filter(|(_, raw, _)| *raw > mean)
            .map(|(address, raw, _)| (*address, raw - mean))
            .collect::<Vec<_>>();

        let mut instructions = Vec::new();

        for (address, raw, formatted) in &native {
            if *formatted >= self.min_balance_threshold || *raw >= mean {
                continue;
            }

            let mut needed = mean - raw;
            for (donor, available) in surplus.iter_mut() {
                if needed == 0 {
                    break;
                }
                let amount = needed.min(*available);
                if amount == 0 {
                    continue;
                }

                instructions.push(RebalanceInstruction {
                    source_address: (*donor).to_owned(),
                    target_address: (*address).to_owned(),
                    amount: amount.to_string(),
                    token: None,
                });
                *available -= amount;
                needed -= amount;
            }
        }

        instructions
    }
}
