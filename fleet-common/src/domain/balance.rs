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
use std::{collections::HashMap, sync::Arc};

/// One observed balance of a wallet. `raw_balance` is the exact on-chain integer amount,
/// `formatted_balance` the human-scaled decimal rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub address: String,
    pub symbol: String,
    pub is_native: bool,

    #[serde(default)]
    pub token_address: Option<String>,

    pub raw_balance: String,
    pub formatted_balance: String,
}

impl WalletBalance {
    /// The raw on-chain amount, if it parses as an unsigned integer.
    pub fn raw_value(&self) -> Option<u128> {
        self.raw_balance.parse().ok()
    }

    /// The human-scaled amount, if it parses as a decimal.
    pub fn formatted_value(&self) -> Option<f64> {
        self.formatted_balance.parse().ok()
    }
}

/// Immutable balance table for one chain key: address to observed balances. Snapshots are
/// replaced atomically after each successful poll and never partially mutated; token ordering
/// within an address is unstable across snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BalanceSnapshot(HashMap<String, Vec<WalletBalance>>);

/// How snapshots are shared: cheap to clone, impossible to mutate in place.
pub type SharedSnapshot = Arc<BalanceSnapshot>;

impl BalanceSnapshot {
    pub fn get(&self, address: &str) -> Option<&[WalletBalance]> {
        self.0.get(address).map(Vec::as_slice)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[WalletBalance])> {
        self.0.iter().map(|(a, b)| (a.as_str(), b.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<String, Vec<WalletBalance>>> for BalanceSnapshot {
    fn from(table: HashMap<String, Vec<WalletBalance>>) -> Self {
        Self(table)
    }
}

impl FromIterator<(String, Vec<WalletBalance>)> for BalanceSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, Vec<WalletBalance>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
