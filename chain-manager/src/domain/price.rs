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

use async_trait::async_trait;
use fleet_common::error::BoxError;
use std::collections::HashMap;
use thiserror::Error;

/// Spot prices by coingecko id, warmed once per rebalance planning cycle so strategies stay
/// pure functions over plain data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceSheet(HashMap<String, f64>);

impl PriceSheet {
    pub fn get(&self, coingecko_id: &str) -> Option<f64> {
        self.0.get(coingecko_id).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<String, f64>> for PriceSheet {
    fn from(prices: HashMap<String, f64>) -> Self {
        Self(prices)
    }
}

impl FromIterator<(String, f64)> for PriceSheet {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Cached price view shared by all chain managers. Ids that cannot be priced are omitted from
/// the sheet rather than failing the cycle.
#[async_trait]
pub trait PriceFeed: Send + Sync + 'static {
    async fn sheet(&self, coingecko_ids: &[String]) -> PriceSheet;
}

/// External price oracle capability, e.g. a coingecko client. Implementations choose their own
/// transport; caching is the feed's concern, not the source's.
#[async_trait]
pub trait PriceSource: Send + Sync + 'static {
    async fn price(&self, coingecko_id: &str) -> Result<f64, PriceError>;
}

#[derive(Debug, Error)]
#[error("price lookup for {id} failed")]
pub struct PriceError {
    pub id: String,
    #[source]
    pub source: BoxError,
}
