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

use crate::config::PriceFeedOptions;
use async_trait::async_trait;
use chain_manager::{
    config::ChainConfig,
    domain::{PriceFeed, PriceSheet, PriceSource},
};
use fleet_common::domain::ChainName;
use itertools::Itertools;
use log::{debug, warn};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{task::JoinHandle, time};

/// The set of coingecko ids to warm: the union of all chains' supported tokens.
pub fn prepare_price_feed_config(chains: &HashMap<ChainName, ChainConfig>) -> Vec<String> {
    chains
        .values()
        .flat_map(|chain| &chain.price_feed.supported_tokens)
        .filter_map(|token| token.coingecko_id.clone())
        .unique()
        .sorted()
        .collect()
}

/// Build the single price feed shared by all chain managers, along with the background
/// refresher task when the scheduled mode is selected.
pub(crate) fn build(
    options: &PriceFeedOptions,
    source: Option<Arc<dyn PriceSource>>,
    warm: Vec<String>,
) -> (Option<Arc<dyn PriceFeed>>, Option<JoinHandle<()>>) {
    if !options.enabled {
        return (None, None);
    }

    let Some(source) = source else {
        warn!("price feed enabled but no price source provided, prices disabled");
        return (None, None);
    };

    match (options.scheduled.enabled, options.scheduled.interval) {
        (true, Some(interval)) => {
            let (feed, task) = ScheduledPriceFeed::spawn(source, warm, interval);
            (Some(feed), Some(task))
        }

        (true, None) => {
            warn!("scheduled price feed without an interval, falling back to on-demand");
            let feed: Arc<dyn PriceFeed> =
                Arc::new(OnDemandPriceFeed::new(source, options.max_age));
            (Some(feed), None)
        }

        (false, _) => {
            let feed: Arc<dyn PriceFeed> =
                Arc::new(OnDemandPriceFeed::new(source, options.max_age));
            (Some(feed), None)
        }
    }
}

/// Lazy per-id lookup with caching: quotes younger than `max_age` are served from the cache,
/// everything else is fetched on the spot. Ids that fail to fetch are omitted from the sheet.
pub struct OnDemandPriceFeed {
    source: Arc<dyn PriceSource>,
    max_age: Duration,
    cache: RwLock<HashMap<String, Quote>>,
}

#[derive(Debug, Clone, Copy)]
struct Quote {
    value: f64,
    fetched_at: Instant,
}

impl OnDemandPriceFeed {
    pub fn new(source: Arc<dyn PriceSource>, max_age: Duration) -> Self {
        Self {
            source,
            max_age,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PriceFeed for OnDemandPriceFeed {
    async fn sheet(&self, coingecko_ids: &[String]) -> PriceSheet {
        let mut sheet = HashMap::with_capacity(coingecko_ids.len());

        for id in coingecko_ids {
            let cached = self.cache.read().get(id).copied();
            if let Some(quote) = cached {
                if quote.fetched_at.elapsed() < self.max_age {
                    sheet.insert(id.clone(), quote.value);
                    continue;
                }
            }

            match self.source.price(id).await {
                Ok(value) => {
                    self.cache.write().insert(
                        id.clone(),
                        Quote {
                            value,
                            fetched_at: Instant::now(),
                        },
                    );
                    sheet.insert(id.clone(), value);
                }

                Err(error) => {
                    warn!(id:%, error:%; "price lookup failed, omitting from sheet");
                }
            }
        }

        sheet.into()
    }
}

/// Periodic background refresh of the warm set; reads are served from the cache without
/// blocking. The refresher task is owned by the orchestrator and aborted on stop.
pub struct ScheduledPriceFeed {
    cache: Arc<RwLock<HashMap<String, f64>>>,
}

impl ScheduledPriceFeed {
    pub(crate) fn spawn(
        source: Arc<dyn PriceSource>,
        warm: Vec<String>,
        interval: Duration,
    ) -> (Arc<dyn PriceFeed>, JoinHandle<()>) {
        let cache = Arc::new(RwLock::new(HashMap::new()));
        let feed: Arc<dyn PriceFeed> = Arc::new(Self {
            cache: cache.clone(),
        });

        let task = tokio::spawn(async move {
            loop {
                for id in &warm {
                    match source.price(id).await {
                        Ok(value) => {
                            cache.write().insert(id.clone(), value);
                        }
                        Err(error) => {
                            warn!(id:%, error:%; "scheduled price refresh failed for token");
                        }
                    }
                }
                debug!(tokens = warm.len(); "price cache refreshed");

                time::sleep(interval).await;
            }
        });

        (feed, task)
    }
}

#[async_trait]
impl PriceFeed for ScheduledPriceFeed {
    async fn sheet(&self, coingecko_ids: &[String]) -> PriceSheet {
        let cache = self.cache.read();
        coingecko_ids
            .iter()
            .filter_map(|id| cache.get(id).map(|value| (id.clone(), *value)))
            .collect()
    }
}
