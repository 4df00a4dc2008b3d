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

use crate::{
    config::FleetConfig,
    metrics::{MetricsSink, serve_metrics},
    price,
};
use chain_manager::{
    ChainWalletManager, ManagerError,
    config::{ChainConfig, ManagerConfig},
    domain::{ChainDriver, PriceSource, resolve},
    lock::AcquireOptions,
};
use fastrace::trace;
use fleet_common::{
    domain::{BalanceSnapshot, ChainKey, ChainName, EventBus, EventKind, FleetEvent,
        SharedSnapshot, Wallet},
    error::BoxError,
};
use futures::{StreamExt, TryStreamExt, stream};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::task::JoinHandle;

/// Top-level orchestrator: one chain wallet manager per configured (valid) chain, a shared
/// price feed, cross-chain fanout with bounded concurrency and a typed event bus multiplexing
/// all chain events to subscribers, including the metrics sink.
pub struct Orchestrator {
    managers: HashMap<ChainName, ChainWalletManager>,
    bus: Arc<EventBus>,
    fanout_limit: usize,
    price_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("chains", &self.managers.keys().collect::<Vec<_>>())
            .field("fanout_limit", &self.fanout_limit)
            .finish_non_exhaustive()
    }
}

/// Construction-time errors. Fatal unless the corresponding `fail_on_*` flag is off, in which
/// case the offending chain or token is logged and skipped instead.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown chain {0}")]
    UnknownChain(String),

    #[error("unknown token {symbol} for wallet {address} on chain {chain}")]
    UnknownToken {
        chain: ChainName,
        address: String,
        symbol: String,
    },

    #[error("duplicate wallet address {address} on chain {chain}")]
    DuplicateWallet { chain: ChainName, address: String },

    #[error("no driver provided for chain {0}")]
    MissingDriver(ChainName),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown chain {0}")]
    UnknownChain(ChainName),

    #[error("chain {0} has no wallets configured")]
    NoWallets(ChainName),

    #[error("operation on chain {chain} failed")]
    Chain {
        chain: ChainName,
        #[source]
        source: ManagerError,
    },

    #[error("block height unavailable for chain {chain}")]
    BlockHeightUnavailable {
        chain: ChainName,
        #[source]
        source: ManagerError,
    },

    #[error("with-wallet task on chain {chain} failed")]
    Task {
        chain: ChainName,
        #[source]
        source: BoxError,
    },

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

#[derive(Debug, Clone, Default)]
pub struct WithWalletOptions {
    /// Wallet to use; defaults to the chain's first configured wallet.
    pub address: Option<String>,

    pub wait_timeout: Option<Duration>,

    /// Accepted but ignored: the task's own lifetime governs the hold.
    pub lease_timeout: Option<Duration>,
}

/// What a with-wallet task gets to work with while it exclusively holds the wallet.
pub struct WalletSession {
    pub key: ChainKey,
    pub wallet: Wallet,
    pub driver: Arc<dyn ChainDriver>,
}

impl Orchestrator {
    /// Validate the configuration, build the shared price feed and construct and start one
    /// chain wallet manager per valid chain. Must be called within a tokio runtime.
    pub fn start(
        config: FleetConfig,
        drivers: HashMap<ChainName, Arc<dyn ChainDriver>>,
        price_source: Option<Arc<dyn PriceSource>>,
    ) -> Result<Self, ConfigError> {
        let bus = Arc::new(EventBus::new());

        let chains = validate_chains(&config)?;

        if config.metrics.enabled {
            MetricsSink::install_on(&bus);
            if config.metrics.serve {
                serve_metrics(&config.metrics);
            }
        }

        let warm = price::prepare_price_feed_config(&chains);
        let (price_feed, price_task) = price::build(&config.price_feed, price_source, warm);

        let sink = bus.sink();
        let mut managers = HashMap::with_capacity(chains.len());

        for (chain, chain_config) in chains {
            let driver = drivers
                .get(&chain)
                .cloned()
                .ok_or(ConfigError::MissingDriver(chain))?;

            let network = chain_config
                .network
                .clone()
                .unwrap_or_else(|| chain.default_network());
            let key = ChainKey::new(chain, network);

            let poll_interval = if chain_config.wallet_balance.enabled
                && chain_config.wallet_balance.scheduled.enabled
            {
                chain_config
                    .wallet_balance
                    .scheduled
                    .interval
                    .or(config.balance_poll_interval)
            } else {
                None
            };

            let strategy = resolve(&chain_config.rebalance);

            let manager = ChainWalletManager::new(
                ManagerConfig {
                    key,
                    wallets: chain_config.wallets,
                    poll_interval,
                    rebalance: chain_config.rebalance,
                    supported_tokens: chain_config.price_feed.supported_tokens,
                },
                driver,
                strategy,
                price_feed.clone(),
                sink.clone(),
            );
            manager.start().expect("a new manager can be started");
            managers.insert(chain, manager);
        }

        info!(chains = managers.len(); "wallet fleet orchestrator started");

        Ok(Self {
            managers,
            bus,
            fanout_limit: config.fanout_limit.get(),
            price_task: Mutex::new(price_task),
        })
    }

    /// Stop every chain manager and the price refresher. After this returns no further events
    /// are emitted.
    pub async fn stop(&self) {
        for manager in self.managers.values() {
            manager.stop().await;
        }
        if let Some(task) = self.price_task.lock().take() {
            task.abort();
        }

        info!("wallet fleet orchestrator stopped");
    }

    pub fn chains(&self) -> impl Iterator<Item = ChainName> + '_ {
        self.managers.keys().copied()
    }

    pub fn manager(&self, chain: ChainName) -> Result<&ChainWalletManager, OrchestratorError> {
        self.managers
            .get(&chain)
            .ok_or(OrchestratorError::UnknownChain(chain))
    }

    /// Register a handler for one event kind.
    pub fn on(&self, kind: EventKind, handler: impl Fn(&FleetEvent) + Send + Sync + 'static) {
        self.bus.on(kind, handler);
    }

    /// Register a handler for every event kind.
    pub fn on_any(&self, handler: impl Fn(&FleetEvent) + Send + Sync + 'static) {
        self.bus.on_any(handler);
    }

    /// Current snapshots of all managed chains; no I/O.
    pub async fn get_all_balances(&self) -> HashMap<ChainName, SharedSnapshot> {
        self.fan_out(self.fanout_limit, |_, manager| async move {
            Ok::<_, ManagerError>(manager.get_balances())
        })
        .await
        .expect("reading balance snapshots cannot fail")
    }

    /// Force a refresh on every chain and return the fresh snapshots.
    #[trace]
    pub async fn pull_balances(
        &self,
    ) -> Result<HashMap<ChainName, SharedSnapshot>, OrchestratorError> {
        self.fan_out(self.fanout_limit, |_, manager| async move {
            manager.pull_balances().await
        })
        .await
        .map_err(|(chain, source)| OrchestratorError::Chain { chain, source })
    }

    /// Block heights of all chains, queried fully concurrently for the tightest cross-chain
    /// coherence. Fails the whole call on the first error, naming the chain.
    #[trace]
    pub async fn get_block_height_for_all_supported_chains(
        &self,
    ) -> Result<HashMap<ChainName, u64>, OrchestratorError> {
        let limit = self.managers.len();
        self.fan_out(limit, |_, manager| async move {
            manager.block_height().await
        })
        .await
        .map_err(|(chain, source)| OrchestratorError::BlockHeightUnavailable { chain, source })
    }

    /// Balances at specific block heights. With explicit heights only those chains are
    /// queried (every key must be managed); without, heights are taken from
    /// [Self::get_block_height_for_all_supported_chains] first. Persistent snapshots are not
    /// touched.
    #[trace]
    pub async fn pull_balances_at_block_height(
        &self,
        heights: Option<HashMap<ChainName, u64>>,
    ) -> Result<HashMap<ChainName, BalanceSnapshot>, OrchestratorError> {
        let heights = match heights {
            Some(heights) => {
                for chain in heights.keys() {
                    if !self.managers.contains_key(chain) {
                        return Err(OrchestratorError::UnknownChain(*chain));
                    }
                }
                heights
            }
            None => self.get_block_height_for_all_supported_chains().await?,
        };

        stream::iter(heights.into_iter().map(|(chain, height)| {
            let manager = self.managers.get(&chain).cloned();
            async move {
                let manager = manager.ok_or(OrchestratorError::UnknownChain(chain))?;
                let snapshot = manager
                    .pull_balances_at_block_height(height)
                    .await
                    .map_err(|source| OrchestratorError::Chain { chain, source })?;

                Ok::<_, OrchestratorError>((chain, snapshot))
            }
        }))
        .buffer_unordered(self.fanout_limit)
        .try_collect()
        .await
    }

    /// Run `task` while exclusively holding one of the chain's wallets. The lock is released
    /// on every exit path: success, task failure, or cancellation of the task future.
    #[trace]
    pub async fn with_wallet<T, F, Fut>(
        &self,
        chain: ChainName,
        options: WithWalletOptions,
        task: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnOnce(WalletSession) -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        let manager = self.manager(chain)?;

        if options.lease_timeout.is_some() {
            debug!(chain:%; "lease timeout is ignored for with-wallet tasks");
        }

        let wallet = match &options.address {
            Some(address) => manager
                .wallet(address)
                .cloned()
                .ok_or_else(|| ManagerError::UnknownWallet(address.clone()))?,
            None => manager
                .wallets()
                .first()
                .cloned()
                .ok_or(OrchestratorError::NoWallets(chain))?,
        };
        let address = wallet.address.clone();

        manager
            .acquire_lock(
                &address,
                AcquireOptions {
                    wait_timeout: options.wait_timeout,
                    lease_timeout: None,
                },
            )
            .await?;
        let guard = ReleaseGuard { manager, address: &address };

        let session = WalletSession {
            key: manager.key().clone(),
            wallet,
            driver: manager.driver(),
        };
        let result = task(session).await;
        drop(guard);

        result.map_err(|source| OrchestratorError::Task { chain, source })
    }

    /// Run one operation per managed chain with bounded concurrency. The first failure aborts
    /// the fanout and is returned together with its chain.
    async fn fan_out<T, F, Fut>(
        &self,
        limit: usize,
        op: F,
    ) -> Result<HashMap<ChainName, T>, (ChainName, ManagerError)>
    where
        F: Fn(ChainName, ChainWalletManager) -> Fut,
        Fut: Future<Output = Result<T, ManagerError>>,
    {
        stream::iter(self.managers.iter().map(|(&chain, manager)| {
            let operation = op(chain, manager.clone());
            async move {
                operation
                    .await
                    .map(|value| (chain, value))
                    .map_err(|error| (chain, error))
            }
        }))
        .buffer_unordered(limit.max(1))
        .try_collect()
        .await
    }
}

/// Releases a manager-held lock on drop so `with_wallet` cannot leak the wallet, whatever the
/// task does.
struct ReleaseGuard<'a> {
    manager: &'a ChainWalletManager,
    address: &'a str,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if let Err(error) = self.manager.release_lock(self.address) {
            debug!(address:% = self.address, error:%; "with-wallet release failed");
        }
    }
}

fn validate_chains(config: &FleetConfig) -> Result<HashMap<ChainName, ChainConfig>, ConfigError> {
    let mut chains = HashMap::with_capacity(config.chains.len());

    for (name, chain_config) in &config.chains {
        let chain = match name.parse::<ChainName>() {
            Ok(chain) => chain,
            Err(_) if config.fail_on_invalid_chain => {
                return Err(ConfigError::UnknownChain(name.clone()));
            }
            Err(_) => {
                warn!(chain:% = name; "skipping unknown chain");
                continue;
            }
        };

        let mut chain_config = chain_config.clone();
        validate_wallets(chain, &mut chain_config, config.fail_on_invalid_tokens)?;
        chains.insert(chain, chain_config);
    }

    Ok(chains)
}

/// Addresses must be unique per chain; wallet tokens must be known, i.e. the native symbol or
/// one of the chain's supported tokens.
fn validate_wallets(
    chain: ChainName,
    config: &mut ChainConfig,
    fail_on_invalid_tokens: bool,
) -> Result<(), ConfigError> {
    let known = config
        .price_feed
        .supported_tokens
        .iter()
        .map(|token| token.symbol.as_str())
        .chain([chain.native_symbol()])
        .collect::<HashSet<_>>();

    let mut seen = HashSet::with_capacity(config.wallets.len());
    for wallet in &mut config.wallets {
        if !seen.insert(wallet.address.clone()) {
            return Err(ConfigError::DuplicateWallet {
                chain,
                address: wallet.address.clone(),
            });
        }

        if fail_on_invalid_tokens {
            if let Some(token) = wallet
                .tokens
                .iter()
                .find(|token| !known.contains(token.symbol.as_str()))
            {
                return Err(ConfigError::UnknownToken {
                    chain,
                    address: wallet.address.clone(),
                    symbol: token.symbol.clone(),
                });
            }
        } else {
            let address = wallet.address.clone();
            wallet.tokens.retain(|token| {
                let keep = known.contains(token.symbol.as_str());
                if !keep {
                    warn!(chain:%, address:%, symbol:% = token.symbol; "dropping unknown token");
                }
                keep
            });
        }
    }

    Ok(())
}
