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
    domain::{ChainDriver, DriverError, PriceFeed, RebalanceStrategy, TransferHints,
        TransferRequest},
    lock::{AcquireOptions, LockError, LockRegistry},
    manager::Emitter,
};
use fastrace::trace;
use fleet_common::domain::{ChainKey, FleetEvent, RebalanceInstruction, SharedSnapshot,
    TransferReceipt};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};
use stream_cancel::Tripwire;
use thiserror::Error;
use tokio::time;

/// Everything one rebalancer task needs, assembled by the owning manager.
pub(crate) struct RebalanceContext {
    pub key: ChainKey,
    pub strategy: Arc<dyn RebalanceStrategy>,
    pub interval: Duration,
    pub hints: TransferHints,
    pub driver: Arc<dyn ChainDriver>,
    pub locks: LockRegistry,
    pub balances: Arc<RwLock<SharedSnapshot>>,
    pub price_feed: Option<Arc<dyn PriceFeed>>,
    pub price_ids: Vec<String>,
    pub emitter: Arc<Emitter>,
}

/// Strategy-driven redistribution loop. Cycles run at `interval` after the completion of the
/// previous cycle; the first cycle is delayed by one interval so startup does not plan on an
/// empty balance table.
pub(crate) async fn run(ctx: RebalanceContext, tripwire: Tripwire) {
    debug!(
        chain:% = ctx.key.chain(),
        strategy:% = ctx.strategy.name();
        "rebalancer started"
    );

    loop {
        tokio::select! {
            _ = time::sleep(ctx.interval) => {}
            _ = tripwire.clone() => break,
        }
        tokio::select! {
            _ = cycle(&ctx) => {}
            _ = tripwire.clone() => break,
        }
    }
}

/// One plan-and-execute cycle over the most recent completed snapshot. Polling is not frozen
/// in between, so the driver re-checks sufficiency per transfer.
#[trace]
pub(crate) async fn cycle(ctx: &RebalanceContext) {
    let balances = ctx.balances.read().clone();
    if balances.is_empty() {
        return;
    }

    let prices = match &ctx.price_feed {
        Some(feed) if !ctx.price_ids.is_empty() => Some(feed.sheet(&ctx.price_ids).await),
        _ => None,
    };

    let instructions = ctx.strategy.plan(&balances, prices.as_ref());
    if instructions.is_empty() {
        debug!(chain:% = ctx.key.chain(); "nothing to rebalance");
        return;
    }

    let strategy = ctx.strategy.name().to_owned();
    info!(
        chain:% = ctx.key.chain(),
        strategy:%,
        instructions = instructions.len();
        "rebalance started"
    );
    ctx.emitter.emit(FleetEvent::RebalanceStarted {
        key: ctx.key.clone(),
        strategy: strategy.clone(),
        instructions: instructions.clone(),
    });

    let mut receipts = Vec::new();
    for instruction in instructions {
        match execute(ctx, &instruction).await {
            Ok(receipt) => receipts.push(receipt),

            Err(error) => {
                warn!(
                    chain:% = ctx.key.chain(),
                    source:% = instruction.source_address,
                    target:% = instruction.target_address,
                    error:%;
                    "rebalance instruction failed"
                );
                ctx.emitter.emit(FleetEvent::RebalanceError {
                    key: ctx.key.clone(),
                    strategy: strategy.clone(),
                    instruction: instruction.clone(),
                    message: error.to_string(),
                });

                if ctx.strategy.atomic() {
                    break;
                }
            }
        }
    }

    ctx.emitter.emit(FleetEvent::RebalanceFinished {
        key: ctx.key.clone(),
        strategy,
        receipts,
    });
}

/// Execute one instruction under the source wallet's lock, releasing it whatever the outcome.
async fn execute(
    ctx: &RebalanceContext,
    instruction: &RebalanceInstruction,
) -> Result<TransferReceipt, InstructionError> {
    let token = ctx
        .locks
        .acquire(&instruction.source_address, AcquireOptions::default())
        .await?;

    let result = ctx
        .driver
        .transfer(TransferRequest {
            from: instruction.source_address.clone(),
            to: instruction.target_address.clone(),
            amount: instruction.amount.clone(),
            token: instruction.token.clone(),
            hints: ctx.hints,
        })
        .await;

    if let Err(error) = ctx.locks.release(&instruction.source_address, token) {
        debug!(address:% = instruction.source_address, error:%; "release after transfer failed");
    }

    Ok(result?)
}

#[derive(Debug, Error)]
enum InstructionError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}
