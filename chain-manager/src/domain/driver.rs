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
use fleet_common::{
    domain::{TransferReceipt, Wallet, WalletBalance},
    error::BoxError,
};
use thiserror::Error;

/// Per-chain wallet driver capability: balance queries, transfers, block height. Drivers sign
/// and broadcast on their own; the core only sequences their use. Implementations are held as
/// `Arc<dyn ChainDriver>` since every chain brings its own.
#[async_trait]
pub trait ChainDriver: Send + Sync + 'static {
    /// Current balances of the given wallets. Called per wallet by the poller so one failing
    /// wallet does not hide the others.
    async fn pull_balances(&self, wallets: &[Wallet]) -> Result<Vec<WalletBalance>, DriverError>;

    /// Balances of the given wallets at a specific block height.
    async fn pull_balances_at_height(
        &self,
        wallets: &[Wallet],
        height: u64,
    ) -> Result<Vec<WalletBalance>, DriverError>;

    /// Move value between two wallets. The driver must re-check sufficiency at execution time
    /// and fail rather than overdraw; the caller's balance view may be stale.
    async fn transfer(&self, request: TransferRequest) -> Result<TransferReceipt, DriverError>;

    async fn block_height(&self) -> Result<u64, DriverError>;
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub from: String,
    pub to: String,

    /// Raw on-chain units.
    pub amount: String,

    /// Token symbol; `None` is the native token.
    pub token: Option<String>,

    pub hints: TransferHints,
}

/// Advisory execution hints; drivers may ignore what their chain cannot express.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferHints {
    pub max_gas_price: Option<u128>,
    pub gas_limit: Option<u64>,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("insufficient funds in {address}")]
    InsufficientFunds { address: String },

    #[error("gas price above the configured maximum")]
    GasPriceExceeded,

    #[error("rpc failure")]
    Rpc(#[source] BoxError),
}

impl DriverError {
    pub fn rpc(error: impl Into<BoxError>) -> Self {
        DriverError::Rpc(error.into())
    }
}
