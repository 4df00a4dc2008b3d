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

use crate::domain::{ChainDriver, DriverError};
use fleet_common::domain::{BalanceSnapshot, Wallet, WalletBalance};
use itertools::Itertools;
use std::{collections::HashMap, slice};

/// Result of one full refresh over all configured wallets.
pub(crate) struct PollOutcome {
    pub snapshot: BalanceSnapshot,
    pub failures: Vec<WalletFailure>,
}

/// One wallet whose refresh failed; the snapshot keeps its previous balances.
pub(crate) struct WalletFailure {
    pub address: String,
    pub error: DriverError,
}

/// Query every wallet once and build the next full snapshot. Wallets are queried one at a time
/// so a failing wallet is attributable and does not hide the others: its previous balances are
/// carried forward (best-effort continuity) and the failure is reported alongside.
pub(crate) async fn refresh(
    driver: &dyn ChainDriver,
    wallets: &[Wallet],
    previous: &BalanceSnapshot,
) -> PollOutcome {
    let mut table: HashMap<String, Vec<WalletBalance>> = HashMap::with_capacity(wallets.len());
    let mut failures = Vec::new();

    for wallet in wallets {
        match driver.pull_balances(slice::from_ref(wallet)).await {
            Ok(balances) => {
                merge(&mut table, wallet, balances);
            }

            Err(error) => {
                let prior = previous
                    .get(&wallet.address)
                    .map(<[WalletBalance]>::to_vec)
                    .unwrap_or_default();
                table.insert(wallet.address.clone(), prior);
                failures.push(WalletFailure {
                    address: wallet.address.clone(),
                    error,
                });
            }
        }
    }

    PollOutcome {
        snapshot: table.into(),
        failures,
    }
}

/// Group driver balances into a snapshot table for the given wallets. Every wallet gets an
/// entry, even with no balances returned for it.
pub(crate) fn table(wallets: &[Wallet], balances: Vec<WalletBalance>) -> BalanceSnapshot {
    let mut table = HashMap::with_capacity(wallets.len());
    for wallet in wallets {
        merge(&mut table, wallet, Vec::new());
    }
    for (address, group) in balances
        .into_iter()
        .into_group_map_by(|balance| balance.address.clone())
    {
        table.entry(address).or_default().extend(group);
    }

    table.into()
}

fn merge(
    table: &mut HashMap<String, Vec<WalletBalance>>,
    wallet: &Wallet,
    balances: Vec<WalletBalance>,
) {
    table.entry(wallet.address.clone()).or_default();
    for (address, group) in balances
        .into_iter()
        .into_group_map_by(|balance| balance.address.clone())
    {
        table.entry(address).or_default().extend(group);
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        domain::{ChainDriver, DriverError, TransferRequest},
        poller,
    };
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use fleet_common::domain::{BalanceSnapshot, TransferReceipt, Wallet, WalletBalance};

    struct FlakyDriver;

    #[async_trait]
    impl ChainDriver for FlakyDriver {
        async fn pull_balances(
            &self,
            wallets: &[Wallet],
        ) -> Result<Vec<WalletBalance>, DriverError> {
            let wallet = &wallets[0];
            if wallet.address == "0xbad" {
                return Err(DriverError::rpc("endpoint unreachable"));
            }

            Ok(vec![WalletBalance {
                address: wallet.address.clone(),
                symbol: "ETH".to_owned(),
                is_native: true,
                token_address: None,
                raw_balance: "1500000000000000000".to_owned(),
                formatted_balance: "1.5".to_owned(),
            }])
        }

        async fn pull_balances_at_height(
            &self,
            _wallets: &[Wallet],
            _height: u64,
        ) -> Result<Vec<WalletBalance>, DriverError> {
            unimplemented!("not used by the poller")
        }

        async fn transfer(
            &self,
            _request: TransferRequest,
        ) -> Result<TransferReceipt, DriverError> {
            unimplemented!("not used by the poller")
        }

        async fn block_height(&self) -> Result<u64, DriverError> {
            unimplemented!("not used by the poller")
        }
    }

    #[tokio::test]
    async fn test_refresh_keeps_previous_balances_on_failure() {
        let wallets = vec![Wallet::new("0xa"), Wallet::new("0xbad")];

        let previous = [(
            "0xbad".to_owned(),
            vec![WalletBalance {
                address: "0xbad".to_owned(),
                symbol: "ETH".to_owned(),
                is_native: true,
                token_address: None,
                raw_balance: "7".to_owned(),
                formatted_balance: "0.000000000000000007".to_owned(),
            }],
        )]
        .into_iter()
        .collect::<BalanceSnapshot>();

        let outcome = poller::refresh(&FlakyDriver, &wallets, &previous).await;

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].address, "0xbad");
        assert_matches!(outcome.failures[0].error, DriverError::Rpc(_));

        // The healthy wallet is fresh, the failing one keeps its prior balances.
        let fresh = outcome.snapshot.get("0xa").expect("0xa has an entry");
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].formatted_balance, "1.5");

        let carried = outcome.snapshot.get("0xbad").expect("0xbad has an entry");
        assert_eq!(carried.len(), 1);
        assert_eq!(carried[0].raw_balance, "7");
    }

    #[tokio::test]
    async fn test_refresh_first_failure_yields_empty_entry() {
        let wallets = vec![Wallet::new("0xbad")];

        let outcome = poller::refresh(&FlakyDriver, &wallets, &BalanceSnapshot::default()).await;

        assert_eq!(outcome.failures.len(), 1);
        let entry = outcome.snapshot.get("0xbad").expect("0xbad has an entry");
        assert!(entry.is_empty());
    }
}
