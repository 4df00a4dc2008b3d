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

use log::debug;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque, hash_map},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{sync::oneshot, time};

/// Single-process exclusive leases on wallet addresses. At most one holder per address at any
/// instant; waiters queue FIFO and are handed the lock one at a time on release or lease
/// expiry. Operations on distinct addresses only contend on the short critical section
/// guarding the registry index; no await happens inside it.
///
/// Lease expiry and waiter handoff spawn onto the ambient tokio runtime, so the registry must
/// be used from within one.
#[derive(Clone, Default)]
pub struct LockRegistry {
    inner: Arc<Inner>,
}

/// Exclusive hold on one address; required to release it again. A token whose lease deadline
/// has passed is stale: releasing with it fails [LockError::LeaseExpired].
#[derive(Debug, Clone, Copy)]
pub struct LockToken {
    id: u64,
    deadline: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    /// Give up with [LockError::AcquireTimeout] after waiting this long for the address.
    pub wait_timeout: Option<Duration>,

    /// Spontaneously free the address this long after acquisition.
    pub lease_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("timed out waiting to acquire the wallet lock")]
    AcquireTimeout,

    #[error("the wallet lock is not held by this token")]
    NotHeld,

    #[error("the wallet lock lease expired before release")]
    LeaseExpired,

    #[error("the lock registry is shut down")]
    Cancelled,
}

/// A lock state change, reported to the registry observer after the critical section. `held`
/// is the number of held addresses right after the change, computed inside the critical
/// section so observers see counts consistent with the transitions.
#[derive(Debug, Clone)]
pub struct LockTransition {
    pub address: String,
    pub change: LockChange,
    pub held: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockChange {
    Acquired,
    Released { held_for: Duration },
    Expired { held_for: Duration },
}

pub type TransitionObserver = Arc<dyn Fn(LockTransition) + Send + Sync>;

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    observer: Option<TransitionObserver>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct State {
    closed: bool,
    entries: HashMap<String, Entry>,
}

struct Entry {
    holder: Holder,
    waiters: VecDeque<Waiter>,
}

struct Holder {
    id: u64,
    acquired_at: Instant,
    deadline: Option<Instant>,
}

struct Waiter {
    id: u64,
    lease_timeout: Option<Duration>,
    grant: oneshot::Sender<LockToken>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(observer: TransitionObserver) -> Self {
        Self {
            inner: Arc::new(Inner {
                observer: Some(observer),
                ..Default::default()
            }),
        }
    }

    /// Acquire the exclusive lock on `address`, waiting until it is free or `wait_timeout`
    /// elapses.
    pub async fn acquire(
        &self,
        address: &str,
        options: AcquireOptions,
    ) -> Result<LockToken, LockError> {
        let (waiter_id, mut grant_rx) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(LockError::Cancelled);
            }

            match state.entries.entry(address.to_owned()) {
                hash_map::Entry::Vacant(vacant) => {
                    let (holder, token) = self.inner.new_holder(options.lease_timeout);
                    vacant.insert(Entry {
                        holder,
                        waiters: VecDeque::new(),
                    });
                    let transition = LockTransition {
                        address: address.to_owned(),
                        change: LockChange::Acquired,
                        held: state.entries.len(),
                    };
                    drop(state);

                    self.spawn_watchdog(address, token);
                    self.inner.observe(transition);
                    return Ok(token);
                }

                hash_map::Entry::Occupied(mut occupied) => {
                    let (grant_tx, grant_rx) = oneshot::channel();
                    let waiter_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    occupied.get_mut().waiters.push_back(Waiter {
                        id: waiter_id,
                        lease_timeout: options.lease_timeout,
                        grant: grant_tx,
                    });
                    (waiter_id, grant_rx)
                }
            }
        };

        match options.wait_timeout {
            None => grant_rx.await.map_err(|_| LockError::Cancelled),

            Some(wait) => {
                tokio::select! {
                    granted = &mut grant_rx => granted.map_err(|_| LockError::Cancelled),
                    _ = time::sleep(wait) => self.give_up(address, waiter_id, grant_rx),
                }
            }
        }
    }

    /// Release the lock on `address`, handing it to the next waiter if any. Returns how long
    /// the lock was held.
    pub fn release(&self, address: &str, token: LockToken) -> Result<Duration, LockError> {
        self.finish(address, token, false)
    }

    /// Fail all waiters with [LockError::Cancelled], free all holders and refuse further
    /// acquisition. Used when the owning manager stops.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        // Dropping the entries drops the waiters' grant senders, which wakes every waiter
        // with Cancelled.
        state.entries.clear();
    }

    /// Number of currently-held addresses.
    pub fn held_count(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_held(&self, address: &str) -> bool {
        self.inner.state.lock().entries.contains_key(address)
    }

    /// Remove a timed-out waiter. If the grant won the race the lock is relinquished again so
    /// the timeout stays authoritative.
    fn give_up(
        &self,
        address: &str,
        waiter_id: u64,
        mut grant_rx: oneshot::Receiver<LockToken>,
    ) -> Result<LockToken, LockError> {
        let removed = {
            let mut state = self.inner.state.lock();
            match state.entries.get_mut(address) {
                Some(entry) => {
                    let before = entry.waiters.len();
                    entry.waiters.retain(|waiter| waiter.id != waiter_id);
                    entry.waiters.len() < before
                }
                None => false,
            }
        };

        if removed {
            return Err(LockError::AcquireTimeout);
        }

        // Not queued anymore: either the grant raced the timeout (sends happen inside the
        // critical section, so it is visible by now) or the registry was closed.
        match grant_rx.try_recv() {
            Ok(token) => {
                debug!(address:%; "lock granted concurrently with timeout, relinquishing");
                let _ = self.finish(address, token, false);
                Err(LockError::AcquireTimeout)
            }
            Err(_) => Err(LockError::Cancelled),
        }
    }

    /// Shared release/expiry path: validate the holder, hand off to the first waiter still
    /// listening and report the transitions.
    fn finish(&self, address: &str, token: LockToken, expiry: bool) -> Result<Duration, LockError> {
        let mut transitions = Vec::with_capacity(2);
        let mut handed_off = None;

        let held_for = {
            let mut state = self.inner.state.lock();

            let Some(entry) = state.entries.get_mut(address) else {
                return Err(stale(token));
            };
            if entry.holder.id != token.id {
                return Err(stale(token));
            }

            let held_for = entry.holder.acquired_at.elapsed();

            let mut next = None;
            while let Some(waiter) = entry.waiters.pop_front() {
                let (holder, next_token) = self.inner.new_holder(waiter.lease_timeout);
                // A send can only fail when the waiter stopped listening; skip to the next.
                if waiter.grant.send(next_token).is_ok() {
                    next = Some((holder, next_token));
                    break;
                }
            }

            match next {
                Some((holder, next_token)) => {
                    entry.holder = holder;
                    handed_off = Some(next_token);
                }
                None => {
                    state.entries.remove(address);
                }
            }

            let change = if expiry {
                LockChange::Expired { held_for }
            } else {
                LockChange::Released { held_for }
            };
            transitions.push(LockTransition {
                address: address.to_owned(),
                change,
                held: state.entries.len(),
            });
            if handed_off.is_some() {
                transitions.push(LockTransition {
                    address: address.to_owned(),
                    change: LockChange::Acquired,
                    held: state.entries.len(),
                });
            }

            held_for
        };

        if let Some(next_token) = handed_off {
            self.spawn_watchdog(address, next_token);
        }
        for transition in transitions {
            self.inner.observe(transition);
        }

        Ok(held_for)
    }

    /// Frees the address at the lease deadline unless the holder released (and possibly
    /// changed) in the meantime.
    fn spawn_watchdog(&self, address: &str, token: LockToken) {
        let Some(deadline) = token.deadline else {
            return;
        };

        let registry = self.clone();
        let address = address.to_owned();
        tokio::spawn(async move {
            time::sleep_until(deadline.into()).await;
            if registry.finish(&address, token, true).is_ok() {
                debug!(address:%; "wallet lock lease expired");
            }
        });
    }
}

impl Inner {
    fn new_holder(&self, lease_timeout: Option<Duration>) -> (Holder, LockToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let acquired_at = Instant::now();
        let deadline = lease_timeout.map(|lease| acquired_at + lease);

        (
            Holder {
                id,
                acquired_at,
                deadline,
            },
            LockToken { id, deadline },
        )
    }

    fn observe(&self, transition: LockTransition) {
        if let Some(observer) = &self.observer {
            observer(transition);
        }
    }
}

fn stale(token: LockToken) -> LockError {
    match token.deadline {
        Some(deadline) if Instant::now() >= deadline => LockError::LeaseExpired,
        _ => LockError::NotHeld,
    }
}
