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

use crate::domain::{
    ChainKey, ChainName, RebalanceInstruction, SharedSnapshot, TransferReceipt,
};
use parking_lot::RwLock;
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

/// A chain-scoped event. Events are serialized in emission order within one chain wallet
/// manager; across managers there is no ordering. Payloads are value copies, so subscribers
/// can keep them without holding any manager state alive.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    /// Emitted after every completed refresh, even when nothing changed.
    Balances {
        key: ChainKey,
        new: SharedSnapshot,
        previous: SharedSnapshot,
    },

    /// A background failure inside a chain manager, e.g. a single wallet refresh going wrong.
    Error { chain: ChainName, message: String },

    RebalanceStarted {
        key: ChainKey,
        strategy: String,
        instructions: Vec<RebalanceInstruction>,
    },

    /// Carries the receipts of the instructions that succeeded.
    RebalanceFinished {
        key: ChainKey,
        strategy: String,
        receipts: Vec<TransferReceipt>,
    },

    RebalanceError {
        key: ChainKey,
        strategy: String,
        instruction: RebalanceInstruction,
        message: String,
    },

    /// Count of currently-held wallets, recomputed on every lock transition.
    ActiveWalletsCount { key: ChainKey, count: usize },

    /// Emitted at release (or lease expiry) with the time the wallet was held.
    WalletsLockPeriod {
        key: ChainKey,
        address: String,
        held_for: Duration,
    },
}

impl FleetEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            FleetEvent::Balances { .. } => EventKind::Balances,
            FleetEvent::Error { .. } => EventKind::Error,
            FleetEvent::RebalanceStarted { .. } => EventKind::RebalanceStarted,
            FleetEvent::RebalanceFinished { .. } => EventKind::RebalanceFinished,
            FleetEvent::RebalanceError { .. } => EventKind::RebalanceError,
            FleetEvent::ActiveWalletsCount { .. } => EventKind::ActiveWalletsCount,
            FleetEvent::WalletsLockPeriod { .. } => EventKind::WalletsLockPeriod,
        }
    }

    pub fn chain(&self) -> ChainName {
        match self {
            FleetEvent::Error { chain, .. } => *chain,
            FleetEvent::Balances { key, .. }
            | FleetEvent::RebalanceStarted { key, .. }
            | FleetEvent::RebalanceFinished { key, .. }
            | FleetEvent::RebalanceError { key, .. }
            | FleetEvent::ActiveWalletsCount { key, .. }
            | FleetEvent::WalletsLockPeriod { key, .. } => key.chain(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Balances,
    Error,
    RebalanceStarted,
    RebalanceFinished,
    RebalanceError,
    ActiveWalletsCount,
    WalletsLockPeriod,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Balances => "balances",
            EventKind::Error => "error",
            EventKind::RebalanceStarted => "rebalance-started",
            EventKind::RebalanceFinished => "rebalance-finished",
            EventKind::RebalanceError => "rebalance-error",
            EventKind::ActiveWalletsCount => "active-wallets-count",
            EventKind::WalletsLockPeriod => "wallets-lock-period",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emit-only capability handed to a chain wallet manager. Managers never see the bus or the
/// orchestrator behind it, which keeps the reference graph acyclic.
pub type EventSink = Arc<dyn Fn(FleetEvent) + Send + Sync>;

type Handler = Box<dyn Fn(&FleetEvent) + Send + Sync>;

/// Typed event dispatcher. Handlers register per event kind (or for all kinds) and run
/// synchronously on the emitting task, so a slow subscriber slows emission; subscribers must
/// not perform I/O inline.
#[derive(Default)]
pub struct EventBus {
    by_kind: RwLock<HashMap<EventKind, Vec<Handler>>>,
    any: RwLock<Vec<Handler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind.
    pub fn on(&self, kind: EventKind, handler: impl Fn(&FleetEvent) + Send + Sync + 'static) {
        self.by_kind
            .write()
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    /// Register a handler for every event kind.
    pub fn on_any(&self, handler: impl Fn(&FleetEvent) + Send + Sync + 'static) {
        self.any.write().push(Box::new(handler));
    }

    pub fn emit(&self, event: &FleetEvent) {
        for handler in self.any.read().iter() {
            handler(event);
        }

        if let Some(handlers) = self.by_kind.read().get(&event.kind()) {
            for handler in handlers {
                handler(event);
            }
        }
    }

    /// The emit-only view of this bus, for wiring into a chain wallet manager.
    pub fn sink(self: &Arc<Self>) -> EventSink {
        let bus = self.clone();
        Arc::new(move |event| bus.emit(&event))
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::{ChainKey, ChainName, EventBus, EventKind, FleetEvent};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    fn key() -> ChainKey {
        ChainKey::new(ChainName::Ethereum, ChainName::Ethereum.default_network())
    }

    #[test]
    fn test_kind_names() {
        let event = FleetEvent::ActiveWalletsCount { key: key(), count: 0 };
        assert_eq!(event.kind().to_string(), "active-wallets-count");
        assert_eq!(event.chain(), ChainName::Ethereum);
    }

    #[test]
    fn test_bus_dispatch() {
        let bus = Arc::new(EventBus::new());

        let by_kind = Arc::new(AtomicUsize::new(0));
        let any = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::ActiveWalletsCount, {
            let by_kind = by_kind.clone();
            move |_| {
                by_kind.fetch_add(1, Ordering::SeqCst);
            }
        });
        bus.on_any({
            let any = any.clone();
            move |_| {
                any.fetch_add(1, Ordering::SeqCst);
            }
        });

        let sink = bus.sink();
        sink(FleetEvent::ActiveWalletsCount { key: key(), count: 1 });
        sink(FleetEvent::Error {
            chain: ChainName::Ethereum,
            message: "boom".to_owned(),
        });

        assert_eq!(by_kind.load(Ordering::SeqCst), 1);
        assert_eq!(any.load(Ordering::SeqCst), 2);
    }
}
