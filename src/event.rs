//! Lifecycle telemetry emitted around every dispatched request.
//!
//! Events are observational: subscribers cannot influence dispatch, and a
//! panicking subscriber is isolated and logged rather than letting one bad
//! observer break the engine.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

/// A telemetry event.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    /// Monotonic per-engine sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event was emitted.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: TelemetryKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryKind {
    /// A request was dispatched (once per key lifecycle, not per caller).
    Start { key: String, endpoint: String },
    Success {
        key: String,
        endpoint: String,
        duration_ms: u64,
    },
    Error {
        key: String,
        endpoint: String,
        duration_ms: u64,
        message: String,
    },
    /// Terminal marker, emitted after Success or Error on every path.
    Complete { key: String, endpoint: String },
}

impl TelemetryKind {
    pub fn key(&self) -> &str {
        match self {
            TelemetryKind::Start { key, .. }
            | TelemetryKind::Success { key, .. }
            | TelemetryKind::Error { key, .. }
            | TelemetryKind::Complete { key, .. } => key,
        }
    }
}

type Subscriber = Arc<dyn Fn(&TelemetryEvent) + Send + Sync>;

/// Observer registration and fan-out.
pub struct TelemetryBus {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

impl TelemetryBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Register an observer. The returned handle removes it again; dropping
    /// the handle without calling `unsubscribe` keeps the subscription
    /// alive.
    pub fn subscribe<F>(self: &Arc<Self>, f: F) -> TelemetrySubscription
    where
        F: Fn(&TelemetryEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .insert(id, Arc::new(f));
        TelemetrySubscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    /// Stamp and fan out an event. Subscriber panics are caught so dispatch
    /// is never disturbed by an observer.
    pub fn emit(&self, kind: TelemetryKind) {
        let event = TelemetryEvent {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            kind,
        };
        // Snapshot outside the callbacks so a subscriber may re-enter the bus.
        let snapshot: Vec<(u64, Subscriber)> = self
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .iter()
            .map(|(id, subscriber)| (*id, Arc::clone(subscriber)))
            .collect();
        for (id, subscriber) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&event))).is_err() {
                warn!(subscriber = id, "telemetry subscriber panicked, event dropped for it");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .len()
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`TelemetryBus::subscribe`].
pub struct TelemetrySubscription {
    id: u64,
    bus: Weak<TelemetryBus>,
}

impl TelemetrySubscription {
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers
                .lock()
                .expect("subscriber lock poisoned")
                .remove(&self.id);
        }
    }
}
