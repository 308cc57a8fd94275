mod error;
mod ledger;
mod lifecycle;
mod mutations;
mod queries;
mod store;

pub use error::EngineError;
pub use store::InMemoryStore;

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::info;

use crate::model::*;
use crate::wal::Wal;

use store::lock;

pub type SharedBooking = Arc<Mutex<Booking>>;
pub type SharedSlot = Arc<Mutex<TimeSlot>>;

/// Booking lifecycle and slot capacity ledger over one durable event log.
///
/// Every public operation is synchronous and runs to completion on the
/// caller's thread. Locks are always taken in the order
/// commit gate → booking → slot → WAL.
pub struct Engine {
    pub(super) store: InMemoryStore,
    wal: Mutex<Wal>,
    /// Mutations hold this shared; compaction holds it exclusively.
    commit_gate: RwLock<()>,
    /// Serializes slot generation so exists-check and insert are one step.
    generate_lock: Mutex<()>,
    /// Compact once this many events were appended since the last compaction. 0 = never.
    compact_threshold: u64,
}

impl Engine {
    pub fn new(wal_path: PathBuf, compact_threshold: u64) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;

        let store = InMemoryStore::new();
        for event in &events {
            store.apply_event(event);
        }
        info!(
            "replayed {} events from {}: {} slots, {} bookings",
            events.len(),
            wal_path.display(),
            store.slot_count(),
            store.booking_count()
        );

        Ok(Self {
            store,
            wal: Mutex::new(wal),
            commit_gate: RwLock::new(()),
            generate_lock: Mutex::new(()),
            compact_threshold,
        })
    }

    fn gate_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.commit_gate.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Durably log one event. Callers apply it only after this returns Ok.
    fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let started = std::time::Instant::now();
        let result = lock(&self.wal)
            .append(event)
            .map_err(|e| EngineError::WalError(e.to_string()));
        metrics::histogram!(crate::observability::WAL_APPEND_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    pub fn wal_appends_since_compact(&self) -> u64 {
        lock(&self.wal).appends_since_compact()
    }

    /// Compact inline once the log has grown past the threshold.
    /// Call with no locks held.
    fn maybe_compact(&self) {
        if self.compact_threshold == 0 || self.wal_appends_since_compact() < self.compact_threshold {
            return;
        }
        if let Err(e) = self.compact_wal() {
            tracing::warn!("WAL compaction failed: {e}");
        }
    }
}
