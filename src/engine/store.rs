use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::NaiveDate;
use dashmap::DashMap;

use crate::model::*;

use super::{SharedBooking, SharedSlot, ledger, lifecycle};

/// Lock an entity, recovering the data if a previous holder panicked.
/// Every mutation validates before it writes, so a poisoned guard never
/// holds a half-applied state.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Arena of bookings plus the slot index they refer to by key.
pub struct InMemoryStore {
    bookings: DashMap<BookingId, SharedBooking>,
    slots: DashMap<SlotKey, SharedSlot>,
    /// Date → slot keys on that date, kept sorted.
    slots_by_date: DashMap<NaiveDate, Vec<SlotKey>>,
    next_booking_id: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            bookings: DashMap::new(),
            slots: DashMap::new(),
            slots_by_date: DashMap::new(),
            next_booking_id: AtomicU64::new(1),
        }
    }

    // ── Bookings ─────────────────────────────────────────────

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    pub fn get_booking(&self, id: BookingId) -> Option<SharedBooking> {
        self.bookings.get(&id).map(|e| e.value().clone())
    }

    pub fn allocate_booking_id(&self) -> BookingId {
        self.next_booking_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert_booking(&self, booking: Booking) {
        self.next_booking_id
            .fetch_max(booking.id + 1, Ordering::SeqCst);
        self.bookings
            .insert(booking.id, Arc::new(Mutex::new(booking)));
    }

    /// Handles to every booking. The map's shard locks are released before
    /// return, so callers may lock the handles freely.
    pub fn booking_handles(&self) -> Vec<SharedBooking> {
        self.bookings.iter().map(|e| e.value().clone()).collect()
    }

    // ── Slots ────────────────────────────────────────────────

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn contains_slot(&self, key: &SlotKey) -> bool {
        self.slots.contains_key(key)
    }

    pub fn get_slot(&self, key: &SlotKey) -> Option<SharedSlot> {
        self.slots.get(key).map(|e| e.value().clone())
    }

    /// Insert a slot and index it under its date. An existing key is left alone.
    pub fn insert_slot(&self, slot: TimeSlot) {
        let key = slot.key;
        if self.slots.contains_key(&key) {
            return;
        }
        self.slots.insert(key, Arc::new(Mutex::new(slot)));
        let mut keys = self.slots_by_date.entry(key.date).or_default();
        if let Err(pos) = keys.binary_search(&key) {
            keys.insert(pos, key);
        }
    }

    pub fn slot_keys_on(&self, date: NaiveDate) -> Vec<SlotKey> {
        self.slots_by_date
            .get(&date)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Every slot key, ascending.
    pub fn slot_keys(&self) -> Vec<SlotKey> {
        let mut keys: Vec<SlotKey> = self.slots.iter().map(|e| *e.key()).collect();
        keys.sort();
        keys
    }

    // ── Event application ────────────────────────────────────

    /// Apply a replayed event. Live mutations apply the same rules directly
    /// on the guards they already hold.
    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::SlotGenerated { key, capacity } => {
                self.insert_slot(TimeSlot::new(*key, *capacity));
            }
            Event::SlotRestored { slot } => {
                self.insert_slot(slot.clone());
            }
            Event::SlotReserved { key } => {
                if let Some(slot) = self.get_slot(key) {
                    ledger::apply_reserve(&mut lock(&slot));
                }
            }
            Event::SlotReleased { key } => {
                if let Some(slot) = self.get_slot(key) {
                    ledger::apply_release(&mut lock(&slot));
                }
            }
            Event::BookingCreated { booking } => {
                match self.get_slot(&booking.slot_key()) {
                    Some(slot) => ledger::apply_reserve(&mut lock(&slot)),
                    None => tracing::warn!(
                        "replay: booking {} refers to missing slot {}",
                        booking.id,
                        booking.slot_key()
                    ),
                }
                self.insert_booking(booking.clone());
            }
            Event::BookingRestored { booking } => {
                self.insert_booking(booking.clone());
            }
            Event::BookingDecided {
                id,
                decision,
                actor,
                comments,
                at,
            } => {
                let Some(shared) = self.get_booking(*id) else {
                    tracing::warn!("replay: decision for unknown booking {id}");
                    return;
                };
                let mut booking = lock(&shared);
                lifecycle::apply_decision(&mut booking, *decision, actor.clone(), comments.clone(), *at);
                if *decision == Decision::Reject
                    && let Some(slot) = self.get_slot(&booking.slot_key())
                {
                    ledger::apply_release(&mut lock(&slot));
                }
            }
        }
    }

    /// Minimal event list that recreates the current state verbatim.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.slot_count() + self.booking_count());
        for key in self.slot_keys() {
            if let Some(slot) = self.get_slot(&key) {
                events.push(Event::SlotRestored {
                    slot: lock(&slot).clone(),
                });
            }
        }
        let mut bookings: Vec<Booking> = self
            .booking_handles()
            .iter()
            .map(|b| lock(b).clone())
            .collect();
        bookings.sort_by_key(|b| b.id);
        events.extend(
            bookings
                .into_iter()
                .map(|booking| Event::BookingRestored { booking }),
        );
        events
    }
}
