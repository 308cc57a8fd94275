use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::model::*;
use crate::observability::*;

use super::lifecycle::{apply_decision, check_transition, now_ms, validate_intake};
use super::store::lock;
use super::{Engine, EngineError, ledger};

impl Engine {
    /// Create one slot per (date, window) in `[start, end]`, skipping keys
    /// that already exist. Returns how many slots were created.
    ///
    /// Regenerating an overlapping range never duplicates a slot or resets
    /// its reservations, so a call that fails part way is safe to retry.
    pub fn generate_slots(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        windows: &[TimeWindow],
        capacity: u32,
    ) -> Result<usize, EngineError> {
        let keys = ledger::plan_generation(start, end, windows, capacity)?;

        let created = {
            let _gate = self.gate_shared();
            let _generating = lock(&self.generate_lock);
            let mut created = 0usize;
            for key in keys {
                if self.store.contains_slot(&key) {
                    continue;
                }
                self.wal_append(&Event::SlotGenerated { key, capacity })?;
                self.store.insert_slot(TimeSlot::new(key, capacity));
                created += 1;
            }
            created
        };

        metrics::counter!(SLOTS_GENERATED_TOTAL).increment(created as u64);
        info!("generated {created} time slots for {start}..={end} (capacity {capacity})");
        self.maybe_compact();
        Ok(created)
    }

    /// Take one unit of capacity. Fails with `SlotFull` at capacity.
    pub fn reserve_slot(&self, key: SlotKey) -> Result<TimeSlot, EngineError> {
        let slot = {
            let _gate = self.gate_shared();
            let shared = self
                .store
                .get_slot(&key)
                .ok_or(EngineError::SlotNotFound(key))?;
            let mut slot = lock(&shared);
            if let Err(e) = ledger::check_reserve(&slot) {
                metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "full").increment(1);
                debug!("reserve refused on full slot {key}");
                return Err(e);
            }
            self.wal_append(&Event::SlotReserved { key })?;
            ledger::apply_reserve(&mut slot);
            slot.clone()
        };

        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "ok").increment(1);
        self.maybe_compact();
        Ok(slot)
    }

    /// Give back one unit of capacity. Releasing an empty slot is a no-op.
    pub fn release_slot(&self, key: SlotKey) -> Result<TimeSlot, EngineError> {
        let slot = {
            let _gate = self.gate_shared();
            let shared = self
                .store
                .get_slot(&key)
                .ok_or(EngineError::SlotNotFound(key))?;
            let mut slot = lock(&shared);
            if slot.reserved_count == 0 {
                debug!("release on empty slot {key} ignored");
                return Ok(slot.clone());
            }
            self.wal_append(&Event::SlotReleased { key })?;
            ledger::apply_release(&mut slot);
            slot.clone()
        };

        metrics::counter!(RELEASES_TOTAL).increment(1);
        self.maybe_compact();
        Ok(slot)
    }

    /// Reserve the booking's slot and record it as PENDING, as one unit.
    /// Nothing is recorded when the slot is missing or full.
    pub fn create_booking(&self, intake: NewBooking) -> Result<Booking, EngineError> {
        validate_intake(&intake)?;
        let key = intake.slot_key();

        let booking = {
            let _gate = self.gate_shared();
            let shared = self
                .store
                .get_slot(&key)
                .ok_or(EngineError::SlotNotFound(key))?;
            let mut slot = lock(&shared);
            if let Err(e) = ledger::check_reserve(&slot) {
                metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "full").increment(1);
                debug!("booking refused on full slot {key}");
                return Err(e);
            }

            let booking = Booking::new(self.store.allocate_booking_id(), intake, now_ms());
            self.wal_append(&Event::BookingCreated {
                booking: booking.clone(),
            })?;
            ledger::apply_reserve(&mut slot);
            // Published while the slot is still locked: nobody sees the
            // reservation without its booking.
            self.store.insert_booking(booking.clone());
            booking
        };

        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "ok").increment(1);
        metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
        info!("booking {} created on slot {key}", booking.id);
        self.maybe_compact();
        Ok(booking)
    }

    /// Approve or reject a PENDING booking. A reject frees its slot unit in
    /// the same step; an approve keeps it consumed.
    pub fn decide_booking(
        &self,
        id: BookingId,
        decision: Decision,
        actor: &Actor,
        comments: Option<String>,
    ) -> Result<Booking, EngineError> {
        let (updated, released) = {
            let _gate = self.gate_shared();
            let shared = self
                .store
                .get_booking(id)
                .ok_or(EngineError::BookingNotFound(id))?;
            let mut booking = lock(&shared);
            check_transition(booking.status, decision)?;

            let slot = match decision {
                Decision::Approve => None,
                Decision::Reject => {
                    let slot = self.store.get_slot(&booking.slot_key());
                    if slot.is_none() {
                        warn!("booking {id} holds missing slot {}", booking.slot_key());
                    }
                    slot
                }
            };
            let mut slot = slot.as_deref().map(lock);

            let at = now_ms();
            self.wal_append(&Event::BookingDecided {
                id,
                decision,
                actor: actor.clone(),
                comments: comments.clone(),
                at,
            })?;
            apply_decision(&mut booking, decision, actor.clone(), comments, at);
            let released = slot.as_deref_mut().is_some_and(ledger::apply_release);
            (booking.clone(), released)
        };

        metrics::counter!(DECISIONS_TOTAL, "decision" => decision.as_str()).increment(1);
        if released {
            metrics::counter!(RELEASES_TOTAL).increment(1);
        }
        info!("booking {id} {} by {actor}", updated.status);
        self.maybe_compact();
        Ok(updated)
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.gate_exclusive();
        let events = self.store.snapshot_events();
        lock(&self.wal)
            .compact(&events)
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted WAL to {} events", events.len());
        Ok(())
    }
}
