//! Capacity rules for a single slot. Callers hold the slot's lock.

use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Refuse a reservation on a slot with no remaining capacity.
pub(crate) fn check_reserve(slot: &TimeSlot) -> Result<(), EngineError> {
    if slot.available() {
        Ok(())
    } else {
        Err(EngineError::SlotFull(slot.key))
    }
}

/// Increment with ceiling. Never exceeds `total_capacity`.
pub(crate) fn apply_reserve(slot: &mut TimeSlot) {
    slot.reserved_count = (slot.reserved_count + 1).min(slot.total_capacity);
}

/// Decrement floored at zero. Returns false when there was nothing to release.
pub(crate) fn apply_release(slot: &mut TimeSlot) -> bool {
    if slot.reserved_count == 0 {
        return false;
    }
    slot.reserved_count -= 1;
    true
}

/// Expand a generation request into the slot keys it covers, date-major,
/// windows ascending. Duplicate windows collapse.
pub(crate) fn plan_generation(
    start: NaiveDate,
    end: NaiveDate,
    windows: &[TimeWindow],
    capacity: u32,
) -> Result<Vec<SlotKey>, EngineError> {
    if start > end {
        return Err(EngineError::InvalidRange(format!(
            "start date {start} is after end date {end}"
        )));
    }
    if end.signed_duration_since(start).num_days() + 1 > MAX_GENERATE_DAYS {
        return Err(EngineError::LimitExceeded("date range too long"));
    }
    if windows.is_empty() {
        return Err(EngineError::InvalidRange("no daily windows given".into()));
    }
    if windows.len() > MAX_WINDOWS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many daily windows"));
    }
    if let Some(bad) = windows.iter().find(|w| !w.is_valid()) {
        return Err(EngineError::InvalidRange(format!(
            "window {bad} does not end after it starts"
        )));
    }
    if capacity == 0 || capacity > MAX_SLOT_CAPACITY {
        return Err(EngineError::LimitExceeded("slot capacity out of range"));
    }

    let mut windows = windows.to_vec();
    windows.sort();
    windows.dedup();

    Ok(start
        .iter_days()
        .take_while(|d| *d <= end)
        .flat_map(|date| windows.iter().map(move |w| SlotKey::new(date, *w)))
        .collect())
}
