use std::cmp::Ordering;

use chrono::{NaiveDate, NaiveTime};

use crate::limits::*;
use crate::model::*;

use super::store::lock;
use super::{Engine, EngineError};

impl Engine {
    pub fn get_booking(&self, id: BookingId) -> Result<Booking, EngineError> {
        let shared = self
            .store
            .get_booking(id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let booking = lock(&shared).clone();
        Ok(booking)
    }

    /// Filter, sort and page the bookings. A page past the end comes back
    /// empty with correct totals.
    pub fn list_bookings(&self, filter: &BookingFilter) -> Result<BookingPage, EngineError> {
        if filter.size == 0 || filter.size > MAX_PAGE_SIZE {
            return Err(EngineError::LimitExceeded("page size must be between 1 and 100"));
        }
        let needle = filter
            .search_term
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);
        if needle.as_ref().is_some_and(|n| n.len() > MAX_SEARCH_LEN) {
            return Err(EngineError::LimitExceeded("search term too long"));
        }

        let mut matches: Vec<Booking> = self
            .store
            .booking_handles()
            .iter()
            .map(|b| lock(b).clone())
            .filter(|b| filter.status.is_none_or(|s| b.status == s))
            .filter(|b| needle.as_deref().is_none_or(|n| matches_search(b, n)))
            .collect();

        matches.sort_by(|a, b| {
            let ord = compare_by(a, b, filter.sort_by).then(a.id.cmp(&b.id));
            match filter.sort_direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        });

        let total_elements = matches.len();
        let total_pages = total_elements.div_ceil(filter.size);
        let content: Vec<Booking> = matches
            .into_iter()
            .skip(filter.page.saturating_mul(filter.size))
            .take(filter.size)
            .collect();

        Ok(BookingPage {
            content,
            total_elements,
            total_pages,
            size: filter.size,
            number: filter.page,
            first: filter.page == 0,
            last: filter.page.saturating_add(1) >= total_pages,
        })
    }

    /// Slots on `date` ordered by start time. Empty if none were generated.
    pub fn list_slots(&self, date: NaiveDate) -> Vec<TimeSlot> {
        self.store
            .slot_keys_on(date)
            .iter()
            .filter_map(|key| self.store.get_slot(key))
            .map(|slot| lock(&slot).clone())
            .collect()
    }

    pub fn get_slot(&self, key: SlotKey) -> Result<TimeSlot, EngineError> {
        let shared = self
            .store
            .get_slot(&key)
            .ok_or(EngineError::SlotNotFound(key))?;
        let slot = lock(&shared).clone();
        Ok(slot)
    }

    /// The slot on `date` starting at `start`; the shortest one if several do.
    pub fn resolve_slot(&self, date: NaiveDate, start: NaiveTime) -> Option<SlotKey> {
        self.store
            .slot_keys_on(date)
            .into_iter()
            .find(|key| key.window.start == start)
    }

    /// Dashboard counters. `day` selects which demo date counts as scheduled.
    pub fn booking_stats(&self, day: NaiveDate) -> BookingStats {
        let mut stats = BookingStats::default();
        for shared in self.store.booking_handles() {
            let booking = lock(&shared);
            stats.total += 1;
            match booking.status {
                BookingStatus::Pending => stats.pending += 1,
                BookingStatus::Approved => stats.approved += 1,
                BookingStatus::Rejected => stats.rejected += 1,
                BookingStatus::Cancelled => stats.cancelled += 1,
                BookingStatus::Completed => stats.completed += 1,
            }
            if booking.demo_date == day && booking.status.holds_reservation() {
                stats.scheduled_on_day += 1;
            }
        }
        stats
    }
}

fn compare_by(a: &Booking, b: &Booking, field: SortField) -> Ordering {
    match field {
        SortField::CreatedOn => a.created_on.cmp(&b.created_on),
        SortField::DemoDate => (a.demo_date, a.time_slot).cmp(&(b.demo_date, b.time_slot)),
        SortField::FullName => a
            .customer
            .full_name
            .to_lowercase()
            .cmp(&b.customer.full_name.to_lowercase()),
        SortField::Status => a.status.as_str().cmp(b.status.as_str()),
        SortField::Id => a.id.cmp(&b.id),
    }
}

/// Case-insensitive substring match; `needle` is already lowercase.
fn matches_search(b: &Booking, needle: &str) -> bool {
    [
        b.customer.full_name.as_str(),
        b.customer.email.as_str(),
        b.customer.mobile_number.as_str(),
        b.address.city.as_str(),
        b.product.id.as_str(),
        b.product.name.as_str(),
        b.product.brand.as_str(),
    ]
    .iter()
    .any(|field| field.to_lowercase().contains(needle))
}
