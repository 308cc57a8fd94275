use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Unix milliseconds. Every timestamp in the crate uses this.
pub type Ms = i64;

/// Opaque booking identity, assigned by the engine and never reused.
pub type BookingId = u64;

/// Daily half-open window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeWindow start must be before end");
        Self { start, end }
    }

    /// Whole-hour window, e.g. `TimeWindow::hours(10, 11)`.
    pub fn hours(start: u32, end: u32) -> Option<Self> {
        let start = NaiveTime::from_hms_opt(start, 0, 0)?;
        let end = NaiveTime::from_hms_opt(end, 0, 0)?;
        (start < end).then(|| Self::new(start, end))
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    /// Parse `HH:MM-HH:MM` (seconds optional on either side).
    pub fn parse(s: &str) -> Option<Self> {
        let (start, end) = s.split_once('-')?;
        let start = parse_time_of_day(start.trim())?;
        let end = parse_time_of_day(end.trim())?;
        (start < end).then(|| Self::new(start, end))
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

/// The three daily demo windows: 10:00, 13:00 and 16:00, one hour each.
pub fn default_windows() -> Vec<TimeWindow> {
    [(10, 11), (13, 14), (16, 17)]
        .into_iter()
        .filter_map(|(start, end)| TimeWindow::hours(start, end))
        .collect()
}

/// Identity of one capacity unit pool: a window on a calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub window: TimeWindow,
}

impl SlotKey {
    pub fn new(date: NaiveDate, window: TimeWindow) -> Self {
        Self { date, window }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date, self.window)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub key: SlotKey,
    pub total_capacity: u32,
    pub reserved_count: u32,
}

impl TimeSlot {
    pub fn new(key: SlotKey, total_capacity: u32) -> Self {
        Self {
            key,
            total_capacity,
            reserved_count: 0,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.key.date
    }

    pub fn start_time(&self) -> NaiveTime {
        self.key.window.start
    }

    pub fn end_time(&self) -> NaiveTime {
        self.key.window.end
    }

    pub fn available(&self) -> bool {
        self.reserved_count < self.total_capacity
    }

    pub fn remaining(&self) -> u32 {
        self.total_capacity.saturating_sub(self.reserved_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Approved => "APPROVED",
            BookingStatus::Rejected => "REJECTED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Completed => "COMPLETED",
        }
    }

    /// Case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(BookingStatus::Pending),
            "APPROVED" => Some(BookingStatus::Approved),
            "REJECTED" => Some(BookingStatus::Rejected),
            "CANCELLED" => Some(BookingStatus::Cancelled),
            "COMPLETED" => Some(BookingStatus::Completed),
            _ => None,
        }
    }

    /// Statuses under which a booking still holds its slot unit.
    pub fn holds_reservation(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Approved)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An admin decision on a pending booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn target(&self) -> BookingStatus {
        match self {
            Decision::Approve => BookingStatus::Approved,
            Decision::Reject => BookingStatus::Rejected,
        }
    }

    /// Maps `APPROVED`/`APPROVE` and `REJECTED`/`REJECT` (any case).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "APPROVE" | "APPROVED" => Some(Decision::Approve),
            "REJECT" | "REJECTED" => Some(Decision::Reject),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        }
    }
}

/// Identity recorded as having made a decision. Always passed explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor(String);

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub full_name: String,
    pub email: String,
    pub mobile_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub address_line: String,
    pub pincode: String,
    pub city: String,
    pub landmark: Option<String>,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub brand: String,
}

/// Intake payload: everything about a booking except what the engine assigns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBooking {
    pub customer: Customer,
    pub address: Address,
    pub product: Product,
    pub demo_date: NaiveDate,
    pub time_slot: TimeWindow,
}

impl NewBooking {
    pub fn slot_key(&self) -> SlotKey {
        SlotKey::new(self.demo_date, self.time_slot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub customer: Customer,
    pub address: Address,
    pub product: Product,
    pub demo_date: NaiveDate,
    pub time_slot: TimeWindow,
    pub status: BookingStatus,
    pub admin_comments: Option<String>,
    pub processed_by: Option<Actor>,
    pub created_on: Ms,
    pub updated_on: Option<Ms>,
    pub approved_on: Option<Ms>,
    pub rejected_on: Option<Ms>,
}

impl Booking {
    pub fn new(id: BookingId, intake: NewBooking, created_on: Ms) -> Self {
        Self {
            id,
            customer: intake.customer,
            address: intake.address,
            product: intake.product,
            demo_date: intake.demo_date,
            time_slot: intake.time_slot,
            status: BookingStatus::Pending,
            admin_comments: None,
            processed_by: None,
            created_on,
            updated_on: None,
            approved_on: None,
            rejected_on: None,
        }
    }

    pub fn slot_key(&self) -> SlotKey {
        SlotKey::new(self.demo_date, self.time_slot)
    }
}

// ── Listing ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    CreatedOn,
    DemoDate,
    FullName,
    Status,
    Id,
}

impl SortField {
    /// Accepts the camelCase names of the admin API and snake_case column names.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('_', "").as_str() {
            "createdon" => Some(SortField::CreatedOn),
            "demodate" => Some(SortField::DemoDate),
            "fullname" => Some(SortField::FullName),
            "status" => Some(SortField::Status),
            "id" => Some(SortField::Id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ASC" => Some(SortDirection::Asc),
            "DESC" => Some(SortDirection::Desc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingFilter {
    pub status: Option<BookingStatus>,
    pub search_term: Option<String>,
    pub page: usize,
    pub size: usize,
    pub sort_by: SortField,
    pub sort_direction: SortDirection,
}

impl Default for BookingFilter {
    fn default() -> Self {
        Self {
            status: None,
            search_term: None,
            page: 0,
            size: 10,
            sort_by: SortField::default(),
            sort_direction: SortDirection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingPage {
    pub content: Vec<Booking>,
    pub total_elements: usize,
    pub total_pages: usize,
    pub size: usize,
    pub number: usize,
    pub first: bool,
    pub last: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BookingStats {
    pub total: usize,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub cancelled: usize,
    pub completed: usize,
    /// Pending or approved bookings whose demo falls on the requested day.
    pub scheduled_on_day: usize,
}

// ── WAL ──────────────────────────────────────────────────────────

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotGenerated {
        key: SlotKey,
        capacity: u32,
    },
    SlotReserved {
        key: SlotKey,
    },
    SlotReleased {
        key: SlotKey,
    },
    /// Also consumes one unit of the booking's slot.
    BookingCreated {
        booking: Booking,
    },
    /// A reject also releases the booking's slot unit.
    BookingDecided {
        id: BookingId,
        decision: Decision,
        actor: Actor,
        comments: Option<String>,
        at: Ms,
    },
    /// Compaction record: a slot exactly as it stood, reservations included.
    SlotRestored {
        slot: TimeSlot,
    },
    /// Compaction record: a booking exactly as it stood. No capacity effect.
    BookingRestored {
        booking: Booking,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn default_windows_are_the_three_demo_hours() {
        let windows = default_windows();
        let rendered: Vec<String> = windows.iter().map(|w| w.to_string()).collect();
        assert_eq!(rendered, vec!["10:00-11:00", "13:00-14:00", "16:00-17:00"]);
    }

    #[test]
    fn window_parse() {
        let w = TimeWindow::parse("10:00-11:00").unwrap();
        assert_eq!(w, TimeWindow::hours(10, 11).unwrap());
        let w = TimeWindow::parse("13:00:00 - 14:00:00").unwrap();
        assert_eq!(w, TimeWindow::hours(13, 14).unwrap());
        assert!(TimeWindow::parse("11:00-10:00").is_none()); // inverted
        assert!(TimeWindow::parse("10:00").is_none());
        assert!(TimeWindow::parse("25:00-26:00").is_none());
    }

    #[test]
    fn window_hours_rejects_empty() {
        assert!(TimeWindow::hours(10, 10).is_none());
        assert!(TimeWindow::hours(24, 25).is_none());
    }

    #[test]
    fn slot_derived_fields() {
        let key = SlotKey::new(date("2025-06-20"), TimeWindow::hours(10, 11).unwrap());
        let mut slot = TimeSlot::new(key, 5);
        assert!(slot.available());
        assert_eq!(slot.remaining(), 5);

        slot.reserved_count = 5;
        assert!(!slot.available());
        assert_eq!(slot.remaining(), 0);
    }

    #[test]
    fn slot_keys_order_by_date_then_start() {
        let d1 = date("2025-06-20");
        let d2 = date("2025-06-21");
        let mut keys = vec![
            SlotKey::new(d2, TimeWindow::hours(10, 11).unwrap()),
            SlotKey::new(d1, TimeWindow::hours(16, 17).unwrap()),
            SlotKey::new(d1, TimeWindow::hours(10, 11).unwrap()),
        ];
        keys.sort();
        assert_eq!(keys[0].date, d1);
        assert_eq!(keys[0].window.start, NaiveTime::from_hms_opt(10, 0, 0).unwrap());
        assert_eq!(keys[1].window.start, NaiveTime::from_hms_opt(16, 0, 0).unwrap());
        assert_eq!(keys[2].date, d2);
    }

    #[test]
    fn status_parse_case_insensitive() {
        assert_eq!(BookingStatus::parse("pending"), Some(BookingStatus::Pending));
        assert_eq!(BookingStatus::parse("COMPLETED"), Some(BookingStatus::Completed));
        assert_eq!(BookingStatus::parse("archived"), None);
        assert_eq!(BookingStatus::Approved.to_string(), "APPROVED");
    }

    #[test]
    fn status_reservation_holders() {
        assert!(BookingStatus::Pending.holds_reservation());
        assert!(BookingStatus::Approved.holds_reservation());
        assert!(!BookingStatus::Rejected.holds_reservation());
        assert!(!BookingStatus::Cancelled.holds_reservation());
    }

    #[test]
    fn decision_targets() {
        assert_eq!(Decision::Approve.target(), BookingStatus::Approved);
        assert_eq!(Decision::Reject.target(), BookingStatus::Rejected);
        assert_eq!(Decision::parse("approved"), Some(Decision::Approve));
        assert_eq!(Decision::parse("REJECT"), Some(Decision::Reject));
        assert_eq!(Decision::parse("PENDING"), None);
    }

    #[test]
    fn sort_field_accepts_both_spellings() {
        assert_eq!(SortField::parse("createdOn"), Some(SortField::CreatedOn));
        assert_eq!(SortField::parse("created_on"), Some(SortField::CreatedOn));
        assert_eq!(SortField::parse("demo_date"), Some(SortField::DemoDate));
        assert_eq!(SortField::parse("price"), None);
    }

    #[test]
    fn filter_defaults_match_admin_api() {
        let f = BookingFilter::default();
        assert_eq!(f.page, 0);
        assert_eq!(f.size, 10);
        assert_eq!(f.sort_by, SortField::CreatedOn);
        assert_eq!(f.sort_direction, SortDirection::Desc);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingDecided {
            id: 7,
            decision: Decision::Reject,
            actor: Actor::new("admin@lilypad.com"),
            comments: Some("duplicate request".into()),
            at: 1_750_000_000_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
