//! Hard bounds on caller input. Anything past these is `LimitExceeded`.

/// Longest inclusive date range a single generation call may cover.
pub const MAX_GENERATE_DAYS: i64 = 366;

/// Windows per day accepted by one generation call.
pub const MAX_WINDOWS_PER_DAY: usize = 24;

/// Largest capacity a generated slot may carry.
pub const MAX_SLOT_CAPACITY: u32 = 10_000;

/// Largest page a listing may request.
pub const MAX_PAGE_SIZE: usize = 100;

/// Longest accepted text field on intake (names, address parts, product fields).
pub const MAX_FIELD_LEN: usize = 512;

/// Longest search term accepted by listings.
pub const MAX_SEARCH_LEN: usize = 256;

/// Largest WAL record accepted on replay. Guards the length prefix.
pub const MAX_WAL_RECORD_LEN: usize = 1 << 20;
