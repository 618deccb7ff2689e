use chrono::NaiveDate;

/// Longest stay accepted in one reservation.
pub const MAX_STAY_NIGHTS: i64 = 366;

pub const MAX_GUESTS_PER_BOOKING: u32 = 64;

pub const MAX_EXTRAS_PER_BOOKING: usize = 32;
pub const MAX_EXTRA_QUANTITY: u32 = 100;
pub const MAX_ADD_ONS_PER_BOOKING: usize = 32;

/// Applies to house, extra, facility and guest names.
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 256;
pub const MAX_BLACKOUT_REASON_LEN: usize = 1024;

/// Blocking stays + blackouts kept in a single house's interval list.
pub const MAX_INTERVALS_PER_HOUSE: usize = 100_000;

pub const MAX_HOUSES: usize = 10_000;

/// Upper bound for any catalog price (house night, extra unit, facility,
/// fill option).
pub const MAX_PRICE: i64 = 1_000_000_000;

/// Query windows longer than this are rejected before touching the store.
pub const MAX_QUERY_NIGHTS: i64 = 366;

pub fn min_valid_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(NaiveDate::MIN)
}

pub fn max_valid_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2100, 12, 31).unwrap_or(NaiveDate::MAX)
}
