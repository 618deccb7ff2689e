use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type HouseId = u32;
pub type ExtraId = u32;
pub type FacilityId = u32;
pub type FillOptionId = u32;

/// Half-open date interval `[check_in, check_out)`.
///
/// The check-out date itself is free for the next stay, so a reservation
/// ending on the 12th never collides with one starting on the 12th.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StayWindow {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl StayWindow {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Self {
        debug_assert!(check_in < check_out, "check_in must be before check_out");
        Self { check_in, check_out }
    }

    /// Build a window, returning `None` unless `check_in < check_out`.
    pub fn try_new(check_in: NaiveDate, check_out: NaiveDate) -> Option<Self> {
        (check_in < check_out).then_some(Self { check_in, check_out })
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }

    pub fn overlaps(&self, other: &StayWindow) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }

    /// True for the nights of the stay; the check-out date is excluded.
    pub fn contains_night(&self, date: NaiveDate) -> bool {
        self.check_in <= date && date < self.check_out
    }

    /// Every night in `[check_in, check_out)`.
    pub fn nights_iter(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.check_out;
        self.check_in.iter_days().take_while(move |d| *d < end)
    }
}

impl fmt::Display for StayWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.check_in, self.check_out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Confirmed,
    CheckedIn,
    CheckedOut,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::CheckedIn => "checked_in",
            ReservationStatus::CheckedOut => "checked_out",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    /// Whether a reservation in this status occupies the house calendar.
    pub fn blocks_calendar(&self) -> bool {
        matches!(self, ReservationStatus::Confirmed | ReservationStatus::CheckedIn)
    }

}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct House {
    pub id: HouseId,
    pub name: String,
    /// Max guests per stay.
    pub capacity: u32,
    /// Nightly price in minor currency units.
    pub base_price: i64,
    #[serde(default = "default_check_in_from")]
    pub check_in_from: String,
    #[serde(default = "default_check_out_until")]
    pub check_out_until: String,
}

fn default_check_in_from() -> String {
    "14:00".into()
}

fn default_check_out_until() -> String {
    "12:00".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extra {
    pub id: ExtraId,
    pub name: String,
    pub price: i64,
}

/// Shared bookable resource (bathhouse, sauna, ...) attached to a stay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub id: FacilityId,
    pub name: String,
    pub price: i64,
    /// Houses whose guests may book this facility.
    pub house_ids: Vec<HouseId>,
    #[serde(default)]
    pub fill_options: Vec<FillOption>,
}

impl Facility {
    pub fn offered_for(&self, house_id: HouseId) -> bool {
        self.house_ids.contains(&house_id)
    }

    pub fn fill_option(&self, id: FillOptionId) -> Option<&FillOption> {
        self.fill_options.iter().find(|o| o.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillOption {
    pub id: FillOptionId,
    pub name: String,
    pub price: i64,
}

// ── Guests ───────────────────────────────────────────────────────

/// Contact details typed into a booking form. A messaging account is never
/// taken from here; it is bound to a guest only by an approved verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub name: String,
    pub email: String,
    pub phone: String,
}

/// Dedupe key for the guest directory: digits of the phone plus lowercased email.
fn contact_key(phone: &str, email: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("{digits}|{}", email.trim().to_lowercase())
}

impl ContactInfo {
    pub fn dedupe_key(&self) -> String {
        contact_key(&self.phone, &self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub messaging_id: Option<i64>,
}

impl Guest {
    pub fn dedupe_key(&self) -> String {
        contact_key(&self.phone, &self.email)
    }
}

/// One-time code proving control of a contact. Approving it binds a
/// messaging account to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub code: String,
    pub guest_id: Ulid,
    pub expires_at: DateTime<Utc>,
    pub approved: bool,
}

impl Verification {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraRequest {
    pub extra_id: ExtraId,
    pub quantity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOnRequest {
    pub facility_id: FacilityId,
    pub date: NaiveDate,
    pub time_from: NaiveTime,
    pub time_to: NaiveTime,
    pub fill_option_id: Option<FillOptionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraLine {
    pub extra_id: ExtraId,
    pub quantity: u32,
    pub amount: i64,
}

/// A facility slot booked together with the stay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOnBooking {
    pub facility_id: FacilityId,
    pub date: NaiveDate,
    pub time_from: NaiveTime,
    pub time_to: NaiveTime,
    pub fill_option_id: Option<FillOptionId>,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub house_id: HouseId,
    pub guest_id: Ulid,
    pub window: StayWindow,
    pub guest_count: u32,
    pub status: ReservationStatus,
    pub total_price: i64,
    pub extras: Vec<ExtraLine>,
    pub add_ons: Vec<AddOnBooking>,
    pub reminder_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Who is asking for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    /// A guest identified by their messaging account; may only cancel own stays.
    Guest { messaging_id: i64 },
    Admin,
}

/// One status move computed by reconciliation, applied compare-and-set on `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub id: Ulid,
    pub from: ReservationStatus,
    pub to: ReservationStatus,
}

// ── Interval index ───────────────────────────────────────────────

/// What occupies a house calendar interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalKind {
    /// A reservation; blocks only while its status does.
    Stay { status: ReservationStatus },
    /// Owner-closed period; always blocks.
    Blackout { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub id: Ulid,
    pub window: StayWindow,
    pub kind: IntervalKind,
}

impl Interval {
    pub fn blocks(&self) -> bool {
        match &self.kind {
            IntervalKind::Stay { status } => status.blocks_calendar(),
            IntervalKind::Blackout { .. } => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HouseState {
    pub house: House,
    /// Stays and blackouts, sorted by `window.check_in`.
    pub intervals: Vec<Interval>,
    pub reservations: std::collections::HashMap<Ulid, Reservation>,
    /// Set once the house is deleted; writers holding a stale handle bail out.
    pub removed: bool,
}

impl HouseState {
    pub fn new(house: House) -> Self {
        Self {
            house,
            intervals: Vec::new(),
            reservations: std::collections::HashMap::new(),
            removed: false,
        }
    }

    /// Insert interval keeping the list sorted by check-in.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .partition_point(|i| i.window.check_in <= interval.window.check_in);
        self.intervals.insert(pos, interval);
    }

    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Stays that stop blocking leave the interval list; the reservation
    /// record itself is kept.
    pub fn set_stay_status(&mut self, id: Ulid, status: ReservationStatus) {
        if !status.blocks_calendar() {
            self.remove_interval(id);
        } else if let Some(interval) = self.intervals.iter_mut().find(|i| i.id == id) {
            interval.kind = IntervalKind::Stay { status };
        }
    }

    /// Intervals overlapping `window`; skips everything checking in at or after
    /// `window.check_out` with a binary search.
    pub fn overlapping(&self, window: &StayWindow) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.window.check_in < window.check_out);
        let window = *window;
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.window.overlaps(&window))
    }

    /// First blocking interval overlapping `window`, if any.
    pub fn first_blocker(&self, window: &StayWindow) -> Option<&Interval> {
        self.overlapping(window).find(|i| i.blocks())
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// Flat event records; this is the WAL format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    HouseRegistered {
        house: House,
    },
    ExtraRegistered {
        extra: Extra,
    },
    FacilityRegistered {
        facility: Facility,
    },
    HouseUpdated {
        house: House,
    },
    /// Carries the blackout ids so replay can drop their index entries.
    HouseRemoved {
        id: HouseId,
        blackouts: Vec<Ulid>,
    },
    ExtraUpdated {
        extra: Extra,
    },
    ExtraRemoved {
        id: ExtraId,
    },
    FacilityUpdated {
        facility: Facility,
    },
    FacilityRemoved {
        id: FacilityId,
    },
    BlackoutAdded {
        id: Ulid,
        house_id: HouseId,
        window: StayWindow,
        reason: Option<String>,
    },
    BlackoutRemoved {
        id: Ulid,
        house_id: HouseId,
    },
    GuestRegistered {
        guest: Guest,
    },
    VerificationIssued {
        verification: Verification,
    },
    VerificationApproved {
        code: String,
        guest_id: Ulid,
        messaging_id: i64,
    },
    /// Reservation plus its add-ons, written as one record.
    ReservationCreated {
        reservation: Reservation,
    },
    StatusChanged {
        id: Ulid,
        house_id: HouseId,
        status: ReservationStatus,
        at: DateTime<Utc>,
    },
    ReminderSent {
        id: Ulid,
        house_id: HouseId,
    },
}

impl Event {
    /// House whose lock guards this event, if it is house-scoped.
    pub fn house_id(&self) -> Option<HouseId> {
        match self {
            Event::BlackoutAdded { house_id, .. }
            | Event::BlackoutRemoved { house_id, .. }
            | Event::StatusChanged { house_id, .. }
            | Event::ReminderSent { house_id, .. } => Some(*house_id),
            Event::ReservationCreated { reservation } => Some(reservation.house_id),
            Event::HouseUpdated { house } => Some(house.id),
            Event::HouseRegistered { .. }
            | Event::HouseRemoved { .. }
            | Event::ExtraRegistered { .. }
            | Event::ExtraUpdated { .. }
            | Event::ExtraRemoved { .. }
            | Event::FacilityRegistered { .. }
            | Event::FacilityUpdated { .. }
            | Event::FacilityRemoved { .. }
            | Event::GuestRegistered { .. }
            | Event::VerificationIssued { .. }
            | Event::VerificationApproved { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PricedExtra {
    pub extra_id: ExtraId,
    pub name: String,
    pub quantity: u32,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PricedAddOn {
    pub request: AddOnRequest,
    pub facility_name: String,
    pub fill_option_name: Option<String>,
    pub amount: i64,
}

/// Prices the store resolved for one booking request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceQuote {
    pub house_base_price: i64,
    pub extras: Vec<PricedExtra>,
    pub add_ons: Vec<PricedAddOn>,
}

impl PriceQuote {
    /// Extras plus add-ons, added once on top of the nightly total.
    pub fn extras_total(&self) -> i64 {
        self.extras.iter().map(|e| e.amount).sum::<i64>()
            + self.add_ons.iter().map(|a| a.amount).sum::<i64>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeSlot {
    pub from: NaiveTime,
    pub to: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateSlots {
    pub date: NaiveDate,
    pub times: Vec<TimeSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddOnOffer {
    pub facility_id: FacilityId,
    pub name: String,
    pub price: i64,
    pub slots: Vec<DateSlots>,
    pub fill_options: Vec<FillOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableHouse {
    pub house: House,
    pub per_night_price: i64,
    pub total_price: i64,
    pub add_ons: Vec<AddOnOffer>,
}

/// Confirmed reservation due for a check-in reminder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpcomingCheckIn {
    pub reservation_id: Ulid,
    pub house_id: HouseId,
    pub house_name: String,
    pub window: StayWindow,
    pub guest_name: String,
    pub guest_messaging_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn house() -> House {
        House {
            id: 1,
            name: "Barnhouse".into(),
            capacity: 4,
            base_price: 1000,
            check_in_from: "14:00".into(),
            check_out_until: "12:00".into(),
        }
    }

    fn stay(check_in: NaiveDate, check_out: NaiveDate, status: ReservationStatus) -> Interval {
        Interval {
            id: Ulid::new(),
            window: StayWindow::new(check_in, check_out),
            kind: IntervalKind::Stay { status },
        }
    }

    #[test]
    fn window_nights_and_iteration() {
        let w = StayWindow::new(d(2024, 6, 1), d(2024, 6, 4));
        assert_eq!(w.nights(), 3);
        let nights: Vec<_> = w.nights_iter().collect();
        assert_eq!(nights, vec![d(2024, 6, 1), d(2024, 6, 2), d(2024, 6, 3)]);
        assert!(w.contains_night(d(2024, 6, 3)));
        assert!(!w.contains_night(d(2024, 6, 4))); // half-open
    }

    #[test]
    fn window_try_new_rejects_empty_and_reversed() {
        assert!(StayWindow::try_new(d(2024, 6, 1), d(2024, 6, 1)).is_none());
        assert!(StayWindow::try_new(d(2024, 6, 2), d(2024, 6, 1)).is_none());
        assert!(StayWindow::try_new(d(2024, 6, 1), d(2024, 6, 2)).is_some());
    }

    #[test]
    fn window_overlap_is_half_open() {
        let a = StayWindow::new(d(2024, 7, 10), d(2024, 7, 12));
        let b = StayWindow::new(d(2024, 7, 11), d(2024, 7, 14));
        let c = StayWindow::new(d(2024, 7, 12), d(2024, 7, 14));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // checkout day is free
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn status_blocking() {
        assert!(ReservationStatus::Confirmed.blocks_calendar());
        assert!(ReservationStatus::CheckedIn.blocks_calendar());
        assert!(!ReservationStatus::CheckedOut.blocks_calendar());
        assert!(!ReservationStatus::Cancelled.blocks_calendar());
        assert_eq!(ReservationStatus::CheckedIn.to_string(), "checked_in");
    }

    #[test]
    fn intervals_stay_sorted() {
        let mut hs = HouseState::new(house());
        hs.insert_interval(stay(d(2024, 8, 10), d(2024, 8, 12), ReservationStatus::Confirmed));
        hs.insert_interval(stay(d(2024, 8, 1), d(2024, 8, 3), ReservationStatus::Confirmed));
        hs.insert_interval(stay(d(2024, 8, 5), d(2024, 8, 6), ReservationStatus::Confirmed));
        let starts: Vec<_> = hs.intervals.iter().map(|i| i.window.check_in).collect();
        assert_eq!(starts, vec![d(2024, 8, 1), d(2024, 8, 5), d(2024, 8, 10)]);
    }

    #[test]
    fn overlapping_skips_before_and_after() {
        let mut hs = HouseState::new(house());
        hs.insert_interval(stay(d(2024, 8, 1), d(2024, 8, 3), ReservationStatus::Confirmed));
        hs.insert_interval(stay(d(2024, 8, 4), d(2024, 8, 8), ReservationStatus::Confirmed));
        hs.insert_interval(stay(d(2024, 8, 20), d(2024, 8, 22), ReservationStatus::Confirmed));

        let query = StayWindow::new(d(2024, 8, 3), d(2024, 8, 5));
        let hits: Vec<_> = hs.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].window.check_in, d(2024, 8, 4));
    }

    #[test]
    fn cancelled_and_checked_out_stays_do_not_block() {
        let mut hs = HouseState::new(house());
        hs.insert_interval(stay(d(2024, 8, 1), d(2024, 8, 5), ReservationStatus::Cancelled));
        hs.insert_interval(stay(d(2024, 8, 1), d(2024, 8, 5), ReservationStatus::CheckedOut));
        let query = StayWindow::new(d(2024, 8, 2), d(2024, 8, 3));
        assert_eq!(hs.overlapping(&query).count(), 2);
        assert!(hs.first_blocker(&query).is_none());
    }

    #[test]
    fn blackout_always_blocks() {
        let mut hs = HouseState::new(house());
        let id = Ulid::new();
        hs.insert_interval(Interval {
            id,
            window: StayWindow::new(d(2024, 12, 30), d(2025, 1, 2)),
            kind: IntervalKind::Blackout { reason: Some("maintenance".into()) },
        });
        let query = StayWindow::new(d(2025, 1, 1), d(2025, 1, 3));
        assert_eq!(hs.first_blocker(&query).map(|i| i.id), Some(id));
    }

    #[test]
    fn set_stay_status_releases_calendar() {
        let mut hs = HouseState::new(house());
        let interval = stay(d(2024, 9, 1), d(2024, 9, 4), ReservationStatus::Confirmed);
        let id = interval.id;
        hs.insert_interval(interval);
        let query = StayWindow::new(d(2024, 9, 2), d(2024, 9, 3));
        assert!(hs.first_blocker(&query).is_some());
        hs.set_stay_status(id, ReservationStatus::Cancelled);
        assert!(hs.first_blocker(&query).is_none());
        assert!(hs.intervals.is_empty());
    }

    #[test]
    fn dedupe_key_normalizes_contact() {
        let a = ContactInfo {
            name: "Ann".into(),
            email: " Ann@Example.com ".into(),
            phone: "+7 (986) 742-72-83".into(),
        };
        let b = ContactInfo {
            name: "Ann B.".into(),
            email: "ann@example.com".into(),
            phone: "79867427283".into(),
        };
        assert_eq!(a.dedupe_key(), b.dedupe_key());
    }

    #[test]
    fn quote_extras_total_sums_extras_and_add_ons() {
        let quote = PriceQuote {
            house_base_price: 1000,
            extras: vec![PricedExtra { extra_id: 1, name: "Firewood".into(), quantity: 2, amount: 300 }],
            add_ons: vec![PricedAddOn {
                request: AddOnRequest {
                    facility_id: 1,
                    date: d(2024, 6, 1),
                    time_from: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                    time_to: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
                    fill_option_id: None,
                },
                facility_name: "Bathhouse".into(),
                fill_option_name: None,
                amount: 1500,
            }],
        };
        assert_eq!(quote.extras_total(), 1800);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::HouseRegistered { house: house() };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
