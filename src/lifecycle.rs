//! Reservation status state machine.
//!
//! ```text
//! confirmed ──► checked_in ──► checked_out
//!     │             │
//!     └─────────────┴──► cancelled
//! confirmed ───────────────► checked_out   (reconciliation skipped the stay)
//! ```
//!
//! `checked_out` and `cancelled` are terminal.

use chrono::NaiveDate;

use crate::model::{ReservationStatus, StayWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot move reservation from {from} to {to}")]
pub struct TransitionError {
    pub from: ReservationStatus,
    pub to: ReservationStatus,
}

/// Whether `from → to` is an allowed edge.
pub fn can_transition(from: ReservationStatus, to: ReservationStatus) -> bool {
    use ReservationStatus::*;
    matches!(
        (from, to),
        (Confirmed, CheckedIn)
            | (Confirmed, CheckedOut)
            | (CheckedIn, CheckedOut)
            | (Confirmed, Cancelled)
            | (CheckedIn, Cancelled)
    )
}

pub fn ensure_transition(
    from: ReservationStatus,
    to: ReservationStatus,
) -> Result<(), TransitionError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

/// Status the calendar implies for `today`, or `None` when nothing changes.
///
/// Only time-driven edges are produced here; cancellation is never automatic.
pub fn next_status(
    current: ReservationStatus,
    window: &StayWindow,
    today: NaiveDate,
) -> Option<ReservationStatus> {
    let derived = if today >= window.check_out {
        ReservationStatus::CheckedOut
    } else if today >= window.check_in {
        ReservationStatus::CheckedIn
    } else {
        return None;
    };
    (derived != current && can_transition(current, derived)).then_some(derived)
}

/// Cancellation edge; fails for terminal states.
pub fn cancel(current: ReservationStatus) -> Result<ReservationStatus, TransitionError> {
    ensure_transition(current, ReservationStatus::Cancelled)?;
    Ok(ReservationStatus::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReservationStatus::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn july_stay() -> StayWindow {
        StayWindow::new(d(2024, 7, 10), d(2024, 7, 12))
    }

    #[test]
    fn before_check_in_nothing_changes() {
        assert_eq!(next_status(Confirmed, &july_stay(), d(2024, 7, 9)), None);
    }

    #[test]
    fn check_in_day_checks_in() {
        assert_eq!(next_status(Confirmed, &july_stay(), d(2024, 7, 10)), Some(CheckedIn));
        assert_eq!(next_status(Confirmed, &july_stay(), d(2024, 7, 11)), Some(CheckedIn));
    }

    #[test]
    fn check_out_day_checks_out() {
        assert_eq!(next_status(CheckedIn, &july_stay(), d(2024, 7, 12)), Some(CheckedOut));
        assert_eq!(next_status(Confirmed, &july_stay(), d(2024, 7, 12)), Some(CheckedOut));
        assert_eq!(next_status(Confirmed, &july_stay(), d(2024, 8, 1)), Some(CheckedOut));
    }

    #[test]
    fn settled_states_are_stable() {
        assert_eq!(next_status(CheckedIn, &july_stay(), d(2024, 7, 11)), None);
        assert_eq!(next_status(CheckedOut, &july_stay(), d(2024, 7, 20)), None);
        assert_eq!(next_status(Cancelled, &july_stay(), d(2024, 7, 11)), None);
        assert_eq!(next_status(Cancelled, &july_stay(), d(2024, 7, 20)), None);
    }

    #[test]
    fn cancel_only_from_active_states() {
        assert_eq!(cancel(Confirmed), Ok(Cancelled));
        assert_eq!(cancel(CheckedIn), Ok(Cancelled));
        assert_eq!(cancel(Cancelled), Err(TransitionError { from: Cancelled, to: Cancelled }));
        assert!(cancel(CheckedOut).is_err());
    }

    #[test]
    fn no_edge_leaves_a_terminal_state() {
        for to in [Confirmed, CheckedIn, CheckedOut, Cancelled] {
            assert!(!can_transition(CheckedOut, to));
            assert!(!can_transition(Cancelled, to));
        }
        assert!(!can_transition(CheckedIn, Confirmed));
    }
}
