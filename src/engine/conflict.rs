use crate::model::*;

use super::StoreError;

pub(crate) fn validate_window(window: &StayWindow) -> Result<(), StoreError> {
    use crate::limits::*;
    if window.check_in < min_valid_date() || window.check_out > max_valid_date() {
        return Err(StoreError::LimitExceeded("date out of range"));
    }
    if window.nights() > MAX_STAY_NIGHTS {
        return Err(StoreError::LimitExceeded("stay too long"));
    }
    Ok(())
}

/// Fails with the first stay or blackout that blocks `window`.
pub(crate) fn check_no_conflict(hs: &HouseState, window: &StayWindow) -> Result<(), StoreError> {
    match hs.first_blocker(window) {
        Some(blocker) => Err(StoreError::Conflict {
            house_id: hs.house.id,
            window: *window,
            blocker: blocker.id,
        }),
        None => Ok(()),
    }
}
