use ulid::Ulid;

use crate::lifecycle::TransitionError;
use crate::model::{ExtraId, FacilityId, FillOptionId, HouseId, ReservationStatus, StayWindow};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("house not found: {0}")]
    HouseNotFound(HouseId),

    #[error("guest not found: {0}")]
    GuestNotFound(Ulid),

    #[error("reservation not found: {0}")]
    ReservationNotFound(Ulid),

    #[error("blackout not found: {0}")]
    BlackoutNotFound(Ulid),

    #[error("extra not found: {0}")]
    ExtraNotFound(ExtraId),

    #[error("facility not found: {0}")]
    FacilityNotFound(FacilityId),

    #[error("fill option {option} not found for facility {facility}")]
    FillOptionNotFound {
        facility: FacilityId,
        option: FillOptionId,
    },

    #[error("facility {facility} is not offered for house {house}")]
    FacilityNotOffered {
        facility: FacilityId,
        house: HouseId,
    },

    #[error("house {0} still has reservations")]
    HouseInUse(HouseId),

    #[error("unknown verification code")]
    VerificationNotFound,

    #[error("verification code expired")]
    VerificationExpired,

    #[error("verification code already used")]
    VerificationUsed,

    #[error("guest {0} is bound to another messaging account")]
    GuestAlreadyBound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("house {house_id} is occupied for {window} by {blocker}")]
    Conflict {
        house_id: HouseId,
        window: StayWindow,
        blocker: Ulid,
    },

    #[error("reservation {id} is {actual}, expected {expected}")]
    StaleStatus {
        id: Ulid,
        expected: ReservationStatus,
        actual: ReservationStatus,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("reservation {0} does not belong to the requester")]
    Forbidden(Ulid),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}
