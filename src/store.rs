//! Collaborator contracts consumed by the services and jobs.
//!
//! One trait per capability. [`crate::engine::Engine`] implements all three;
//! tests substitute their own implementations to inject failures.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ulid::Ulid;

use crate::engine::StoreError;
use crate::model::*;

/// Outcome of one entry of a batch status update.
pub type StatusUpdateResult = (Ulid, Result<(), StoreError>);

#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Houses with capacity ≥ `min_capacity` and no blocking stay or blackout
    /// overlapping `window`.
    async fn find_eligible_houses(
        &self,
        window: &StayWindow,
        min_capacity: u32,
    ) -> Result<Vec<HouseId>, StoreError>;

    async fn is_available(&self, house_id: HouseId, window: &StayWindow)
    -> Result<bool, StoreError>;

    async fn price_lookup(
        &self,
        house_id: HouseId,
        extras: &[ExtraRequest],
        add_ons: &[AddOnRequest],
    ) -> Result<PriceQuote, StoreError>;

    /// Persist the reservation and its add-ons as one durable record. Fails
    /// with [`StoreError::Conflict`] if the window became occupied.
    async fn create(&self, reservation: Reservation) -> Result<(), StoreError>;

    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    async fn list_by_status(&self, status: ReservationStatus)
    -> Result<Vec<Reservation>, StoreError>;

    async fn list_for_guest(&self, messaging_id: i64) -> Result<Vec<Reservation>, StoreError>;

    /// Compare-and-set each change on its `from` status. The outer error is
    /// reserved for the store being unreachable.
    async fn batch_update_status(
        &self,
        changes: Vec<StatusChange>,
    ) -> Result<Vec<StatusUpdateResult>, StoreError>;

    async fn list_upcoming_check_ins(
        &self,
        from: NaiveDate,
    ) -> Result<Vec<UpcomingCheckIn>, StoreError>;

    async fn mark_reminded(&self, id: Ulid) -> Result<(), StoreError>;

    async fn cancel(&self, id: Ulid, requester: Requester) -> Result<Reservation, StoreError>;
}

#[async_trait]
pub trait HouseCatalog: Send + Sync {
    async fn get_by_id(&self, id: HouseId) -> Result<Option<House>, StoreError>;
    async fn list_all(&self) -> Result<Vec<House>, StoreError>;
    async fn facilities_for_house(&self, house_id: HouseId) -> Result<Vec<Facility>, StoreError>;
}

#[async_trait]
pub trait GuestDirectory: Send + Sync {
    /// Look up by normalized phone + lowercased email, creating on miss.
    async fn find_or_create(&self, contact: &ContactInfo) -> Result<Guest, StoreError>;

    /// Issue a one-time code for the guest behind `contact`.
    async fn issue_verification(
        &self,
        contact: &ContactInfo,
        expires_at: DateTime<Utc>,
    ) -> Result<Verification, StoreError>;

    /// Bind a messaging account to a guest through a pending, unexpired code.
    async fn approve_verification(
        &self,
        code: &str,
        messaging_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Guest, StoreError>;
}
