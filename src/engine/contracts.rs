use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ulid::Ulid;

use crate::model::*;
use crate::store::{GuestDirectory, HouseCatalog, ReservationStore, StatusUpdateResult};

use super::{Engine, StoreError};

#[async_trait]
impl ReservationStore for Engine {
    async fn find_eligible_houses(
        &self,
        window: &StayWindow,
        min_capacity: u32,
    ) -> Result<Vec<HouseId>, StoreError> {
        Engine::find_eligible_houses(self, window, min_capacity).await
    }

    async fn is_available(
        &self,
        house_id: HouseId,
        window: &StayWindow,
    ) -> Result<bool, StoreError> {
        Engine::is_available(self, house_id, window).await
    }

    async fn price_lookup(
        &self,
        house_id: HouseId,
        extras: &[ExtraRequest],
        add_ons: &[AddOnRequest],
    ) -> Result<PriceQuote, StoreError> {
        Engine::price_lookup(self, house_id, extras, add_ons).await
    }

    async fn create(&self, reservation: Reservation) -> Result<(), StoreError> {
        self.create_reservation(reservation).await
    }

    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(Engine::get(self, id).await)
    }

    async fn list_by_status(
        &self,
        status: ReservationStatus,
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(Engine::list_by_status(self, status).await)
    }

    async fn list_for_guest(&self, messaging_id: i64) -> Result<Vec<Reservation>, StoreError> {
        Ok(Engine::list_for_guest(self, messaging_id).await)
    }

    async fn batch_update_status(
        &self,
        changes: Vec<StatusChange>,
    ) -> Result<Vec<StatusUpdateResult>, StoreError> {
        Ok(Engine::batch_update_status(self, changes).await)
    }

    async fn list_upcoming_check_ins(
        &self,
        from: NaiveDate,
    ) -> Result<Vec<UpcomingCheckIn>, StoreError> {
        Ok(Engine::list_upcoming_check_ins(self, from).await)
    }

    async fn mark_reminded(&self, id: Ulid) -> Result<(), StoreError> {
        Engine::mark_reminded(self, id).await
    }

    async fn cancel(&self, id: Ulid, requester: Requester) -> Result<Reservation, StoreError> {
        Engine::cancel(self, id, requester).await
    }
}

#[async_trait]
impl HouseCatalog for Engine {
    async fn get_by_id(&self, id: HouseId) -> Result<Option<House>, StoreError> {
        Ok(self.get_house(id).await)
    }

    async fn list_all(&self) -> Result<Vec<House>, StoreError> {
        Ok(self.list_houses().await)
    }

    async fn facilities_for_house(&self, house_id: HouseId) -> Result<Vec<Facility>, StoreError> {
        Ok(Engine::facilities_for_house(self, house_id))
    }
}

#[async_trait]
impl GuestDirectory for Engine {
    async fn find_or_create(&self, contact: &ContactInfo) -> Result<Guest, StoreError> {
        self.find_or_create_guest(contact).await
    }

    async fn issue_verification(
        &self,
        contact: &ContactInfo,
        expires_at: DateTime<Utc>,
    ) -> Result<Verification, StoreError> {
        Engine::issue_verification(self, contact, expires_at).await
    }

    async fn approve_verification(
        &self,
        code: &str,
        messaging_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Guest, StoreError> {
        Engine::approve_verification(self, code, messaging_id, now).await
    }
}
