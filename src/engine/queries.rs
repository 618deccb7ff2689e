use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_window;
use super::{Engine, StoreError};

impl Engine {
    /// Houses with room for `min_capacity` guests and nothing blocking
    /// `window`, ordered by id.
    pub async fn find_eligible_houses(
        &self,
        window: &StayWindow,
        min_capacity: u32,
    ) -> Result<Vec<HouseId>, StoreError> {
        validate_window(window)?;
        if window.nights() > MAX_QUERY_NIGHTS {
            return Err(StoreError::LimitExceeded("query window too wide"));
        }
        let candidates: Vec<_> = self.houses.iter().map(|e| e.value().clone()).collect();
        let mut eligible = Vec::new();
        for hs in candidates {
            let guard = hs.read().await;
            if !guard.removed
                && guard.house.capacity >= min_capacity
                && guard.first_blocker(window).is_none()
            {
                eligible.push(guard.house.id);
            }
        }
        eligible.sort_unstable();
        Ok(eligible)
    }

    pub async fn is_available(
        &self,
        house_id: HouseId,
        window: &StayWindow,
    ) -> Result<bool, StoreError> {
        validate_window(window)?;
        let hs = self
            .get_house_state(&house_id)
            .ok_or(StoreError::HouseNotFound(house_id))?;
        let guard = hs.read().await;
        if guard.removed {
            return Err(StoreError::HouseNotFound(house_id));
        }
        Ok(guard.first_blocker(window).is_none())
    }

    /// Resolve catalog prices for a booking request. Extras are priced per
    /// unit; an add-on costs the facility price plus its fill option.
    /// Amounts that do not fit an `i64` are rejected.
    pub async fn price_lookup(
        &self,
        house_id: HouseId,
        extras: &[ExtraRequest],
        add_ons: &[AddOnRequest],
    ) -> Result<PriceQuote, StoreError> {
        let house_base_price = self
            .get_house(house_id)
            .await
            .ok_or(StoreError::HouseNotFound(house_id))?
            .base_price;

        let mut priced_extras = Vec::with_capacity(extras.len());
        for req in extras {
            let extra = self
                .extras
                .get(&req.extra_id)
                .ok_or(StoreError::ExtraNotFound(req.extra_id))?;
            priced_extras.push(PricedExtra {
                extra_id: extra.id,
                name: extra.name.clone(),
                quantity: req.quantity,
                amount: extra
                    .price
                    .checked_mul(i64::from(req.quantity))
                    .ok_or(StoreError::LimitExceeded("price overflow"))?,
            });
        }

        let mut priced_add_ons = Vec::with_capacity(add_ons.len());
        for req in add_ons {
            let facility = self
                .facilities
                .get(&req.facility_id)
                .ok_or(StoreError::FacilityNotFound(req.facility_id))?;
            if !facility.offered_for(house_id) {
                return Err(StoreError::FacilityNotOffered {
                    facility: facility.id,
                    house: house_id,
                });
            }
            let option = match req.fill_option_id {
                Some(option_id) => Some(facility.fill_option(option_id).ok_or(
                    StoreError::FillOptionNotFound { facility: facility.id, option: option_id },
                )?),
                None => None,
            };
            priced_add_ons.push(PricedAddOn {
                request: *req,
                facility_name: facility.name.clone(),
                fill_option_name: option.map(|o| o.name.clone()),
                amount: facility
                    .price
                    .checked_add(option.map_or(0, |o| o.price))
                    .ok_or(StoreError::LimitExceeded("price overflow"))?,
            });
        }

        Ok(PriceQuote { house_base_price, extras: priced_extras, add_ons: priced_add_ons })
    }

    pub async fn get(&self, id: Ulid) -> Option<Reservation> {
        let house_id = self.house_for_entity(&id)?;
        let hs = self.get_house_state(&house_id)?;
        let guard = hs.read().await;
        guard.reservations.get(&id).cloned()
    }

    /// Every reservation in `status`, ordered by check-in.
    pub async fn list_by_status(&self, status: ReservationStatus) -> Vec<Reservation> {
        self.collect_reservations(|r| r.status == status).await
    }

    /// Confirmed stays checking in on or after `from` whose reminder has not
    /// been sent yet.
    pub async fn list_upcoming_check_ins(&self, from: NaiveDate) -> Vec<UpcomingCheckIn> {
        let pending = self
            .collect_reservations(|r| {
                r.status == ReservationStatus::Confirmed
                    && !r.reminder_sent
                    && r.window.check_in >= from
            })
            .await;

        let mut upcoming = Vec::with_capacity(pending.len());
        for r in pending {
            let Some(house_name) = self.get_house(r.house_id).await.map(|h| h.name) else {
                continue;
            };
            let guest = self.guests.get(&r.guest_id).map(|g| g.clone());
            upcoming.push(UpcomingCheckIn {
                reservation_id: r.id,
                house_id: r.house_id,
                house_name,
                window: r.window,
                guest_name: guest.as_ref().map(|g| g.name.clone()).unwrap_or_default(),
                guest_messaging_id: guest.and_then(|g| g.messaging_id),
            });
        }
        upcoming
    }

    /// Reservations made by the guest behind a messaging account.
    pub async fn list_for_guest(&self, messaging_id: i64) -> Vec<Reservation> {
        let guest_ids: Vec<Ulid> = self
            .guests
            .iter()
            .filter(|g| g.messaging_id == Some(messaging_id))
            .map(|g| g.id)
            .collect();
        if guest_ids.is_empty() {
            return Vec::new();
        }
        self.collect_reservations(|r| guest_ids.contains(&r.guest_id)).await
    }

    async fn collect_reservations(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let houses: Vec<_> = self.houses.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for hs in houses {
            let guard = hs.read().await;
            out.extend(guard.reservations.values().filter(|r| keep(r)).cloned());
        }
        out.sort_by_key(|r| (r.window.check_in, r.id));
        out
    }

    // ── Catalog reads ────────────────────────────────────────

    pub async fn get_house(&self, id: HouseId) -> Option<House> {
        let hs = self.get_house_state(&id)?;
        let guard = hs.read().await;
        (!guard.removed).then(|| guard.house.clone())
    }

    pub async fn list_houses(&self) -> Vec<House> {
        let houses: Vec<_> = self.houses.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(houses.len());
        for hs in houses {
            let guard = hs.read().await;
            if !guard.removed {
                out.push(guard.house.clone());
            }
        }
        out.sort_by_key(|h| h.id);
        out
    }

    /// Blackout periods of a house as `(id, window)`, ordered by start.
    pub async fn list_blackouts(
        &self,
        house_id: HouseId,
    ) -> Result<Vec<(Ulid, StayWindow)>, StoreError> {
        let hs = self
            .get_house_state(&house_id)
            .ok_or(StoreError::HouseNotFound(house_id))?;
        let guard = hs.read().await;
        Ok(guard
            .intervals
            .iter()
            .filter(|i| matches!(i.kind, IntervalKind::Blackout { .. }))
            .map(|i| (i.id, i.window))
            .collect())
    }

    pub fn get_extra(&self, id: ExtraId) -> Option<Extra> {
        self.extras.get(&id).map(|e| e.clone())
    }

    pub fn list_extras(&self) -> Vec<Extra> {
        let mut out: Vec<Extra> = self.extras.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|e| e.id);
        out
    }

    pub fn get_facility(&self, id: FacilityId) -> Option<Facility> {
        self.facilities.get(&id).map(|f| f.clone())
    }

    pub fn facilities_for_house(&self, house_id: HouseId) -> Vec<Facility> {
        let mut out: Vec<Facility> = self
            .facilities
            .iter()
            .filter(|f| f.offered_for(house_id))
            .map(|f| f.value().clone())
            .collect();
        out.sort_by_key(|f| f.id);
        out
    }

    pub fn get_guest(&self, id: &Ulid) -> Option<Guest> {
        self.guests.get(id).map(|g| g.clone())
    }
}
