//! Availability search: every house free for a stay window, priced.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::booking::{BookingError, abortable};
use crate::limits::*;
use crate::model::*;
use crate::pricing::PricingCalculator;
use crate::store::{HouseCatalog, ReservationStore};

/// Daily time range in which add-on facilities can be booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTemplate {
    pub opens: NaiveTime,
    pub closes: NaiveTime,
}

impl Default for SlotTemplate {
    fn default() -> Self {
        Self {
            opens: NaiveTime::from_hms_opt(10, 0, 0).unwrap_or(NaiveTime::MIN),
            closes: NaiveTime::from_hms_opt(21, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl SlotTemplate {
    /// One entry per night of the stay, always at least one.
    pub fn dates_for(&self, window: &StayWindow) -> Vec<DateSlots> {
        let slot = TimeSlot { from: self.opens, to: self.closes };
        let mut dates: Vec<DateSlots> = window
            .nights_iter()
            .map(|date| DateSlots { date, times: vec![slot] })
            .collect();
        if dates.is_empty() {
            dates.push(DateSlots { date: window.check_in, times: vec![slot] });
        }
        dates
    }

    /// Whether an add-on request falls inside an offered slot of the stay.
    pub fn contains(&self, add_on: &AddOnRequest, window: &StayWindow) -> bool {
        window.contains_night(add_on.date)
            && add_on.time_from < add_on.time_to
            && add_on.time_from >= self.opens
            && add_on.time_to <= self.closes
    }
}

pub struct AvailabilityService {
    store: Arc<dyn ReservationStore>,
    catalog: Arc<dyn HouseCatalog>,
    pricing: Arc<PricingCalculator>,
    slots: SlotTemplate,
}

impl AvailabilityService {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        catalog: Arc<dyn HouseCatalog>,
        pricing: Arc<PricingCalculator>,
        slots: SlotTemplate,
    ) -> Self {
        Self { store, catalog, pricing, slots }
    }

    /// Houses that can host `guest_count` guests for the whole window, with
    /// price and bookable add-ons, ordered by house id.
    ///
    /// A house whose catalog lookup or pricing fails is skipped and logged.
    pub async fn get_available_houses(
        &self,
        check_in: NaiveDate,
        check_out: NaiveDate,
        guest_count: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<AvailableHouse>, BookingError> {
        let result = self.search(check_in, check_out, guest_count, cancel).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(crate::observability::AVAILABILITY_QUERIES_TOTAL, "status" => status)
            .increment(1);
        result
    }

    async fn search(
        &self,
        check_in: NaiveDate,
        check_out: NaiveDate,
        guest_count: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<AvailableHouse>, BookingError> {
        let window = StayWindow::try_new(check_in, check_out).ok_or_else(|| {
            BookingError::InvalidRequest("check-in must be before check-out".into())
        })?;
        if guest_count == 0 {
            return Err(BookingError::InvalidRequest("guest count must be positive".into()));
        }
        if guest_count > MAX_GUESTS_PER_BOOKING {
            return Err(BookingError::InvalidRequest("too many guests".into()));
        }
        if window.nights() > MAX_QUERY_NIGHTS {
            return Err(BookingError::InvalidRequest("query window too wide".into()));
        }

        abortable(cancel, async {
            let ids = self
                .store
                .find_eligible_houses(&window, guest_count)
                .await
                .map_err(BookingError::DependencyFailure)?;
            let priced = join_all(ids.iter().map(|&id| self.price_house(id, &window))).await;
            let mut houses: Vec<AvailableHouse> = priced.into_iter().flatten().collect();
            houses.sort_by_key(|h| h.house.id);
            tracing::debug!(%window, guest_count, found = houses.len(), "availability search");
            Ok(houses)
        })
        .await
    }

    async fn price_house(&self, id: HouseId, window: &StayWindow) -> Option<AvailableHouse> {
        let house = match self.catalog.get_by_id(id).await {
            Ok(Some(house)) => house,
            Ok(None) => {
                tracing::warn!(house_id = id, "eligible house missing from catalog, skipped");
                return None;
            }
            Err(e) => {
                tracing::warn!(house_id = id, error = %e, "house lookup failed, skipped");
                return None;
            }
        };
        if house.capacity == 0 {
            tracing::warn!(house_id = id, "house has no capacity, skipped");
            return None;
        }
        let (total_price, per_night_price) = match self.pricing.quote(house.base_price, window) {
            Ok(q) => q,
            Err(e) => {
                tracing::warn!(house_id = id, error = %e, "pricing failed, skipped");
                return None;
            }
        };
        let facilities = match self.catalog.facilities_for_house(id).await {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(house_id = id, error = %e, "facility lookup failed, skipped");
                return None;
            }
        };
        let add_ons = facilities
            .into_iter()
            .map(|f| AddOnOffer {
                facility_id: f.id,
                name: f.name,
                price: f.price,
                slots: self.slots.dates_for(window),
                fill_options: f.fill_options,
            })
            .collect();

        Some(AvailableHouse { house, per_night_price, total_price, add_ons })
    }
}
