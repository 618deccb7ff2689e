use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::availability::SlotTemplate;
use crate::engine::StoreError;
use crate::lifecycle::TransitionError;
use crate::limits::*;
use crate::model::*;
use crate::notify::{BookingNotice, NotificationQueue};
use crate::pricing::{PricingCalculator, PricingError};
use crate::store::{GuestDirectory, HouseCatalog, ReservationStore};

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    /// Rejected before any I/O.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("house {house_id} is not available for {window}")]
    HouseUnavailable { house_id: HouseId, window: StayWindow },

    #[error("unknown house: {0}")]
    UnknownHouse(HouseId),

    #[error("reservation not found: {0}")]
    ReservationNotFound(Ulid),

    #[error("reservation {0} belongs to another guest")]
    NotPermitted(Ulid),

    #[error(transparent)]
    AlreadyFinal(TransitionError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("dependency failure: {0}")]
    DependencyFailure(#[source] StoreError),
}

impl BookingError {
    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::InvalidRequest(_) => "invalid_request",
            BookingError::HouseUnavailable { .. } => "house_unavailable",
            BookingError::UnknownHouse(_) => "unknown_house",
            BookingError::ReservationNotFound(_) => "not_found",
            BookingError::NotPermitted(_) => "not_permitted",
            BookingError::AlreadyFinal(_) => "already_final",
            BookingError::Cancelled => "cancelled",
            BookingError::DependencyFailure(_) => "dependency_failure",
        }
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { house_id, window, .. } => {
                BookingError::HouseUnavailable { house_id, window }
            }
            StoreError::HouseNotFound(id) => BookingError::UnknownHouse(id),
            StoreError::ReservationNotFound(id) => BookingError::ReservationNotFound(id),
            StoreError::Forbidden(id) => BookingError::NotPermitted(id),
            StoreError::Transition(t) => BookingError::AlreadyFinal(t),
            StoreError::ExtraNotFound(_)
            | StoreError::FacilityNotFound(_)
            | StoreError::FillOptionNotFound { .. }
            | StoreError::FacilityNotOffered { .. }
            | StoreError::HouseInUse(_)
            | StoreError::VerificationNotFound
            | StoreError::VerificationExpired
            | StoreError::VerificationUsed
            | StoreError::GuestAlreadyBound(_)
            | StoreError::LimitExceeded(_) => BookingError::InvalidRequest(e.to_string()),
            other => BookingError::DependencyFailure(other),
        }
    }
}

impl From<PricingError> for BookingError {
    fn from(e: PricingError) -> Self {
        BookingError::InvalidRequest(e.to_string())
    }
}

/// Run `fut` unless `cancel` fires first. Only for work with no side effects.
pub(crate) async fn abortable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, BookingError>>,
) -> Result<T, BookingError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BookingError::Cancelled),
        r = fut => r,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BookingRequest {
    pub house_id: HouseId,
    pub contact: ContactInfo,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guest_count: u32,
    #[serde(default)]
    pub extras: Vec<ExtraRequest>,
    #[serde(default)]
    pub add_ons: Vec<AddOnRequest>,
}

fn invalid(msg: impl Into<String>) -> BookingError {
    BookingError::InvalidRequest(msg.into())
}

pub(crate) fn validate_contact(c: &ContactInfo) -> Result<(), BookingError> {
    if c.name.trim().is_empty() {
        return Err(invalid("guest name is required"));
    }
    if !c.phone.chars().any(|ch| ch.is_ascii_digit()) {
        return Err(invalid("guest phone is required"));
    }
    if !c.email.contains('@') {
        return Err(invalid("guest email is invalid"));
    }
    if c.name.len() > MAX_NAME_LEN || c.email.len() > MAX_CONTACT_LEN || c.phone.len() > MAX_CONTACT_LEN {
        return Err(invalid("contact field too long"));
    }
    Ok(())
}

impl BookingRequest {
    /// Shape checks that need no store access.
    pub fn validate(&self, slots: &SlotTemplate) -> Result<StayWindow, BookingError> {
        let window = StayWindow::try_new(self.check_in, self.check_out)
            .ok_or_else(|| invalid("check-in must be before check-out"))?;
        if window.check_in < min_valid_date() || window.check_out > max_valid_date() {
            return Err(invalid("dates out of range"));
        }
        if window.nights() > MAX_STAY_NIGHTS {
            return Err(invalid(format!("stay longer than {MAX_STAY_NIGHTS} nights")));
        }
        if self.guest_count == 0 {
            return Err(invalid("guest count must be positive"));
        }
        if self.guest_count > MAX_GUESTS_PER_BOOKING {
            return Err(invalid("too many guests"));
        }

        validate_contact(&self.contact)?;

        if self.extras.len() > MAX_EXTRAS_PER_BOOKING {
            return Err(invalid("too many extras"));
        }
        if let Some(e) = self
            .extras
            .iter()
            .find(|e| e.quantity == 0 || e.quantity > MAX_EXTRA_QUANTITY)
        {
            return Err(invalid(format!("bad quantity for extra {}", e.extra_id)));
        }
        if self.add_ons.len() > MAX_ADD_ONS_PER_BOOKING {
            return Err(invalid("too many add-ons"));
        }
        if let Some(a) = self.add_ons.iter().find(|a| !slots.contains(a, &window)) {
            return Err(invalid(format!(
                "add-on for facility {} on {} is outside the offered slots",
                a.facility_id, a.date
            )));
        }
        Ok(window)
    }
}

/// Books stays: re-checks availability, resolves the guest, prices and
/// persists the reservation, then queues notifications.
pub struct BookingOrchestrator {
    store: Arc<dyn ReservationStore>,
    catalog: Arc<dyn HouseCatalog>,
    guests: Arc<dyn GuestDirectory>,
    pricing: Arc<PricingCalculator>,
    slots: SlotTemplate,
    notifications: NotificationQueue,
}

struct Priced {
    house: House,
    quote: PriceQuote,
    total: i64,
}

impl BookingOrchestrator {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        catalog: Arc<dyn HouseCatalog>,
        guests: Arc<dyn GuestDirectory>,
        pricing: Arc<PricingCalculator>,
        slots: SlotTemplate,
        notifications: NotificationQueue,
    ) -> Self {
        Self { store, catalog, guests, pricing, slots, notifications }
    }

    /// Create a confirmed reservation.
    ///
    /// `cancel` is honoured until the guest record is resolved; from there the
    /// booking runs to completion. The reservation is durable before this
    /// returns, and notifications are queued only after that.
    pub async fn create_reservation(
        &self,
        request: BookingRequest,
        cancel: &CancellationToken,
    ) -> Result<Reservation, BookingError> {
        let started = Instant::now();
        let result = self.book(request, cancel).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "status" => status).increment(1);
        metrics::histogram!(crate::observability::BOOKING_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn book(
        &self,
        request: BookingRequest,
        cancel: &CancellationToken,
    ) -> Result<Reservation, BookingError> {
        let window = request.validate(&self.slots)?;
        let priced = abortable(cancel, self.price(&request, window)).await?;
        if cancel.is_cancelled() {
            return Err(BookingError::Cancelled);
        }

        let guest = self
            .guests
            .find_or_create(&request.contact)
            .await
            .map_err(BookingError::DependencyFailure)?;

        let now = Utc::now();
        let reservation = Reservation {
            id: Ulid::new(),
            house_id: request.house_id,
            guest_id: guest.id,
            window,
            guest_count: request.guest_count,
            status: ReservationStatus::Confirmed,
            total_price: priced.total,
            extras: priced
                .quote
                .extras
                .iter()
                .map(|e| ExtraLine { extra_id: e.extra_id, quantity: e.quantity, amount: e.amount })
                .collect(),
            add_ons: priced
                .quote
                .add_ons
                .iter()
                .map(|a| AddOnBooking {
                    facility_id: a.request.facility_id,
                    date: a.request.date,
                    time_from: a.request.time_from,
                    time_to: a.request.time_to,
                    fill_option_id: a.request.fill_option_id,
                    amount: a.amount,
                })
                .collect(),
            reminder_sent: false,
            created_at: now,
            updated_at: now,
        };

        self.store.create(reservation.clone()).await?;
        tracing::info!(
            reservation_id = %reservation.id,
            house_id = reservation.house_id,
            stay = %window,
            total = reservation.total_price,
            "reservation created"
        );

        let notice = BookingNotice {
            reservation_id: reservation.id,
            house_id: priced.house.id,
            house_name: priced.house.name,
            check_in_from: priced.house.check_in_from,
            check_out_until: priced.house.check_out_until,
            window,
            guest_count: reservation.guest_count,
            guest_name: guest.name,
            guest_email: guest.email,
            guest_phone: guest.phone,
            total_price: reservation.total_price,
            extras: priced.quote.extras,
            add_ons: priced.quote.add_ons,
        };
        self.notifications.enqueue_booking(notice, guest.messaging_id);
        Ok(reservation)
    }

    /// Read-only steps: availability, catalog, price lookup, total.
    async fn price(&self, request: &BookingRequest, window: StayWindow) -> Result<Priced, BookingError> {
        let house_id = request.house_id;
        if !self.store.is_available(house_id, &window).await? {
            return Err(BookingError::HouseUnavailable { house_id, window });
        }
        let house = self
            .catalog
            .get_by_id(house_id)
            .await
            .map_err(BookingError::DependencyFailure)?
            .ok_or(BookingError::UnknownHouse(house_id))?;
        if request.guest_count > house.capacity {
            return Err(invalid(format!(
                "{} guests exceed capacity {} of house {house_id}",
                request.guest_count, house.capacity
            )));
        }
        let quote = self
            .store
            .price_lookup(house_id, &request.extras, &request.add_ons)
            .await?;
        let total = self
            .pricing
            .total(quote.house_base_price, quote.extras_total(), &window)?;
        Ok(Priced { house, quote, total })
    }

    /// Cancel on behalf of `requester`. `cancel` is checked once up front; the
    /// status write itself always runs to completion.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        requester: Requester,
        cancel: &CancellationToken,
    ) -> Result<Reservation, BookingError> {
        if cancel.is_cancelled() {
            return Err(BookingError::Cancelled);
        }
        let reservation = self.store.cancel(id, requester).await?;
        let who = match requester {
            Requester::Guest { .. } => "guest",
            Requester::Admin => "admin",
        };
        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL, "requester" => who).increment(1);
        tracing::info!(
            reservation_id = %id,
            house_id = reservation.house_id,
            requester = who,
            "reservation cancelled"
        );
        Ok(reservation)
    }

    /// Reservations of the guest behind `messaging_id`, ordered by check-in.
    pub async fn reservations_for_guest(
        &self,
        messaging_id: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Reservation>, BookingError> {
        abortable(cancel, self.own_reservations(messaging_id)).await
    }

    async fn own_reservations(&self, messaging_id: i64) -> Result<Vec<Reservation>, BookingError> {
        self.store
            .list_for_guest(messaging_id)
            .await
            .map_err(BookingError::DependencyFailure)
    }

    /// One reservation, visible to its guest or an admin.
    pub async fn reservation(
        &self,
        id: Ulid,
        requester: Requester,
        cancel: &CancellationToken,
    ) -> Result<Reservation, BookingError> {
        abortable(cancel, self.visible_reservation(id, requester)).await
    }

    async fn visible_reservation(
        &self,
        id: Ulid,
        requester: Requester,
    ) -> Result<Reservation, BookingError> {
        match requester {
            Requester::Admin => self
                .store
                .get(id)
                .await
                .map_err(BookingError::DependencyFailure)?
                .ok_or(BookingError::ReservationNotFound(id)),
            Requester::Guest { messaging_id } => {
                let own = self.own_reservations(messaging_id).await?;
                if let Some(r) = own.into_iter().find(|r| r.id == id) {
                    return Ok(r);
                }
                match self.store.get(id).await.map_err(BookingError::DependencyFailure)? {
                    Some(_) => Err(BookingError::NotPermitted(id)),
                    None => Err(BookingError::ReservationNotFound(id)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveTime};

    use super::*;
    use crate::engine::Engine;
    use crate::notify::testing::RecordingNotifier;
    use crate::pricing::RateRule;
    use crate::store::StatusUpdateResult;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lodgebook_test_booking");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn request(check_in: NaiveDate, check_out: NaiveDate) -> BookingRequest {
        BookingRequest {
            house_id: 1,
            contact: ContactInfo {
                name: "Ann".into(),
                email: "ann@example.com".into(),
                phone: "+1 555 0100".into(),
            },
            check_in,
            check_out,
            guest_count: 2,
            extras: Vec::new(),
            add_ons: Vec::new(),
        }
    }

    struct Fixture {
        engine: Arc<Engine>,
        notifier: Arc<RecordingNotifier>,
        orchestrator: BookingOrchestrator,
        shutdown: CancellationToken,
        worker: tokio::task::JoinHandle<()>,
    }

    impl Fixture {
        async fn new(name: &str, rules: Vec<RateRule>) -> Self {
            let engine = Arc::new(Engine::new(test_wal_path(name)).unwrap());
            engine
                .register_house(House {
                    id: 1,
                    name: "Barnhouse".into(),
                    capacity: 4,
                    base_price: 1000,
                    check_in_from: "14:00".into(),
                    check_out_until: "12:00".into(),
                })
                .await
                .unwrap();
            engine
                .register_extra(Extra { id: 1, name: "Firewood".into(), price: 100 })
                .await
                .unwrap();
            let notifier = Arc::new(RecordingNotifier::default());
            let shutdown = CancellationToken::new();
            let (queue, worker) = NotificationQueue::spawn(notifier.clone(), 16, shutdown.clone());
            let orchestrator = BookingOrchestrator::new(
                engine.clone(),
                engine.clone(),
                engine.clone(),
                Arc::new(PricingCalculator::new(rules)),
                SlotTemplate::default(),
                queue,
            );
            Self { engine, notifier, orchestrator, shutdown, worker }
        }

        /// Bind `messaging_id` to the guest behind [`request`]'s contact.
        async fn bind(&self, messaging_id: i64) {
            let contact = request(d(2024, 6, 1), d(2024, 6, 2)).contact;
            let code = self
                .engine
                .issue_verification(&contact, Utc::now() + chrono::Duration::minutes(10))
                .await
                .unwrap()
                .code;
            self.engine
                .approve_verification(&code, messaging_id, Utc::now())
                .await
                .unwrap();
        }

        async fn drain(self) -> Arc<RecordingNotifier> {
            drop(self.orchestrator);
            self.shutdown.cancel();
            self.worker.await.unwrap();
            self.notifier
        }
    }

    #[tokio::test]
    async fn books_prices_and_notifies() {
        let fx = Fixture::new("books.wal", Vec::new()).await;
        fx.bind(42).await;
        let mut req = request(d(2024, 6, 1), d(2024, 6, 3));
        req.extras = vec![ExtraRequest { extra_id: 1, quantity: 2 }];

        let r = fx
            .orchestrator
            .create_reservation(req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(r.status, ReservationStatus::Confirmed);
        assert_eq!(r.total_price, 2200);
        assert_eq!(r.extras, vec![ExtraLine { extra_id: 1, quantity: 2, amount: 200 }]);
        assert_eq!(fx.engine.get(r.id).await.unwrap(), r);

        let notifier = fx.drain().await;
        assert_eq!(*notifier.admin.lock().unwrap(), vec![r.id]);
        assert_eq!(*notifier.guest.lock().unwrap(), vec![(r.id, 42)]);
    }

    #[tokio::test]
    async fn overlapping_request_is_unavailable() {
        let fx = Fixture::new("overlap_booking.wal", Vec::new()).await;
        let token = CancellationToken::new();
        fx.orchestrator
            .create_reservation(request(d(2024, 7, 10), d(2024, 7, 12)), &token)
            .await
            .unwrap();
        let err = fx
            .orchestrator
            .create_reservation(request(d(2024, 7, 11), d(2024, 7, 13)), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::HouseUnavailable { house_id: 1, .. }));
        fx.orchestrator
            .create_reservation(request(d(2024, 7, 12), d(2024, 7, 14)), &token)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn seasonal_rate_applies() {
        let rules = vec![RateRule { start: d(2024, 1, 5), end: d(2024, 1, 15), rate: 1.5 }];
        let fx = Fixture::new("seasonal.wal", rules).await;
        let r = fx
            .orchestrator
            .create_reservation(request(d(2024, 1, 4), d(2024, 1, 6)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(r.total_price, 2500);
    }

    #[tokio::test]
    async fn validation_rejects_bad_requests() {
        let slots = SlotTemplate::default();
        let same_day = request(d(2024, 6, 1), d(2024, 6, 1));
        assert!(matches!(same_day.validate(&slots), Err(BookingError::InvalidRequest(_))));

        let mut no_guests = request(d(2024, 6, 1), d(2024, 6, 2));
        no_guests.guest_count = 0;
        assert!(no_guests.validate(&slots).is_err());

        let mut no_phone = request(d(2024, 6, 1), d(2024, 6, 2));
        no_phone.contact.phone = "n/a".into();
        assert!(no_phone.validate(&slots).is_err());

        let mut zero_qty = request(d(2024, 6, 1), d(2024, 6, 2));
        zero_qty.extras = vec![ExtraRequest { extra_id: 1, quantity: 0 }];
        assert!(zero_qty.validate(&slots).is_err());

        let mut late_add_on = request(d(2024, 6, 1), d(2024, 6, 2));
        late_add_on.add_ons = vec![AddOnRequest {
            facility_id: 1,
            date: d(2024, 6, 1),
            time_from: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            time_to: NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
            fill_option_id: None,
        }];
        assert!(late_add_on.validate(&slots).is_err());

        assert_eq!(
            request(d(2024, 6, 1), d(2024, 6, 3)).validate(&slots).unwrap().nights(),
            2
        );
    }

    #[tokio::test]
    async fn over_capacity_is_invalid() {
        let fx = Fixture::new("over_capacity.wal", Vec::new()).await;
        let mut req = request(d(2024, 6, 1), d(2024, 6, 3));
        req.guest_count = 5;
        let err = fx
            .orchestrator
            .create_reservation(req, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn unknown_extra_is_invalid_and_persists_nothing() {
        let fx = Fixture::new("unknown_extra.wal", Vec::new()).await;
        let mut req = request(d(2024, 6, 1), d(2024, 6, 3));
        req.extras = vec![ExtraRequest { extra_id: 9, quantity: 1 }];
        let err = fx
            .orchestrator
            .create_reservation(req, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::InvalidRequest(_)));
        assert!(fx.engine.list_for_guest(42).await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_persistence_has_no_effect() {
        let fx = Fixture::new("cancel_token.wal", Vec::new()).await;
        let token = CancellationToken::new();
        token.cancel();
        let err = fx
            .orchestrator
            .create_reservation(request(d(2024, 6, 1), d(2024, 6, 3)), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::Cancelled));
        let window = StayWindow::new(d(2024, 6, 1), d(2024, 6, 3));
        assert!(fx.engine.is_available(1, &window).await.unwrap());
        let notifier = fx.drain().await;
        assert!(notifier.admin.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn guest_cancels_own_and_sees_only_own() {
        let fx = Fixture::new("guest_cancel.wal", Vec::new()).await;
        fx.bind(42).await;
        let token = CancellationToken::new();
        let r = fx
            .orchestrator
            .create_reservation(request(d(2024, 6, 1), d(2024, 6, 3)), &token)
            .await
            .unwrap();

        let stranger = Requester::Guest { messaging_id: 7 };
        assert!(matches!(
            fx.orchestrator.reservation(r.id, stranger, &token).await,
            Err(BookingError::NotPermitted(_))
        ));
        assert!(matches!(
            fx.orchestrator.cancel_reservation(r.id, stranger, &token).await,
            Err(BookingError::NotPermitted(_))
        ));

        let owner = Requester::Guest { messaging_id: 42 };
        assert_eq!(fx.orchestrator.reservation(r.id, owner, &token).await.unwrap().id, r.id);
        let cancelled = fx.orchestrator.cancel_reservation(r.id, owner, &token).await.unwrap();
        assert_eq!(cancelled.status, ReservationStatus::Cancelled);
        assert!(matches!(
            fx.orchestrator.cancel_reservation(r.id, Requester::Admin, &token).await,
            Err(BookingError::AlreadyFinal(_))
        ));
        assert_eq!(fx.orchestrator.reservations_for_guest(42, &token).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeating_a_contact_grants_no_ownership() {
        let fx = Fixture::new("contact_reuse.wal", Vec::new()).await;
        let token = CancellationToken::new();
        let victim = fx
            .orchestrator
            .create_reservation(request(d(2024, 6, 1), d(2024, 6, 3)), &token)
            .await
            .unwrap();

        // Same phone and email, different person.
        let second = fx
            .orchestrator
            .create_reservation(request(d(2024, 6, 5), d(2024, 6, 6)), &token)
            .await
            .unwrap();
        assert_eq!(second.guest_id, victim.guest_id);
        assert_eq!(fx.engine.get_guest(&victim.guest_id).unwrap().messaging_id, None);

        let intruder = Requester::Guest { messaging_id: 666 };
        assert!(matches!(
            fx.orchestrator.cancel_reservation(victim.id, intruder, &token).await,
            Err(BookingError::NotPermitted(_))
        ));
        assert!(fx.orchestrator.reservations_for_guest(666, &token).await.unwrap().is_empty());
        assert_eq!(fx.engine.get(victim.id).await.unwrap().status, ReservationStatus::Confirmed);
    }

    #[tokio::test]
    async fn cancelled_token_stops_guest_operations() {
        let fx = Fixture::new("guest_ops_token.wal", Vec::new()).await;
        fx.bind(42).await;
        let r = fx
            .orchestrator
            .create_reservation(request(d(2024, 6, 1), d(2024, 6, 3)), &CancellationToken::new())
            .await
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let owner = Requester::Guest { messaging_id: 42 };
        assert!(matches!(
            fx.orchestrator.cancel_reservation(r.id, owner, &token).await,
            Err(BookingError::Cancelled)
        ));
        assert!(matches!(
            fx.orchestrator.reservation(r.id, owner, &token).await,
            Err(BookingError::Cancelled)
        ));
        assert!(matches!(
            fx.orchestrator.reservations_for_guest(42, &token).await,
            Err(BookingError::Cancelled)
        ));
        assert_eq!(fx.engine.get(r.id).await.unwrap().status, ReservationStatus::Confirmed);
    }

    /// Store that counts calls and always fails.
    #[derive(Default)]
    struct DownStore {
        calls: AtomicUsize,
    }

    impl DownStore {
        fn fail<T>(&self) -> Result<T, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::WalError("store offline".into()))
        }
    }

    #[async_trait]
    impl ReservationStore for DownStore {
        async fn find_eligible_houses(&self, _: &StayWindow, _: u32) -> Result<Vec<HouseId>, StoreError> {
            self.fail()
        }
        async fn is_available(&self, _: HouseId, _: &StayWindow) -> Result<bool, StoreError> {
            self.fail()
        }
        async fn price_lookup(
            &self,
            _: HouseId,
            _: &[ExtraRequest],
            _: &[AddOnRequest],
        ) -> Result<PriceQuote, StoreError> {
            self.fail()
        }
        async fn create(&self, _: Reservation) -> Result<(), StoreError> {
            self.fail()
        }
        async fn get(&self, _: Ulid) -> Result<Option<Reservation>, StoreError> {
            self.fail()
        }
        async fn list_by_status(&self, _: ReservationStatus) -> Result<Vec<Reservation>, StoreError> {
            self.fail()
        }
        async fn list_for_guest(&self, _: i64) -> Result<Vec<Reservation>, StoreError> {
            self.fail()
        }
        async fn batch_update_status(
            &self,
            _: Vec<StatusChange>,
        ) -> Result<Vec<StatusUpdateResult>, StoreError> {
            self.fail()
        }
        async fn list_upcoming_check_ins(&self, _: NaiveDate) -> Result<Vec<UpcomingCheckIn>, StoreError> {
            self.fail()
        }
        async fn mark_reminded(&self, _: Ulid) -> Result<(), StoreError> {
            self.fail()
        }
        async fn cancel(&self, _: Ulid, _: Requester) -> Result<Reservation, StoreError> {
            self.fail()
        }
    }

    #[tokio::test]
    async fn invalid_request_never_touches_the_store() {
        let store = Arc::new(DownStore::default());
        let engine = Arc::new(Engine::new(test_wal_path("untouched.wal")).unwrap());
        let (queue, _worker) = NotificationQueue::spawn(
            Arc::new(RecordingNotifier::default()),
            4,
            CancellationToken::new(),
        );
        let orchestrator = BookingOrchestrator::new(
            store.clone(),
            engine.clone(),
            engine,
            Arc::new(PricingCalculator::default()),
            SlotTemplate::default(),
            queue,
        );

        let err = orchestrator
            .create_reservation(request(d(2024, 6, 1), d(2024, 6, 1)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::InvalidRequest(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);

        let err = orchestrator
            .create_reservation(request(d(2024, 6, 1), d(2024, 6, 2)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::DependencyFailure(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }
}
