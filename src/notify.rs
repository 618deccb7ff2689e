//! Outbound notifications.
//!
//! Booking notices are handed to a bounded queue and delivered by one
//! background worker, so a slow or failing notifier never delays a booking.
//! Delivery is best-effort: failures are logged and counted, never returned
//! to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("recipient unreachable: {0}")]
    Unreachable(String),
}

/// Everything a message about a new booking needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingNotice {
    pub reservation_id: Ulid,
    pub house_id: HouseId,
    pub house_name: String,
    pub check_in_from: String,
    pub check_out_until: String,
    pub window: StayWindow,
    pub guest_count: u32,
    pub guest_name: String,
    pub guest_email: String,
    pub guest_phone: String,
    pub total_price: i64,
    pub extras: Vec<PricedExtra>,
    pub add_ons: Vec<PricedAddOn>,
}

pub type ReminderNotice = UpcomingCheckIn;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn booking_created_for_admin(&self, notice: &BookingNotice) -> Result<(), NotifyError>;

    async fn booking_created_for_guest(
        &self,
        notice: &BookingNotice,
        messaging_id: i64,
    ) -> Result<(), NotifyError>;

    async fn remind(&self, reminders: &[ReminderNotice]) -> Result<(), NotifyError>;
}

#[derive(Debug)]
enum Notification {
    BookingCreated {
        notice: BookingNotice,
        guest_messaging_id: Option<i64>,
    },
}

/// Sending half of the dispatch queue. Cheap to clone.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<Notification>,
}

impl NotificationQueue {
    /// Start the dispatch worker. It drains what is already queued and exits
    /// once `shutdown` fires or every queue handle is dropped.
    pub fn spawn(
        notifier: Arc<dyn Notifier>,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(dispatch_loop(notifier, rx, shutdown));
        (Self { tx }, handle)
    }

    /// Queue admin and guest notices for a booking. Returns `false` when the
    /// notice was dropped.
    pub fn enqueue_booking(&self, notice: BookingNotice, guest_messaging_id: Option<i64>) -> bool {
        let reservation_id = notice.reservation_id;
        match self.tx.try_send(Notification::BookingCreated { notice, guest_messaging_id }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_DROPPED_TOTAL).increment(1);
                tracing::warn!(%reservation_id, "notification queue full, booking notice dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_DROPPED_TOTAL).increment(1);
                tracing::warn!(%reservation_id, "notification worker stopped, booking notice dropped");
                false
            }
        }
    }
}

async fn dispatch_loop(
    notifier: Arc<dyn Notifier>,
    mut rx: mpsc::Receiver<Notification>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(n) => dispatch(notifier.as_ref(), n).await,
                None => break,
            },
            _ = shutdown.cancelled() => {
                rx.close();
                while let Some(n) = rx.recv().await {
                    dispatch(notifier.as_ref(), n).await;
                }
                break;
            }
        }
    }
    tracing::debug!("notification worker stopped");
}

async fn dispatch(notifier: &dyn Notifier, notification: Notification) {
    match notification {
        Notification::BookingCreated { notice, guest_messaging_id } => {
            if let Err(e) = notifier.booking_created_for_admin(&notice).await {
                record_failure("admin", notice.reservation_id, &e);
            }
            if let Some(messaging_id) = guest_messaging_id
                && let Err(e) = notifier.booking_created_for_guest(&notice, messaging_id).await
            {
                record_failure("guest", notice.reservation_id, &e);
            }
        }
    }
}

fn record_failure(kind: &'static str, reservation_id: Ulid, err: &NotifyError) {
    metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL, "kind" => kind)
        .increment(1);
    tracing::error!(kind, %reservation_id, error = %err, "notification failed");
}

/// Writes every notification to the log. Used when no messaging service is
/// configured.
#[derive(Debug, Default)]
pub struct TracingNotifier;

fn to_json<T: Serialize>(value: &T) -> Result<String, NotifyError> {
    serde_json::to_string(value).map_err(|e| NotifyError::Delivery(e.to_string()))
}

#[async_trait]
impl Notifier for TracingNotifier {
    async fn booking_created_for_admin(&self, notice: &BookingNotice) -> Result<(), NotifyError> {
        let payload = to_json(notice)?;
        tracing::info!(
            target: "lodgebook::notify",
            reservation_id = %notice.reservation_id,
            house = %notice.house_name,
            stay = %notice.window,
            total = notice.total_price,
            %payload,
            "new booking"
        );
        Ok(())
    }

    async fn booking_created_for_guest(
        &self,
        notice: &BookingNotice,
        messaging_id: i64,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            target: "lodgebook::notify",
            messaging_id,
            reservation_id = %notice.reservation_id,
            "booking confirmed for {}: {} {}, check-in from {}, check-out until {}",
            notice.guest_name,
            notice.house_name,
            notice.window,
            notice.check_in_from,
            notice.check_out_until,
        );
        Ok(())
    }

    async fn remind(&self, reminders: &[ReminderNotice]) -> Result<(), NotifyError> {
        for r in reminders {
            let payload = to_json(r)?;
            tracing::info!(
                target: "lodgebook::notify",
                reservation_id = %r.reservation_id,
                messaging_id = ?r.guest_messaging_id,
                %payload,
                "check-in reminder"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records deliveries; optionally fails every call.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub fail: bool,
        pub admin: Mutex<Vec<Ulid>>,
        pub guest: Mutex<Vec<(Ulid, i64)>>,
        pub reminders: Mutex<Vec<Ulid>>,
    }

    impl RecordingNotifier {
        pub fn failing() -> Self {
            Self { fail: true, ..Self::default() }
        }

        fn outcome(&self) -> Result<(), NotifyError> {
            if self.fail {
                Err(NotifyError::Unreachable("test".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn booking_created_for_admin(&self, notice: &BookingNotice) -> Result<(), NotifyError> {
            self.outcome()?;
            self.admin.lock().unwrap().push(notice.reservation_id);
            Ok(())
        }

        async fn booking_created_for_guest(
            &self,
            notice: &BookingNotice,
            messaging_id: i64,
        ) -> Result<(), NotifyError> {
            self.outcome()?;
            self.guest.lock().unwrap().push((notice.reservation_id, messaging_id));
            Ok(())
        }

        async fn remind(&self, reminders: &[ReminderNotice]) -> Result<(), NotifyError> {
            self.outcome()?;
            self.reminders
                .lock()
                .unwrap()
                .extend(reminders.iter().map(|r| r.reservation_id));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use tokio::sync::{Notify, Semaphore};

    use super::testing::RecordingNotifier;
    use super::*;

    fn notice() -> BookingNotice {
        let d = |day| NaiveDate::from_ymd_opt(2024, 6, day).unwrap();
        BookingNotice {
            reservation_id: Ulid::new(),
            house_id: 1,
            house_name: "Barnhouse".into(),
            check_in_from: "14:00".into(),
            check_out_until: "12:00".into(),
            window: StayWindow::new(d(1), d(3)),
            guest_count: 2,
            guest_name: "Ann".into(),
            guest_email: "ann@example.com".into(),
            guest_phone: "+15550100".into(),
            total_price: 2200,
            extras: Vec::new(),
            add_ons: Vec::new(),
        }
    }

    #[tokio::test]
    async fn delivers_admin_and_guest_notices() {
        let notifier = Arc::new(RecordingNotifier::default());
        let token = CancellationToken::new();
        let (queue, handle) = NotificationQueue::spawn(notifier.clone(), 8, token.clone());

        let with_guest = notice();
        let admin_only = notice();
        assert!(queue.enqueue_booking(with_guest.clone(), Some(42)));
        assert!(queue.enqueue_booking(admin_only.clone(), None));

        token.cancel();
        handle.await.unwrap();

        assert_eq!(
            *notifier.admin.lock().unwrap(),
            vec![with_guest.reservation_id, admin_only.reservation_id]
        );
        assert_eq!(*notifier.guest.lock().unwrap(), vec![(with_guest.reservation_id, 42)]);
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let notifier = Arc::new(RecordingNotifier::failing());
        let token = CancellationToken::new();
        let (queue, handle) = NotificationQueue::spawn(notifier.clone(), 8, token.clone());
        assert!(queue.enqueue_booking(notice(), Some(1)));
        token.cancel();
        handle.await.unwrap();
        assert!(notifier.admin.lock().unwrap().is_empty());
    }

    struct Gated {
        started: Notify,
        release: Semaphore,
    }

    #[async_trait]
    impl Notifier for Gated {
        async fn booking_created_for_admin(&self, _: &BookingNotice) -> Result<(), NotifyError> {
            self.started.notify_one();
            self.release.acquire().await.unwrap().forget();
            Ok(())
        }
        async fn booking_created_for_guest(&self, _: &BookingNotice, _: i64) -> Result<(), NotifyError> {
            Ok(())
        }
        async fn remind(&self, _: &[ReminderNotice]) -> Result<(), NotifyError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let gated = Arc::new(Gated { started: Notify::new(), release: Semaphore::new(0) });
        let token = CancellationToken::new();
        let (queue, handle) = NotificationQueue::spawn(gated.clone(), 1, token.clone());

        assert!(queue.enqueue_booking(notice(), None));
        gated.started.notified().await; // worker is busy with the first notice
        assert!(queue.enqueue_booking(notice(), None)); // fills the single slot
        assert!(!queue.enqueue_booking(notice(), None));

        token.cancel();
        gated.release.add_permits(2);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn tracing_notifier_accepts_everything() {
        let n = TracingNotifier;
        tokio_test::assert_ok!(n.booking_created_for_admin(&notice()).await);
        tokio_test::assert_ok!(n.booking_created_for_guest(&notice(), 42).await);
        tokio_test::assert_ok!(n.remind(&[]).await);
    }
}
