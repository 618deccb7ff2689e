use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use ulid::Ulid;

use crate::availability::{AvailabilityService, SlotTemplate};
use crate::booking::BookingOrchestrator;
use crate::engine::{Engine, StoreError};
use crate::model::StayWindow;
use crate::notify::{NotificationQueue, Notifier};
use crate::pricing::PricingCalculator;
use crate::reconcile::{CompactionJob, ReminderJob, StatusReconciler};
use crate::scheduler::{Schedule, Scheduler, SystemClock};
use crate::settings::{CatalogSettings, ConfigError, Settings};
use crate::verification::VerificationService;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

/// Fully wired service: store, query and booking services, background jobs
/// and the notification worker.
pub struct App {
    pub engine: Arc<Engine>,
    pub availability: Arc<AvailabilityService>,
    pub booking: Arc<BookingOrchestrator>,
    pub verification: Arc<VerificationService>,
    scheduler: Scheduler,
    shutdown: CancellationToken,
    notification_worker: JoinHandle<()>,
}

impl App {
    pub async fn build(settings: &Settings, notifier: Arc<dyn Notifier>) -> Result<Self, AppError> {
        std::fs::create_dir_all(&settings.data_dir)?;
        let engine = Arc::new(Engine::new(settings.wal_path())?);
        seed_catalog(&engine, &settings.catalog).await?;

        let pricing = Arc::new(PricingCalculator::new(
            settings.reservations.price_coefficients.clone(),
        ));
        let slots = SlotTemplate::default();
        let shutdown = CancellationToken::new();
        let (queue, notification_worker) = NotificationQueue::spawn(
            notifier.clone(),
            settings.notifications.queue_capacity,
            shutdown.child_token(),
        );

        let availability = Arc::new(AvailabilityService::new(
            engine.clone(),
            engine.clone(),
            pricing.clone(),
            slots,
        ));
        let booking = Arc::new(BookingOrchestrator::new(
            engine.clone(),
            engine.clone(),
            engine.clone(),
            pricing,
            slots,
            queue,
        ));
        let verification = Arc::new(VerificationService::new(
            engine.clone(),
            chrono::Duration::seconds(settings.verification.ttl_secs as i64),
        ));

        let run_on_start = settings.scheduler.run_on_start;
        let mut scheduler = Scheduler::new(Arc::new(SystemClock));
        scheduler
            .add(
                Schedule::Every(Duration::from_secs(settings.scheduler.status_interval_secs)),
                Arc::new(StatusReconciler::new(engine.clone())),
                run_on_start,
            )
            .add(
                Schedule::DailyAt(settings.reminder_time()?),
                Arc::new(ReminderJob::new(
                    engine.clone(),
                    notifier,
                    settings.reservations.notification_threshold_days,
                )),
                run_on_start,
            )
            .add(
                Schedule::Every(Duration::from_secs(settings.scheduler.compaction_interval_secs)),
                Arc::new(CompactionJob::new(engine.clone(), settings.compact_threshold)),
                false,
            );

        Ok(Self {
            engine,
            availability,
            booking,
            verification,
            scheduler,
            shutdown,
            notification_worker,
        })
    }

    pub fn start(&mut self) {
        self.scheduler.start(&self.shutdown);
    }

    /// Stop the jobs, then let the notification worker drain its queue.
    pub async fn shutdown(mut self) {
        self.scheduler.stop().await;
        self.shutdown.cancel();
        if let Err(e) = self.notification_worker.await {
            tracing::error!("notification worker failed: {e}");
        }
        info!("lodgebook stopped");
    }
}

/// Bring the store's catalog in line with the configured one: missing
/// entries are registered, changed ones updated. Entries absent from the
/// file are left alone.
pub async fn seed_catalog(engine: &Engine, catalog: &CatalogSettings) -> Result<(), StoreError> {
    let (mut added, mut updated) = (0usize, 0usize);
    for house in &catalog.houses {
        match engine.get_house(house.id).await {
            None => {
                engine.register_house(house.clone()).await?;
                added += 1;
            }
            Some(stored) if stored != *house => {
                engine.update_house(house.clone()).await?;
                updated += 1;
            }
            Some(_) => {}
        }
    }
    for extra in &catalog.extras {
        match engine.get_extra(extra.id) {
            None => {
                engine.register_extra(extra.clone()).await?;
                added += 1;
            }
            Some(stored) if stored != *extra => {
                engine.update_extra(extra.clone()).await?;
                updated += 1;
            }
            Some(_) => {}
        }
    }
    for facility in &catalog.facilities {
        match engine.get_facility(facility.id) {
            None => {
                engine.register_facility(facility.clone()).await?;
                added += 1;
            }
            Some(stored) if stored != *facility => {
                engine.update_facility(facility.clone()).await?;
                updated += 1;
            }
            Some(_) => {}
        }
    }
    for b in &catalog.blackouts {
        let window = StayWindow::try_new(b.start, b.end)
            .ok_or(StoreError::LimitExceeded("blackout start must be before end"))?;
        let known = engine.list_blackouts(b.house_id).await?;
        if known.iter().any(|(_, w)| *w == window) {
            continue;
        }
        engine
            .add_blackout(Ulid::new(), b.house_id, window, b.reason.clone())
            .await?;
        added += 1;
    }
    if added + updated > 0 {
        info!(added, updated, "catalog seeded from settings");
    }
    Ok(())
}
