//! Runs background jobs on fixed intervals or at a daily wall-clock time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Days, Local, NaiveDate, NaiveDateTime, NaiveTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::engine::StoreError;
use crate::notify::NotifyError;

/// Per-run counts, logged as one summary line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobReport {
    pub examined: usize,
    pub changed: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("notifier: {0}")]
    Notify(#[from] NotifyError),
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    /// One pass. Implementations check `cancel` between items.
    async fn run(&self, today: NaiveDate, cancel: &CancellationToken) -> Result<JobReport, JobError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Every(Duration),
    DailyAt(NaiveTime),
}

impl Schedule {
    /// Time to wait from `now` until the next run.
    pub fn next_delay(&self, now: NaiveDateTime) -> Duration {
        match *self {
            Schedule::Every(period) => period,
            Schedule::DailyAt(at) => {
                let today_at = now.date().and_time(at);
                let next = if today_at > now {
                    today_at
                } else {
                    now.date()
                        .checked_add_days(Days::new(1))
                        .map_or(today_at, |d| d.and_time(at))
                };
                (next - now).to_std().unwrap_or(Duration::ZERO)
            }
        }
    }
}

struct Entry {
    schedule: Schedule,
    job: Arc<dyn Job>,
    run_on_start: bool,
}

/// Owns the `(Schedule, Job)` list and the tasks driving it.
pub struct Scheduler {
    entries: Vec<Entry>,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Vec::new(),
            clock,
            token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Register a job. With `run_on_start` it also runs once right away.
    pub fn add(&mut self, schedule: Schedule, job: Arc<dyn Job>, run_on_start: bool) -> &mut Self {
        self.entries.push(Entry { schedule, job, run_on_start });
        self
    }

    /// Spawn one task per job. Cancelling `parent` stops them too.
    pub fn start(&mut self, parent: &CancellationToken) {
        self.token = parent.child_token();
        for entry in &self.entries {
            let handle = tokio::spawn(run_entry(
                entry.schedule,
                entry.job.clone(),
                entry.run_on_start,
                self.clock.clone(),
                self.token.clone(),
            ));
            self.handles.push(handle);
        }
        info!(jobs = self.entries.len(), "scheduler started");
    }

    /// Cancel every job and wait for in-flight runs to finish.
    pub async fn stop(&mut self) {
        self.token.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!("scheduler task failed: {e}");
            }
        }
        info!("scheduler stopped");
    }
}

async fn run_entry(
    schedule: Schedule,
    job: Arc<dyn Job>,
    run_on_start: bool,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
) {
    if run_on_start {
        run_once(job.as_ref(), clock.as_ref(), &token).await;
    }
    loop {
        let delay = schedule.next_delay(clock.now());
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => run_once(job.as_ref(), clock.as_ref(), &token).await,
        }
    }
}

async fn run_once(job: &dyn Job, clock: &dyn Clock, token: &CancellationToken) {
    if token.is_cancelled() {
        return;
    }
    let name = job.name();
    let today = clock.now().date();
    let started = Instant::now();
    let result = job.run(today, token).await;
    let elapsed = started.elapsed();
    metrics::histogram!(crate::observability::JOB_DURATION_SECONDS, "job" => name)
        .record(elapsed.as_secs_f64());

    match result {
        Ok(report) => {
            metrics::counter!(crate::observability::JOB_RUNS_TOTAL, "job" => name, "status" => "ok")
                .increment(1);
            info!(
                job = name,
                %today,
                examined = report.examined,
                changed = report.changed,
                failed = report.failed,
                elapsed_ms = elapsed.as_millis() as u64,
                "job finished"
            );
        }
        Err(e) => {
            metrics::counter!(crate::observability::JOB_RUNS_TOTAL, "job" => name, "status" => "error")
                .increment(1);
            error!(job = name, %today, error = %e, "job failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, 10)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn daily_schedule_waits_until_the_time() {
        let s = Schedule::DailyAt(NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(s.next_delay(at(8, 30)), Duration::from_secs(30 * 60));
        // Already past: tomorrow.
        assert_eq!(s.next_delay(at(9, 0)), Duration::from_secs(24 * 3600));
        assert_eq!(s.next_delay(at(10, 0)), Duration::from_secs(23 * 3600));
    }

    #[test]
    fn interval_schedule_is_constant() {
        let s = Schedule::Every(Duration::from_secs(60));
        assert_eq!(s.next_delay(at(0, 0)), Duration::from_secs(60));
    }

    struct Counting {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Job for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self, _: NaiveDate, _: &CancellationToken) -> Result<JobReport, JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(JobReport::default())
        }
    }

    #[tokio::test]
    async fn runs_on_start_and_on_interval_until_stopped() {
        let job = Arc::new(Counting { runs: AtomicUsize::new(0) });
        let mut scheduler = Scheduler::new(Arc::new(SystemClock));
        scheduler.add(Schedule::Every(Duration::from_millis(20)), job.clone(), true);

        let root = CancellationToken::new();
        scheduler.start(&root);
        tokio::time::sleep(Duration::from_millis(110)).await;
        scheduler.stop().await;

        let runs = job.runs.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected start run plus interval runs, got {runs}");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), runs);
    }

    #[tokio::test]
    async fn parent_cancellation_stops_jobs() {
        let job = Arc::new(Counting { runs: AtomicUsize::new(0) });
        let mut scheduler = Scheduler::new(Arc::new(SystemClock));
        scheduler.add(Schedule::DailyAt(NaiveTime::MIN), job.clone(), false);

        let root = CancellationToken::new();
        scheduler.start(&root);
        root.cancel();
        scheduler.stop().await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }
}
