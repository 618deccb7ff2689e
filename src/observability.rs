use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking attempts. Labels: status.
pub const BOOKINGS_TOTAL: &str = "lodgebook_bookings_total";

/// Histogram: booking latency in seconds, validation to persistence.
pub const BOOKING_DURATION_SECONDS: &str = "lodgebook_booking_duration_seconds";

/// Counter: availability queries. Labels: status.
pub const AVAILABILITY_QUERIES_TOTAL: &str = "lodgebook_availability_queries_total";

/// Counter: cancellations. Labels: requester.
pub const CANCELLATIONS_TOTAL: &str = "lodgebook_cancellations_total";

// ── Background work ─────────────────────────────────────────────

/// Counter: status moves applied by reconciliation. Labels: to.
pub const STATUS_TRANSITIONS_TOTAL: &str = "lodgebook_status_transitions_total";

/// Counter: check-in reminders sent.
pub const REMINDERS_SENT_TOTAL: &str = "lodgebook_reminders_sent_total";

/// Counter: scheduled job runs. Labels: job, status.
pub const JOB_RUNS_TOTAL: &str = "lodgebook_job_runs_total";

/// Histogram: scheduled job duration in seconds. Labels: job.
pub const JOB_DURATION_SECONDS: &str = "lodgebook_job_duration_seconds";

/// Counter: notifications the notifier failed to deliver. Labels: kind.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "lodgebook_notifications_failed_total";

/// Counter: notifications dropped because the dispatch queue was full.
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "lodgebook_notifications_dropped_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lodgebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "lodgebook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
