use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use lodgebook::app::App;
use lodgebook::notify::TracingNotifier;
use lodgebook::settings::Settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::load()?;
    lodgebook::observability::init(settings.metrics_port)?;

    let mut app = App::build(&settings, Arc::new(TracingNotifier)).await?;
    app.start();

    info!("lodgebook running");
    info!("  data_dir: {}", settings.data_dir.display());
    info!("  houses: {}", app.engine.list_houses().await.len());
    info!("  price coefficients: {}", settings.reservations.price_coefficients.len());
    info!(
        "  reminders: {} day(s) ahead at {}",
        settings.reservations.notification_threshold_days, settings.scheduler.reminder_time
    );
    info!(
        "  metrics: {}",
        settings
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown on SIGTERM/ctrl-c: stop jobs, drain notifications.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = ctrl_c => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received");
    app.shutdown().await;
    Ok(())
}
