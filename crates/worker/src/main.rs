use std::sync::Arc;

use queuekit::config::Config;
use queuekit::shutdown::shutdown_signal;
use queuekit::{db, telemetry, QueueRegistry};

mod handlers;
use handlers::{register_email_handlers, register_pdf_handlers, EmailJob, PdfJob};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    telemetry::init(cfg.environment);

    tracing::info!(
        worker_id = %cfg.worker_id,
        environment = ?cfg.environment,
        broker = ?cfg.broker.kind,
        lock_duration_secs = cfg.queue.lock_duration.as_secs(),
        stalled_interval_secs = cfg.queue.stalled_interval.as_secs(),
        shutdown_max_wait_secs = cfg.queue.drain.max_wait.as_secs(),
        dashboard = %cfg.dashboard.addr.clone().unwrap_or_else(|| "disabled".to_string()),
        migrate_on_startup = cfg.migrate_on_startup,
        "queuekit worker starting"
    );

    let broker = db::open_broker(&cfg).await?;
    let registry = Arc::new(QueueRegistry::new(broker, cfg.queue.clone()));

    let email = registry.create_queue::<EmailJob>("email").await?;
    let pdf = registry.create_queue::<PdfJob>("pdfGeneration").await?;
    register_email_handlers(&email);
    register_pdf_handlers(&pdf);

    // ---- Dashboard task ----
    let app = registry.dashboard().router(&cfg.dashboard.base_path);
    let dashboard_addr = cfg.dashboard.addr.clone();
    let base_path = cfg.dashboard.base_path.clone();
    let dashboard_handle = tokio::spawn(async move {
        if let Some(addr) = dashboard_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!("dashboard listening on http://{addr}{base_path}");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    tokio::select! {
        _ = shutdown_signal() => {}
        res = dashboard_handle => {
            // the dashboard only returns on error; shut queues down before surfacing it
            registry.shutdown_all().await;
            res??;
            return Ok(());
        }
    }

    let reports = registry.shutdown_all().await;
    for report in reports.iter().filter(|r| !r.is_clean()) {
        tracing::warn!(queue = %report.queue, outcome = ?report.outcome, errors = ?report.errors, "unclean queue shutdown");
    }

    tracing::info!("queuekit worker stopped");
    Ok(())
}
