use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use resonance_worker::queue::SchemaRegistry;
use resonance_worker::scan::ScanDirectoryHandler;
use resonance_worker::store::PgStore;
use resonance_worker::{Config, InflightLimiter, JobQueueService, WorkerLoop};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "resonance_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        worker_id = %config.worker_id,
        environment = %config.environment(),
        "Starting Resonance worker"
    );

    // Initialize database pool
    tracing::info!(url = %config.database().redacted_url(), "Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.database().max_connections)
        .acquire_timeout(config.database().connect_timeout())
        .connect(&config.database().url)
        .await?;
    tracing::info!("Database connection established");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Migrations completed successfully");

    let store = Arc::new(PgStore::new(pool.clone()));
    let queue = JobQueueService::new(
        store.clone(),
        config.queue().clone(),
        SchemaRegistry::with_defaults(),
    );
    let limiter = Arc::new(InflightLimiter::new(
        config.global_concurrency(),
        config.type_caps(),
    ));

    let mut worker = WorkerLoop::new(config.worker_id.clone(), queue, limiter);
    worker.register(Arc::new(ScanDirectoryHandler::new(
        store,
        config.scan.clone(),
    )));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    worker.run(shutdown).await;

    pool.close().await;
    tracing::info!("Resonance worker stopped");
    Ok(())
}
