//! Standalone worker process: runs the pool, the stall sweeper and a
//! self-health probe without the HTTP control plane.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use courier_dispatcher::config::Settings;
use courier_dispatcher::infrastructure::postgres::PostgresPool;
use courier_dispatcher::infrastructure::redis::RedisPool;
use courier_dispatcher::queue::{JobQueue, RedisQueue};
use courier_dispatcher::server::AppState;
use courier_dispatcher::store::{NotificationStore, PostgresStore};
use courier_dispatcher::tasks::{HealthProbe, StallSweeper};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    let pg = PostgresPool::new(&settings.database).await?;
    pg.ping().await?;
    tracing::info!(database = %pg.database_url_masked(), "Database reachable");

    let redis_pool = Arc::new(RedisPool::new(&settings.redis)?);
    let store: Arc<dyn NotificationStore> = Arc::new(PostgresStore::new(pg.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(
        redis_pool.clone(),
        settings.worker.queue_prefix.clone(),
    ));

    let state = AppState::new(settings.clone(), store.clone(), queue.clone());
    state.worker_pool.start();

    let (shutdown_tx, _) = broadcast::channel(1);

    let sweeper = StallSweeper::new(
        store.clone(),
        queue.clone(),
        settings.worker.clone(),
        shutdown_tx.subscribe(),
    );
    let sweeper_handle = tokio::spawn(async move {
        sweeper.run().await;
    });

    let probe = HealthProbe::new(store.clone(), queue.clone(), shutdown_tx.subscribe());
    let probe_handle = tokio::spawn(async move {
        probe.run().await;
    });

    tracing::info!("Worker process running");
    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(());
    state.worker_pool.shutdown().await;
    let _ = tokio::join!(sweeper_handle, probe_handle);
    redis_pool.close().await;
    pg.close().await;

    tracing::info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
