use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use courier_dispatcher::config::Settings;
use courier_dispatcher::infrastructure::postgres::PostgresPool;
use courier_dispatcher::infrastructure::redis::RedisPool;
use courier_dispatcher::queue::{JobQueue, RedisQueue};
use courier_dispatcher::server::{create_app, AppState};
use courier_dispatcher::store::{NotificationStore, PostgresStore};
use courier_dispatcher::tasks::StallSweeper;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    // Probe the database before serving; a dead store means a dead service.
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

    let app = create_app(state.clone());
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(shutdown_tx.clone()))
        .await?;

    // Drain in-flight jobs, then release connections.
    state.worker_pool.shutdown().await;
    let _ = sweeper_handle.await;
    redis_pool.close().await;
    pg.close().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal_handler(shutdown_tx: broadcast::Sender<()>) {
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

    // Stop the background tasks
    let _ = shutdown_tx.send(());
}
