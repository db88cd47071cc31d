use std::process::ExitCode;
use std::sync::Arc;
use syncd_coordinator::config::Config;
use syncd_coordinator::coordinator::Coordinator;
use syncd_coordinator::persistence::Persistence;
use syncd_coordinator::server::build_router;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("failed to load configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let persistence = match Persistence::connect_with_cache_capacity(&config.database.url, config.cache.capacity).await {
        Ok(persistence) => Arc::new(persistence),
        Err(err) => {
            tracing::error!("failed to initialize storage: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let coordinator = Arc::new(Coordinator::new(persistence, config.sync.clone()).await);
    spawn_background_tasks(Arc::clone(&coordinator));

    let router = build_router(coordinator);
    let address = config.server_address();

    let listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("failed to bind {}: {}", address, err);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("syncd-coordinator listening on {}", address);
    if let Err(err) = axum::serve(listener, router).await {
        tracing::error!("server error: {}", err);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Periodic heartbeat sweep and event-log housekeeping, run for the
/// lifetime of the process (SPEC_FULL B.1).
fn spawn_background_tasks(coordinator: Arc<Coordinator>) {
    let heartbeat_interval = coordinator.sync_config.heartbeat_interval_ms;
    let sweep_coordinator = Arc::clone(&coordinator);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(heartbeat_interval));
        loop {
            interval.tick().await;
            if let Err(err) = sweep_coordinator.sweep_stale_nodes().await {
                tracing::warn!("heartbeat sweep failed: {}", err);
            }
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(6 * 60 * 60));
        loop {
            interval.tick().await;
            if let Err(err) = coordinator.purge_old_events().await {
                tracing::warn!("event log purge failed: {}", err);
            }
        }
    });
}
