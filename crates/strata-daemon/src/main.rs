//! # Strata Daemon
//!
//! Composition root for the Strata cache layer: loads configuration, builds
//! the Redis pool, wires the accessor and the connection supervisor, and
//! owns the exit policy. The supervisor refuses to run degraded: when its
//! retry budget is exhausted the error propagates here and the process
//! exits non-zero.

use anyhow::Result;
use std::sync::Arc;
use strata_cache::{
    create_pool, CacheAside, ConnectionState, ConnectionSupervisor, InFlightTracker, KeyValueStore,
    RedisConnector, RedisStore, RetryBudget,
};
use strata_config::ConfigLoader;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    info!("Starting Strata cache daemon...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run().await {
        error!("Application error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load configuration
    let config_loader = ConfigLoader::from_default_location()?;
    let config = config_loader.get().await;

    info!("Environment: {}", config.app.environment);
    info!(
        host = %config.store.host,
        port = config.store.port,
        "Store endpoint configured"
    );

    // Shared store handle: callers go through the accessor, the supervisor
    // alone manages the connection lifecycle.
    let pool = create_pool(&config.store)?;
    let store = Arc::new(RedisStore::new(
        pool.clone(),
        config.store.key_prefix.clone(),
    ));

    let tracker = InFlightTracker::new();
    let (supervisor, handle) = ConnectionSupervisor::new(
        RedisConnector::new(pool),
        RetryBudget::from_config(&config.supervisor),
        config.supervisor.shutdown_grace(),
        Arc::clone(&tracker),
    );

    let cache = CacheAside::from_config(
        store,
        handle.events.clone(),
        Arc::clone(&tracker),
        &config.cache,
    )?;

    let mut supervisor_task = tokio::spawn(supervisor.run());

    // Wait until the supervisor settles before probing; a Failed state is
    // picked up by the select below.
    let mut state = handle.state.clone();
    loop {
        match *state.borrow() {
            ConnectionState::Connected | ConnectionState::Failed => break,
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }
        if state.changed().await.is_err() {
            break;
        }
    }

    if *state.borrow() == ConnectionState::Connected {
        startup_probe(&cache).await;
    }

    tokio::select! {
        result = &mut supervisor_task => {
            // Fatal escalation: no degraded run without the cache tier.
            result??;
            return Ok(());
        }
        () = shutdown_signal() => {
            handle.shutdown.shutdown();
        }
    }

    supervisor_task.await??;

    info!("Daemon shutdown complete");
    Ok(())
}

/// Round-trips a probe value through the accessor at startup, then removes
/// it again.
async fn startup_probe<S: KeyValueStore>(cache: &CacheAside<S>) {
    match cache
        .get("startup-probe", || async { Ok("hello".to_string()) })
        .await
    {
        Ok(value) => {
            info!(value = %value, "startup probe round-tripped");
            if let Err(e) = cache.invalidate("startup-probe").await {
                warn!("failed to clean up startup probe: {}", e);
            }
        }
        Err(e) => warn!("startup probe failed: {}", e),
    }
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,strata=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
