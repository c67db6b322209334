//! slipway-server: entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Open the SQLite database and run pending migrations.
//! 4. Build the driver registry and the orchestrator.
//! 5. Start the task watcher, which competes for leadership.
//! 6. Build the Axum router and start the HTTP server with graceful shutdown.

mod config;
mod db;
mod error;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use slipway_core::{DriverRegistry, FileDesignResolver, Orchestrator, SimulatedDriver};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::sqlite::SqliteStore;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    // Build the log-level filter, warning loudly if the configured value is
    // not a valid tracing filter expression.
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: SLIPWAY_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    // Keep the guard alive for the whole process so buffered lines are flushed.
    let (writer, _log_guard) = match &cfg.log_file {
        Some(file) => {
            let path = Path::new(file);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path.file_name().unwrap_or(path.as_os_str());
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name))
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "slipway-server starting");

    // ── 3. Database ────────────────────────────────────────────────────────────
    let store = Arc::new(SqliteStore::connect(&cfg.database_url).await?);
    info!(database_url = %cfg.database_url, "database ready");

    // ── 4. Drivers and orchestrator ────────────────────────────────────────────
    let mut drivers = DriverRegistry::new();
    if cfg.simulated_driver {
        drivers.register(Arc::new(SimulatedDriver::default()));
        warn!("simulated driver enabled; no hardware will be touched");
    }
    if drivers.is_empty() {
        warn!("no drivers registered; driver steps will fail");
    }

    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::new(FileDesignResolver),
        drivers,
        cfg.to_engine_config(),
    );
    info!(identity = %orchestrator.leader().identity(), "orchestrator initialised");

    // ── 5. Shared application state and task watcher ───────────────────────────
    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        store,
        orchestrator: orchestrator.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = tokio::spawn(async move { orchestrator.watch_for_tasks(shutdown_rx).await });

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Release leadership so another replica can take over at once.
    let _ = shutdown_tx.send(true);
    if let Err(e) = watcher.await {
        warn!(error = %e, "task watcher did not stop cleanly");
    }

    info!("slipway-server stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
