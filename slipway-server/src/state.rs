//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use slipway_core::Orchestrator;

use crate::config::Config;
use crate::db::sqlite::SqliteStore;

/// State shared across all HTTP handlers and the task watcher.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Durable task, leadership and boot-action store.
    pub store: Arc<SqliteStore>,
    pub orchestrator: Orchestrator<SqliteStore>,
}
