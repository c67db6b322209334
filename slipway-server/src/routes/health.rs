//! Liveness of this replica and of the cluster's task leader.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use slipway_core::store::LeaderStore;
use tracing::warn;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_health), components(schemas(HealthResponse, LeaderInfo)))]
pub struct HealthApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// `ok`, or `unavailable` when the store cannot be read.
    pub status: String,
    pub version: String,
    /// Leadership identity of this replica.
    pub instance: Uuid,
    pub is_leader: bool,
    pub leader: Option<LeaderInfo>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LeaderInfo {
    pub identity: Uuid,
    pub last_ping: DateTime<Utc>,
    /// `false` once the heartbeat is older than the grace period, meaning any
    /// replica may take over.
    pub live: bool,
}

/// Store reachability and the current task leader.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Store reachable", body = HealthResponse),
        (status = 503, description = "Store unreachable", body = HealthResponse)
    )
)]
pub async fn get_health(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let instance = state.orchestrator.leader().identity();
    let grace = TimeDelta::from_std(state.orchestrator.config().leader_grace_period)
        .unwrap_or(TimeDelta::MAX);

    let (code, status, leader) = match state.store.current_leader().await {
        Ok(leader) => (StatusCode::OK, "ok", leader),
        Err(e) => {
            warn!(error = %e, "health check could not read the store");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable", None)
        }
    };
    let now = Utc::now();
    let leader = leader.map(|l| LeaderInfo {
        identity: l.identity,
        last_ping: l.last_ping,
        live: now - l.last_ping < grace,
    });

    (
        code,
        Json(HealthResponse {
            status: status.to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            instance,
            is_leader: leader.as_ref().is_some_and(|l| l.identity == instance && l.live),
            leader,
        }),
    )
}
