//! Node endpoints: build data and node filter resolution.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use utoipa::OpenApi;
use validator::Validate;

use slipway_core::NodeFilterSet;
use slipway_core::builddata::BuildData;
use slipway_core::store::BuildDataStore;

use crate::error::ServerError;
use crate::schemas::v1::node::{
    BuildDataQuery, BuildDataRequest, BuildDataResponse, NodeFilterRequest,
};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(get_build_data, post_build_data, resolve_node_filter),
    components(schemas(BuildDataRequest, BuildDataResponse, NodeFilterRequest))
)]
pub struct NodesApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/nodes/{hostname}/builddata",
            get(get_build_data).post(post_build_data),
        )
        .route("/nodefilter", post(resolve_node_filter))
}

/// Build data collected for a node, newest first.
#[utoipa::path(
    get,
    path = "/v1/nodes/{hostname}/builddata",
    tag = "nodes",
    params(("hostname" = String, Path, description = "Node name"), BuildDataQuery),
    responses(
        (status = 200, description = "Build data", body = [BuildDataResponse]),
        (status = 404, description = "No build data for the node"),
    )
)]
pub async fn get_build_data(
    State(state): State<Arc<AppState>>,
    Path(hostname): Path<String>,
    Query(q): Query<BuildDataQuery>,
) -> Result<Json<Vec<BuildDataResponse>>, ServerError> {
    let rows = state.store.get_build_data(&hostname, q.latest).await?;
    if rows.is_empty() {
        return Err(ServerError::NotFound(format!(
            "no build data found for node {hostname}"
        )));
    }
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// Store one build data entry for a node.
#[utoipa::path(
    post,
    path = "/v1/nodes/{hostname}/builddata",
    tag = "nodes",
    params(("hostname" = String, Path, description = "Node name")),
    request_body = BuildDataRequest,
    responses(
        (status = 201, description = "Stored", body = BuildDataResponse),
        (status = 400, description = "Invalid build data"),
    )
)]
pub async fn post_build_data(
    State(state): State<Arc<AppState>>,
    Path(hostname): Path<String>,
    Json(req): Json<BuildDataRequest>,
) -> Result<(StatusCode, Json<BuildDataResponse>), ServerError> {
    req.validate()
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;
    let data = BuildData {
        node_name: hostname,
        task_id: req.task_id,
        collected_date: req.collected_date.unwrap_or_else(Utc::now),
        generator: req.generator,
        data_format: req.data_format,
        data_element: req.data_element,
    };
    state.store.put_build_data(&data).await?;
    Ok((StatusCode::CREATED, Json(data.into())))
}

/// Names of the nodes a filter selects in a design.
#[utoipa::path(
    post,
    path = "/v1/nodefilter",
    tag = "nodes",
    request_body = NodeFilterRequest,
    responses(
        (status = 200, description = "Selected node names", body = [String]),
        (status = 400, description = "Invalid filter or unresolvable design"),
    )
)]
pub async fn resolve_node_filter(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NodeFilterRequest>,
) -> Result<Json<Vec<String>>, ServerError> {
    req.validate()
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;
    let filter = req
        .node_filter
        .map(NodeFilterSet::from_value)
        .transpose()?;
    let nodes = state
        .orchestrator
        .resolve_node_filter(&req.design_ref, filter.as_ref())
        .await?;
    Ok(Json(nodes.into_iter().collect()))
}

// ── Tests ──────────────────────────────────────────────────────────────────────
