//! Boot-action endpoints called by nodes during deployment.
//!
//! Nodes authenticate with the hex identity key from their boot-action
//! context, sent in the `X-Bootaction-Key` header. A missing key is a 401, a
//! wrong one a 403.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;
use utoipa::OpenApi;

use slipway_core::bootaction::{KEY_HEADER, StatusReport};
use slipway_core::design::AssetType;

use super::parse_id;
use crate::error::ServerError;
use crate::schemas::v1::bootaction::{
    AssetQuery, BootActionResponse, ReportDetailRequest, StatusReportRequest,
};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(get_units, get_files, get_assets, get_packages, get_bootaction, post_bootaction),
    components(schemas(BootActionResponse, StatusReportRequest, ReportDetailRequest))
)]
pub struct BootActionsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bootactions/nodes/{hostname}/units", get(get_units))
        .route("/bootactions/nodes/{hostname}/files", get(get_files))
        .route("/bootactions/nodes/{hostname}/assets", get(get_assets))
        .route("/bootactions/nodes/{hostname}/packages", get(get_packages))
        .route(
            "/bootactions/{action_id}",
            get(get_bootaction).post(post_bootaction),
        )
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    headers.get(KEY_HEADER).and_then(|v| v.to_str().ok())
}

async fn tarball(
    state: &AppState,
    hostname: &str,
    headers: &HeaderMap,
    asset_type: Option<AssetType>,
) -> Result<Response, ServerError> {
    let archive = state
        .orchestrator
        .bootactions()
        .node_assets(hostname, presented_key(headers), asset_type)
        .await?;
    let label = asset_type.map_or_else(|| "all".to_owned(), |t| t.to_string());
    let disposition = format!("attachment; filename=\"{hostname}-{label}.tar.gz\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        archive,
    )
        .into_response())
}

/// Rendered systemd units for the node as a `.tar.gz`.
#[utoipa::path(
    get,
    path = "/v1/bootactions/nodes/{hostname}/units",
    tag = "bootactions",
    params(("hostname" = String, Path, description = "Node name")),
    responses(
        (status = 200, description = "Gzipped tar of unit assets"),
        (status = 401, description = "No X-Bootaction-Key"),
        (status = 403, description = "Wrong X-Bootaction-Key"),
        (status = 404, description = "No boot-action context for the node"),
    )
)]
pub async fn get_units(
    State(state): State<Arc<AppState>>,
    Path(hostname): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    tarball(&state, &hostname, &headers, Some(AssetType::Unit)).await
}

/// Rendered files for the node as a `.tar.gz`.
#[utoipa::path(
    get,
    path = "/v1/bootactions/nodes/{hostname}/files",
    tag = "bootactions",
    params(("hostname" = String, Path, description = "Node name")),
    responses(
        (status = 200, description = "Gzipped tar of file assets"),
        (status = 401, description = "No X-Bootaction-Key"),
        (status = 403, description = "Wrong X-Bootaction-Key"),
    )
)]
pub async fn get_files(
    State(state): State<Arc<AppState>>,
    Path(hostname): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    tarball(&state, &hostname, &headers, Some(AssetType::File)).await
}

/// Rendered assets of any or one type as a `.tar.gz`.
#[utoipa::path(
    get,
    path = "/v1/bootactions/nodes/{hostname}/assets",
    tag = "bootactions",
    params(("hostname" = String, Path, description = "Node name"), AssetQuery),
    responses(
        (status = 200, description = "Gzipped tar of assets"),
        (status = 400, description = "Unknown asset type"),
        (status = 401, description = "No X-Bootaction-Key"),
        (status = 403, description = "Wrong X-Bootaction-Key"),
    )
)]
pub async fn get_assets(
    State(state): State<Arc<AppState>>,
    Path(hostname): Path<String>,
    Query(q): Query<AssetQuery>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let asset_type = q.type_filter()?;
    tarball(&state, &hostname, &headers, asset_type).await
}

/// Merged package list of every boot action targeting the node.
#[utoipa::path(
    get,
    path = "/v1/bootactions/nodes/{hostname}/packages",
    tag = "bootactions",
    params(("hostname" = String, Path, description = "Node name")),
    responses(
        (status = 200, description = "Package name to optional version", body = Value),
        (status = 401, description = "No X-Bootaction-Key"),
        (status = 403, description = "Wrong X-Bootaction-Key"),
    )
)]
pub async fn get_packages(
    State(state): State<Arc<AppState>>,
    Path(hostname): Path<String>,
    headers: HeaderMap,
) -> Result<Json<BTreeMap<String, Option<String>>>, ServerError> {
    let packages = state
        .orchestrator
        .bootactions()
        .package_list(&hostname, presented_key(&headers))
        .await?;
    Ok(Json(packages))
}

/// Read a boot action's status.
#[utoipa::path(
    get,
    path = "/v1/bootactions/{action_id}",
    tag = "bootactions",
    params(("action_id" = String, Path, description = "Boot action id")),
    responses(
        (status = 200, description = "The boot action", body = BootActionResponse),
        (status = 404, description = "No such boot action"),
    )
)]
pub async fn get_bootaction(
    State(state): State<Arc<AppState>>,
    Path(action_id): Path<String>,
) -> Result<Json<BootActionResponse>, ServerError> {
    let action_id = parse_id("boot action", &action_id)?;
    let record = state.orchestrator.bootactions().get(action_id).await?;
    Ok(Json(record.into()))
}

/// Report the final status of a boot action. Only the first report counts.
#[utoipa::path(
    post,
    path = "/v1/bootactions/{action_id}",
    tag = "bootactions",
    params(("action_id" = String, Path, description = "Boot action id")),
    request_body = StatusReportRequest,
    responses(
        (status = 200, description = "Status recorded", body = BootActionResponse),
        (status = 400, description = "Status is not success or failure"),
        (status = 401, description = "No X-Bootaction-Key"),
        (status = 403, description = "Wrong X-Bootaction-Key"),
        (status = 404, description = "No such boot action"),
        (status = 409, description = "Status already reported"),
    )
)]
pub async fn post_bootaction(
    State(state): State<Arc<AppState>>,
    Path(action_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<StatusReportRequest>,
) -> Result<Json<BootActionResponse>, ServerError> {
    let action_id = parse_id("boot action", &action_id)?;
    let report = StatusReport::try_from(req)?;
    let pipeline = state.orchestrator.bootactions();
    pipeline
        .report_status(action_id, presented_key(&headers), report)
        .await?;
    let record = pipeline.get(action_id).await?;
    Ok(Json(record.into()))
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;

    use slipway_core::store::{BootActionStore, TaskStore};
    use slipway_core::{Action, SiteDesign};

    use super::*;
    use crate::config::Config;
    use crate::routes::testing::{DESIGN_REF, body_bytes, json_body, send, state_with};

    fn design() -> SiteDesign {
        serde_json::from_value(json!({
            "name": "site",
            "nodes": [{"name": "n1", "tags": ["compute"]}],
            "bootactions": [{
                "name": "hello",
                "assets": [
                    {"type": "file", "path": "/etc/hello", "permissions": "0644", "data": "hi {{ node.hostname }}", "data_pipeline": ["template"]},
                    {"type": "unit", "path": "/etc/systemd/system/hello.service", "data": "[Unit]"},
                    {"type": "pkg_list", "package_list": {"curl": null}}
                ]
            }]
        }))
        .unwrap()
    }

    /// A node with a live context, returning its hex key and task id.
    async fn deployed_node(state: &AppState) -> (String, uuid::Uuid) {
        let task = state
            .orchestrator
            .create_task(Action::DeployNode, DESIGN_REF, None, None)
            .await
            .unwrap();
        let key = state
            .orchestrator
            .bootactions()
            .create_context("n1", task.task_id, &design())
            .await
            .unwrap()
            .expect("n1 is targeted");
        (hex::encode(key), task.task_id)
    }

    #[tokio::test]
    async fn files_require_the_node_key() {
        let state = state_with(design(), Config::default()).await;
        let (key, _) = deployed_node(&state).await;

        let res = send(
            &state,
            Request::get("/v1/bootactions/nodes/n1/files").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = send(
            &state,
            Request::get("/v1/bootactions/nodes/n1/files")
                .header(KEY_HEADER, hex::encode([0u8; 32]))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = send(
            &state,
            Request::get("/v1/bootactions/nodes/n1/files")
                .header(KEY_HEADER, &key)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "application/gzip");

        let bytes = body_bytes(res).await;
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes.as_slice()));
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.header().mode().unwrap(), 0o644);
        let mut content = String::new();
        std::io::Read::read_to_string(&mut entry, &mut content).unwrap();
        assert_eq!(content, "hi n1");
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn all_asset_types_are_packed_for_type_all() {
        let state = state_with(design(), Config::default()).await;
        let (key, _) = deployed_node(&state).await;
        let res = send(
            &state,
            Request::get("/v1/bootactions/nodes/n1/assets?type=all")
                .header(KEY_HEADER, &key)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);

        let bytes = body_bytes(res).await;
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes.as_slice()));
        let mut paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        paths.sort();
        assert_eq!(paths, ["etc/hello", "etc/systemd/system/hello.service"]);
    }

    #[tokio::test]
    async fn unknown_asset_type_is_rejected() {
        let state = state_with(design(), Config::default()).await;
        let (key, _) = deployed_node(&state).await;
        let res = send(
            &state,
            Request::get("/v1/bootactions/nodes/n1/assets?type=firmware")
                .header(KEY_HEADER, &key)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = send(
            &state,
            Request::get("/v1/bootactions/nodes/n1/packages")
                .header(KEY_HEADER, &key)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await, json!({"curl": null}));
    }

    #[tokio::test]
    async fn status_report_is_set_once() {
        let state = state_with(design(), Config::default()).await;
        let (key, task_id) = deployed_node(&state).await;
        let action = state
            .store
            .get_boot_actions_for_node("n1", task_id)
            .await
            .unwrap()
            .remove(0);
        let uri = format!("/v1/bootactions/{}", action.action_id);
        let report = |status: &str| {
            Request::post(&uri)
                .header(header::CONTENT_TYPE, "application/json")
                .header(KEY_HEADER, &key)
                .body(Body::from(
                    json!({"status": status, "details": [{"message": "ran", "exit": 0}]})
                        .to_string(),
                ))
                .unwrap()
        };

        let res = send(&state, report("success")).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["action_status"], "success");
        assert!(body.get("identity_key").is_none());

        let res = send(&state, report("failure")).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);

        let messages = state.store.get_result_messages(task_id).await.unwrap();
        let detail = messages
            .iter()
            .find(|m| m.context_type == "bootaction")
            .expect("detail recorded");
        assert_eq!(detail.extra["exit"], 0);

        let res = send(&state, Request::get(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(json_body(res).await["action_status"], "success");
    }

    #[tokio::test]
    async fn unknown_boot_action_is_not_found() {
        let state = state_with(design(), Config::default()).await;
        let res = send(
            &state,
            Request::get(format!("/v1/bootactions/{}", uuid::Uuid::now_v7()))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
