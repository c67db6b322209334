//! Task endpoints.
//!
//! Tasks are created `pending`; the elected leader's watcher picks them up.
//! Termination is cooperative and reaches every descendant.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::info;
use utoipa::OpenApi;
use uuid::Uuid;
use validator::Validate;

use slipway_core::store::TaskStore;
use slipway_core::task::RequestContext;
use slipway_core::{Action, NodeFilterSet};

use super::parse_id;
use crate::error::ServerError;
use crate::middleware::trace::X_TRACE_ID;
use crate::schemas::v1::task::{
    CreateTaskRequest, ResultMessageResponse, TaskQuery, TaskResponse, TaskResultResponse,
    WaitQuery,
};
use crate::state::AppState;


#[derive(OpenApi)]
#[openapi(
    paths(create_task, list_tasks, get_task, wait_for_task, terminate_task),
    components(schemas(
        CreateTaskRequest,
        TaskResponse,
        TaskResultResponse,
        ResultMessageResponse
    ))
)]
pub struct TasksApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/wait", get(wait_for_task))
        .route("/tasks/{id}/terminate", post(terminate_task))
}

/// Caller context from the request headers.
fn request_context(headers: &HeaderMap) -> RequestContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    let end_user = header("X-End-User");
    RequestContext {
        user: end_user.clone(),
        request_id: header(X_TRACE_ID).and_then(|v| v.parse().ok()),
        external_marker: header("X-Context-Marker"),
        end_user,
    }
}

/// Create a task.
#[utoipa::path(
    post,
    path = "/v1/tasks",
    tag = "tasks",
    request_body = CreateTaskRequest,
    responses(
        (status = 201, description = "Task queued", body = TaskResponse),
        (status = 400, description = "Unknown action or invalid node filter"),
        (status = 401, description = "Missing or wrong admin token"),
    )
)]
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ServerError> {
    req.validate()
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;
    let action: Action = req
        .action
        .parse()
        .map_err(|_| ServerError::BadRequest(format!("unsupported action '{}'", req.action)))?;
    let node_filter = req
        .node_filter
        .map(NodeFilterSet::from_value)
        .transpose()?;

    let task = state
        .orchestrator
        .create_task(
            action,
            &req.design_ref,
            node_filter,
            Some(request_context(&headers)),
        )
        .await?;

    let location = format!("/v1/tasks/{}", task.task_id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(TaskResponse::from(task)),
    ))
}

/// List every task, oldest first.
#[utoipa::path(
    get,
    path = "/v1/tasks",
    tag = "tasks",
    responses((status = 200, description = "All tasks", body = [TaskResponse]))
)]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TaskResponse>>, ServerError> {
    let tasks = state.store.list_tasks().await?;
    Ok(Json(tasks.into_iter().map(TaskResponse::from).collect()))
}

/// Read one task with its log.
#[utoipa::path(
    get,
    path = "/v1/tasks/{id}",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id"), TaskQuery),
    responses(
        (status = 200, description = "The task", body = TaskResponse),
        (status = 404, description = "No such task"),
    )
)]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<TaskQuery>,
) -> Result<Json<TaskResponse>, ServerError> {
    let task_id = parse_id("task", &id)?;
    let task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))?;

    let messages = state.store.get_result_messages(task_id).await?;
    let subtask_errors = if q.subtaskerrors {
        Some(subtask_errors(&state, task_id).await?)
    } else {
        None
    };

    let mut body = TaskResponse::from(task);
    body.messages = Some(messages.into_iter().map(Into::into).collect());
    body.subtask_errors = subtask_errors;
    Ok(Json(body))
}

/// Results of every descendant that recorded failures.
async fn subtask_errors(
    state: &AppState,
    root: Uuid,
) -> Result<BTreeMap<String, TaskResultResponse>, ServerError> {
    let mut errors = BTreeMap::new();
    let mut queue = vec![root];
    while let Some(parent) = queue.pop() {
        for child in state.store.get_subtasks(parent).await? {
            if child.result.error_count > 0 {
                errors.insert(
                    child.task_id.to_string(),
                    TaskResultResponse::from(&child.result),
                );
            }
            queue.push(child.task_id);
        }
    }
    Ok(errors)
}

/// Block until the task is terminal.
#[utoipa::path(
    get,
    path = "/v1/tasks/{id}/wait",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id"), WaitQuery),
    responses(
        (status = 200, description = "The terminal task", body = TaskResponse),
        (status = 404, description = "No such task"),
        (status = 408, description = "Still running when the wait expired"),
    )
)]
pub async fn wait_for_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<WaitQuery>,
) -> Result<Json<TaskResponse>, ServerError> {
    let task_id = parse_id("task", &id)?;
    let task = state
        .orchestrator
        .wait_for_task(task_id, q.poll_interval(), q.timeout())
        .await?;
    Ok(Json(TaskResponse::from(task)))
}

/// Request termination of a task and all of its descendants.
#[utoipa::path(
    post,
    path = "/v1/tasks/{id}/terminate",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 202, description = "Termination requested", body = TaskResponse),
        (status = 404, description = "No such task"),
    )
)]
pub async fn terminate_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let task_id = parse_id("task", &id)?;
    let by = request_context(&headers)
        .end_user
        .unwrap_or_else(|| "api".to_owned());
    state
        .orchestrator
        .terminate_task(task_id, Some(&by))
        .await?;
    info!(%task_id, by = %by, "termination requested over api");

    let task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))?;
    Ok((StatusCode::ACCEPTED, Json(TaskResponse::from(task))))
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tracing_test::traced_test;

    use slipway_core::Task;

    use super::*;
    use crate::config::Config;
    use crate::routes::testing::{DESIGN_REF, json_body, send, state_with};

    fn design() -> slipway_core::SiteDesign {
        serde_json::from_value(json!({
            "name": "site",
            "nodes": [{"name": "n1", "tags": ["compute"]}, {"name": "n2"}]
        }))
        .unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn create_then_read_task() {
        let state = state_with(design(), Config::default()).await;
        let res = send(
            &state,
            post_json(
                "/v1/tasks",
                json!({
                    "action": "deploy_nodes",
                    "design_ref": DESIGN_REF,
                    "node_filter": {
                        "filter_set_type": "union",
                        "filter_set": [{"filter_type": "union", "node_tags": ["compute"]}]
                    }
                }),
            ),
        )
        .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let location = res.headers()[header::LOCATION].to_str().unwrap().to_owned();
        let created = json_body(res).await;
        assert_eq!(created["status"], "pending");
        assert_eq!(location, format!("/v1/tasks/{}", created["task_id"].as_str().unwrap()));

        let res = send(&state, Request::get(&location).body(Body::empty()).unwrap()).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["action"], "deploy_nodes");
        assert!(body["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_requests_are_rejected() {
        let state = state_with(design(), Config::default()).await;
        let res = send(
            &state,
            post_json("/v1/tasks", json!({"action": "fly", "design_ref": DESIGN_REF})),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(res).await["error"].as_str().unwrap().contains("fly"));

        let res = send(
            &state,
            post_json(
                "/v1/tasks",
                json!({
                    "action": "deploy_nodes",
                    "design_ref": DESIGN_REF,
                    "node_filter": {"filter_set_type": "sideways", "filter_set": []}
                }),
            ),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = send(
            &state,
            post_json("/v1/tasks", json!({"action": "noop", "design_ref": ""})),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = send(
            &state,
            Request::get("/v1/tasks/not-a-uuid").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = send(
            &state,
            Request::get(format!("/v1/tasks/{}", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    #[traced_test]
    async fn admin_token_guards_task_api() {
        let config = Config {
            admin_token: Some("sekrit".into()),
            ..Config::default()
        };
        let state = state_with(design(), config).await;

        let res = send(&state, Request::get("/v1/tasks").body(Body::empty()).unwrap()).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert!(logs_contain("rejected request without valid admin token"));

        let res = send(
            &state,
            Request::get("/v1/tasks")
                .header(header::AUTHORIZATION, "Bearer sekrit")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = send(&state, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn terminate_flags_pending_task() {
        let state = state_with(design(), Config::default()).await;
        let task = state
            .orchestrator
            .create_task(Action::DeployNodes, DESIGN_REF, None, None)
            .await
            .unwrap();

        let res = send(
            &state,
            Request::post(format!("/v1/tasks/{}/terminate", task.task_id))
                .header("X-End-User", "ops")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        let body = json_body(res).await;
        assert_eq!(body["terminate"], true);
        assert_eq!(body["terminated_by"], "ops");
    }

    #[tokio::test]
    async fn wait_returns_terminal_task() {
        let state = state_with(design(), Config::default()).await;
        let task = state
            .orchestrator
            .create_task(Action::Noop, DESIGN_REF, None, None)
            .await
            .unwrap();
        state.orchestrator.execute_task(task.task_id).await.unwrap();

        let res = send(
            &state,
            Request::get(format!("/v1/tasks/{}/wait?timeout=5", task.task_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["status"], "complete");
    }

    #[tokio::test]
    async fn wait_polls_at_the_requested_interval() {
        let state = state_with(design(), Config::default()).await;
        let task = state
            .orchestrator
            .create_task(Action::Noop, DESIGN_REF, None, None)
            .await
            .unwrap();
        let orchestrator = state.orchestrator.clone();
        let task_id = task.task_id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            orchestrator.execute_task(task_id).await.unwrap();
        });

        let started = std::time::Instant::now();
        let res = send(
            &state,
            Request::get(format!("/v1/tasks/{task_id}/wait?timeout=5&poll_interval=10"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["status"], "complete");
        // The default 500 ms interval would not notice completion this early.
        assert!(started.elapsed() < Duration::from_millis(450));
    }

    #[tokio::test]
    async fn subtask_errors_collects_failed_descendants() {
        let state = state_with(design(), Config::default()).await;
        let parent = Task::new(Action::DeployNodes, DESIGN_REF, None, None);
        let mut ok = parent.subtask(Action::DeployNodes, None);
        ok.result.add_success("n1");
        let mut failed = parent.subtask(Action::DeployNodes, None);
        failed.result.add_failure("n2");
        for t in [&parent, &ok, &failed] {
            state.store.insert_task(t).await.unwrap();
        }
        for child in [&ok, &failed] {
            state.store.add_subtask(parent.task_id, child.task_id).await.unwrap();
        }

        let res = send(
            &state,
            Request::get(format!("/v1/tasks/{}?subtaskerrors=true", parent.task_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let body = json_body(res).await;
        let errors = body["subtask_errors"].as_object().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors.contains_key(&failed.task_id.to_string()));
    }
}
