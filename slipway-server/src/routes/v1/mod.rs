pub mod bootactions;
pub mod nodes;
pub mod tasks;

use std::sync::Arc;

use axum::{Router, middleware};
use utoipa::OpenApi;

use crate::middleware::auth;
use crate::state::AppState;

/// Routes nested under `/v1`.
///
/// Task and node routes are operator-facing and sit behind the admin token.
/// Boot-action routes are called by nodes, which authenticate with their
/// boot-action key instead.
pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let operator = Router::new()
        .merge(tasks::router())
        .merge(nodes::router())
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::auth_middleware,
        ));

    Router::new().merge(operator).merge(bootactions::router())
}

#[derive(OpenApi)]
#[openapi()]
pub struct V1Api;

pub fn api_docs() -> utoipa::openapi::OpenApi {
    let mut spec = V1Api::openapi();
    spec.merge(tasks::TasksApi::openapi());
    spec.merge(bootactions::BootActionsApi::openapi());
    spec.merge(nodes::NodesApi::openapi());
    spec
}

/// Parse a path id, reporting malformed ids as a bad request.
fn parse_id(kind: &str, raw: &str) -> Result<uuid::Uuid, crate::error::ServerError> {
    raw.parse()
        .map_err(|_| crate::error::ServerError::BadRequest(format!("invalid {kind} id '{raw}'")))
}
