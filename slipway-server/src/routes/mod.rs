//! Axum router construction.
//!
//! [`build`] assembles the complete application router, including:
//! - Middleware layers (CORS, per-request trace-ID injection)
//! - Optional Swagger UI / OpenAPI spec endpoint (disable with `SLIPWAY_ENABLE_SWAGGER=false`)
//! - Health / heartbeat route
//! - `/v1` task, node and boot-action routes

pub mod doc;
mod health;
mod v1;

use std::sync::Arc;

use axum::{Router, middleware};
use tower::ServiceBuilder;
use utoipa_swagger_ui::SwaggerUi;

use crate::middleware::{cors, trace};
use crate::state::AppState;

// ── Router builder ────────────────────────────────────────────────────────────

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .merge(health::router())
        .nest("/v1", v1::router(state.clone()));

    if state.config.enable_swagger {
        app = app.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", doc::get_docs()));
    }

    app
        // Outermost layers execute first on the way in.
        .layer(ServiceBuilder::new().layer(cors::cors_layer(state.clone())))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            trace::trace_middleware,
        ))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, Response};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use slipway_core::design::SiteDesign;
    use slipway_core::{DriverRegistry, EngineConfig, Orchestrator, StaticDesignResolver};

    use crate::config::Config;
    use crate::db::sqlite::SqliteStore;
    use crate::state::AppState;

    pub const DESIGN_REF: &str = "memory://site";

    pub async fn state_with(design: SiteDesign, config: Config) -> Arc<AppState> {
        let store = Arc::new(
            SqliteStore::connect("sqlite::memory:")
                .await
                .expect("in-memory database"),
        );
        let designs = Arc::new(StaticDesignResolver::new().with_design(DESIGN_REF, design));
        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            designs,
            DriverRegistry::new(),
            EngineConfig::default(),
        );
        Arc::new(AppState {
            config: Arc::new(config),
            store,
            orchestrator,
        })
    }

    pub async fn send(state: &Arc<AppState>, req: Request<Body>) -> Response<Body> {
        super::build(Arc::clone(state))
            .oneshot(req)
            .await
            .expect("router is infallible")
    }

    pub async fn body_bytes(res: Response<Body>) -> Vec<u8> {
        res.into_body()
            .collect()
            .await
            .expect("body collects")
            .to_bytes()
            .to_vec()
    }

    pub async fn json_body(res: Response<Body>) -> Value {
        serde_json::from_slice(&body_bytes(res).await).expect("json body")
    }
}
