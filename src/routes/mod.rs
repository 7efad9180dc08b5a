//! Axum router construction.
//!
//! [`build`] assembles the complete application router, including:
//! - Middleware layers (CORS, per-request trace-ID injection)
//! - Optional Swagger UI / OpenAPI spec endpoint (disable with `A2M_ENABLE_SWAGGER=false`)
//! - Health / heartbeat route
//! - Submission and task-query routes under `/api`

pub mod doc;
mod health;
mod tasks;
mod transcribe;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use tower::ServiceBuilder;
use utoipa_swagger_ui::SwaggerUi;

use crate::middleware::{cors, trace};
use crate::state::AppState;

// ── Router builder ────────────────────────────────────────────────────────────

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .merge(transcribe::router())
        .merge(tasks::router());

    let mut app = Router::new()
        .merge(health::router())
        .nest("/api", api_router);

    // ── Swagger UI ────────────────────────────────────────────────────────────
    // Enabled by default; disable with A2M_ENABLE_SWAGGER=false in production
    // to avoid exposing the API structure to potential attackers.
    if state.config.enable_swagger {
        app = app.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", doc::get_docs()));
    }

    // Axum's default 2 MB body limit is far below a real audio upload; the
    // handler enforces the configured cap while streaming, this layer backs
    // it up (with headroom for the other form fields).
    let body_limit = (state.config.max_upload_size_mb + 1) * 1024 * 1024;

    app
        // Outermost layers execute first on the way in.
        .layer(ServiceBuilder::new().layer(cors::cors_layer(state.clone())))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            trace::trace_middleware,
        ))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
