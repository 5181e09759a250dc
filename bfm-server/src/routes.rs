//! Router construction: the authenticated `/api/v1` surface plus the open
//! health and OpenAPI endpoints.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::{auth, handlers, openapi, state::AppState, stream};

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/v1/migrations/up", post(handlers::migrate_up))
        .route("/api/v1/migrations/down", post(handlers::migrate_down))
        .route("/api/v1/migrations/stream", post(stream::stream_migrate))
        .route("/api/v1/migrations/reindex", post(handlers::reindex))
        .route("/api/v1/migrations", get(handlers::list_migrations))
        .route("/api/v1/migrations/recent", get(handlers::recent_executions))
        .route("/api/v1/migrations/:id", get(handlers::migration_detail))
        .route(
            "/api/v1/migrations/:id/status",
            get(handlers::migration_status),
        )
        .route(
            "/api/v1/migrations/:id/history",
            get(handlers::migration_history),
        )
        .route(
            "/api/v1/migrations/:id/rollback",
            post(handlers::rollback_migration),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .merge(api)
        .route("/health", get(handlers::health))
        .route("/openapi.yaml", get(openapi::openapi_yaml))
        .route("/openapi.json", get(openapi::openapi_json))
        .fallback(handlers::route_not_found)
        .with_state(state)
}
