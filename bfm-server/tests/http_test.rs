//! Router-level tests: authentication ordering, status mapping, and the
//! open endpoints. No database is required — the state-store pool opens
//! connections lazily and these paths never check one out.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use bfm_core::backend::default_driver_map;
use bfm_core::config::{ConnectionConfig, StateStoreConfig};
use bfm_core::executor::Executor;
use bfm_core::registry::ScriptRegistry;
use bfm_core::script::{Backend, MigrationScript};
use bfm_core::tracker::StateTracker;

const TOKEN: &str = "test-token";

fn test_script(version: &str, name: &str) -> MigrationScript {
    MigrationScript {
        version: version.to_string(),
        name: name.to_string(),
        backend: Backend::Postgresql,
        connection: "test".to_string(),
        schema: String::new(),
        up_payload: "CREATE TABLE t (id INT);".to_string(),
        down_payload: "DROP TABLE t;".to_string(),
        up_filename: format!("{}_{}.up.sql", version, name),
        down_filename: format!("{}_{}.down.sql", version, name),
        dependencies: vec![],
        structured_dependencies: vec![],
        checksum: 1,
    }
}

fn build_app(scripts: Vec<MigrationScript>) -> axum::Router {
    let registry = Arc::new(ScriptRegistry::new());
    for script in scripts {
        registry.register(script);
    }
    // Lazy pool: nothing connects until a handler actually queries state.
    let tracker = Arc::new(StateTracker::connect(&StateStoreConfig::default()).unwrap());
    // The planner validates connections before dry-runs, so a (never
    // dialed) entry for "test" must exist.
    let connections = HashMap::from([(
        "test".to_string(),
        ConnectionConfig {
            backend: Backend::Postgresql,
            host: "localhost".to_string(),
            port: 5432,
            database: "unused".to_string(),
            username: String::new(),
            password: String::new(),
            extra: HashMap::new(),
        },
    )]);
    let executor = Arc::new(Executor::new(
        registry,
        tracker,
        default_driver_map(),
        connections,
    ));
    bfm_server::routes::build_router(bfm_server::state::AppState::new(
        executor,
        std::path::PathBuf::from("/nonexistent"),
        TOKEN.to_string(),
    ))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_missing_token_is_401_before_handler() {
    let app = build_app(vec![]);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/migrations/up")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["message"], "missing_bearer_token");
}

#[tokio::test]
async fn test_wrong_token_is_401() {
    let app = build_app(vec![]);
    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/v1/migrations")
                .header(header::AUTHORIZATION, "Bearer not-the-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["message"], "invalid_token");
}

#[tokio::test]
async fn test_malformed_authorization_header_is_401() {
    let app = build_app(vec![]);
    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/v1/migrations")
                .header(header::AUTHORIZATION, format!("Basic {}", TOKEN))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_up_with_empty_selection_is_trivial_success() {
    let app = build_app(vec![]);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/migrations/up")
                .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"target":{"backend":"postgresql"},"connection":"test","schemas":[],"dry_run":false}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["applied"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_dry_run_reports_applied_ids() {
    let script = test_script("20250101000000", "test_migration");
    let id = script.migration_id();
    let app = build_app(vec![script]);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/migrations/up")
                .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"target":{"backend":"postgresql","connection":"test"},"connection":"test","schemas":[],"dry_run":true}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["applied"][0], id.as_str());
}

#[tokio::test]
async fn test_down_requires_migration_id() {
    let app = build_app(vec![]);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/migrations/down")
                .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"migration_id":"  "}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "ValidationError");
}

#[tokio::test]
async fn test_rollback_of_unknown_id_is_404() {
    let app = build_app(vec![]);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/migrations/20250101000000_ghost_postgresql_test/rollback")
                .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"], "NotFound");
}

#[tokio::test]
async fn test_down_of_unknown_id_is_404() {
    let app = build_app(vec![]);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/migrations/down")
                .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"migration_id":"20250101000000_ghost_postgresql_test"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_openapi_is_open_and_parses() {
    let app = build_app(vec![]);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["openapi"], "3.0.3");
}

#[tokio::test]
async fn test_health_does_not_require_auth() {
    let app = build_app(vec![]);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    // No state store behind this app: unhealthy, but never 401.
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let app = build_app(vec![]);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v2/migrations")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
