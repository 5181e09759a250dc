//! Bearer-token authentication middleware.
//!
//! Every `/api/v1` request must carry `Authorization: Bearer <token>`
//! matching the configured token; anything else is answered 401 before the
//! handler body runs.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
struct AuthErrorBody {
    error: &'static str,
    message: &'static str,
}

pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.api_token.is_empty() {
        log::error!("API token is not configured; rejecting request");
        return unauthorized("auth_not_configured");
    }

    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match token {
        Some(token) if token == state.api_token.as_str() => next.run(request).await,
        Some(_) => unauthorized("invalid_token"),
        None => unauthorized("missing_bearer_token"),
    }
}

fn unauthorized(reason: &'static str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(AuthErrorBody {
            error: "Unauthorized",
            message: reason,
        }),
    )
        .into_response()
}
