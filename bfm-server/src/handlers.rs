//! HTTP handlers: thin mappings from requests to executor and tracker
//! operations, plus the error-to-status projection.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use bfm_core::error::{BfmError, ErrorKind};
use bfm_core::executor::{ExecutionContext, MigrationResult};
use bfm_core::script::MigrationTarget;
use bfm_core::tracker::{HistoryFilters, ListFilters};

use crate::dto::{
    DownRequest, HealthBody, ListQuery, MigrationDetail, RecentQuery, UpRequest,
};
use crate::state::AppState;

/// Error wrapper mapping [`ErrorKind`] onto response statuses.
pub struct ApiError(pub BfmError);

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, label) = match self.0.kind() {
            ErrorKind::Validation => (StatusCode::BAD_REQUEST, "ValidationError"),
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "NotFound"),
            ErrorKind::Precondition => (StatusCode::BAD_REQUEST, "Precondition"),
            ErrorKind::Operational => (StatusCode::INTERNAL_SERVER_ERROR, "Operational"),
        };
        (
            status,
            Json(ErrorBody {
                error: label,
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<BfmError> for ApiError {
    fn from(e: BfmError) -> Self {
        ApiError(e)
    }
}

/// 200 on full success, 206 on partial progress, 500 on total failure.
fn result_response(result: MigrationResult) -> Response {
    let status = if result.success {
        StatusCode::OK
    } else if !result.applied.is_empty() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(result)).into_response()
}

fn api_context() -> ExecutionContext {
    ExecutionContext::default()
}

pub async fn migrate_up(
    State(state): State<AppState>,
    Json(request): Json<UpRequest>,
) -> Response {
    let result = state
        .executor
        .execute_up(
            &request.target,
            &request.connection,
            &request.schemas,
            request.dry_run,
            &api_context(),
        )
        .await;
    result_response(result)
}

pub async fn migrate_down(
    State(state): State<AppState>,
    Json(request): Json<DownRequest>,
) -> Result<Response, ApiError> {
    if request.migration_id.trim().is_empty() {
        return Err(BfmError::Validation("migration_id is required".to_string()).into());
    }
    let result = state
        .executor
        .execute_down(
            &request.migration_id,
            &request.schemas,
            request.dry_run,
            &api_context(),
        )
        .await?;
    Ok(result_response(result))
}

pub async fn rollback_migration(
    State(state): State<AppState>,
    Path(migration_id): Path<String>,
) -> Result<Response, ApiError> {
    let result = state
        .executor
        .rollback(&migration_id, &api_context())
        .await?;
    Ok(result_response(result))
}

pub async fn list_migrations(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    // The table filter matches script payloads, which live in the registry;
    // resolve it to a migration-id restriction first.
    let migration_ids = match query.table {
        Some(ref table) if !table.is_empty() => {
            let candidates = state.executor.registry().find_by_target(&MigrationTarget {
                tables: vec![table.clone()],
                ..Default::default()
            });
            if candidates.is_empty() {
                return Ok(Json(Vec::<serde_json::Value>::new()).into_response());
            }
            Some(candidates.iter().map(|s| s.migration_id()).collect())
        }
        _ => None,
    };

    let filters = ListFilters {
        schema: query.schema,
        connection: query.connection,
        backend: query.backend,
        status: query.status,
        version: query.version,
        migration_ids,
    };
    let rows = state.executor.tracker().get_migration_list(&filters).await?;
    Ok(Json(rows).into_response())
}

pub async fn migration_detail(
    State(state): State<AppState>,
    Path(migration_id): Path<String>,
) -> Result<Response, ApiError> {
    let tracker = state.executor.tracker();
    let row = tracker
        .get_migration_detail(&migration_id)
        .await?
        .ok_or_else(|| BfmError::MigrationNotFound {
            migration_id: migration_id.clone(),
        })?;
    let dependencies = tracker.get_migration_dependencies(&migration_id).await?;
    let script = state
        .executor
        .registry()
        .get_by_migration_id(&row.migration_id);

    let detail = MigrationDetail {
        row,
        up_payload: script.as_ref().map(|s| s.up_payload.clone()),
        down_payload: script
            .as_ref()
            .filter(|s| s.has_down())
            .map(|s| s.down_payload.clone()),
        dependencies,
    };
    Ok(Json(detail).into_response())
}

pub async fn migration_status(
    State(state): State<AppState>,
    Path(migration_id): Path<String>,
) -> Result<Response, ApiError> {
    let summary = state
        .executor
        .tracker()
        .get_migration_status(&migration_id)
        .await?
        .ok_or_else(|| BfmError::MigrationNotFound {
            migration_id: migration_id.clone(),
        })?;
    Ok(Json(summary).into_response())
}

pub async fn migration_history(
    State(state): State<AppState>,
    Path(migration_id): Path<String>,
) -> Result<Response, ApiError> {
    let rows = state
        .executor
        .tracker()
        .get_migration_history(&HistoryFilters {
            migration_id: Some(migration_id.clone()),
            ..Default::default()
        })
        .await?;
    if rows.is_empty() {
        return Err(BfmError::MigrationNotFound { migration_id }.into());
    }
    Ok(Json(rows).into_response())
}

pub async fn recent_executions(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Response, ApiError> {
    let rows = state
        .executor
        .tracker()
        .get_recent_executions(query.limit.clamp(1, 500))
        .await?;
    Ok(Json(rows).into_response())
}

pub async fn reindex(State(state): State<AppState>) -> Result<Response, ApiError> {
    let report = state.executor.reindex(&state.scripts_root).await?;
    Ok(Json(report).into_response())
}

pub async fn health(State(state): State<AppState>) -> Response {
    match state.executor.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthBody {
                status: "ok",
                error: None,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthBody {
                status: "unhealthy",
                error: Some(e.to_string()),
            }),
        )
            .into_response(),
    }
}

pub async fn route_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "NotFound",
            message: "No such route".to_string(),
        }),
    )
        .into_response()
}
