//! Streaming migrate surface: newline-delimited JSON progress events,
//! one per script, emitted while the batch runs.

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use bfm_core::dependency::order_scripts;
use bfm_core::executor::ExecutionContext;
use bfm_core::script::MigrationTarget;

use crate::dto::{ProgressEvent, ProgressStatus, UpRequest};
use crate::state::AppState;

async fn emit(tx: &tokio::sync::mpsc::Sender<String>, event: ProgressEvent) {
    match serde_json::to_string(&event) {
        Ok(line) => {
            let _ = tx.send(line + "\n").await;
        }
        Err(e) => log::error!("Unencodable progress event: {}", e),
    }
}

pub async fn stream_migrate(
    State(state): State<AppState>,
    Json(request): Json<UpRequest>,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<String>(16);
    let executor = state.executor.clone();

    tokio::spawn(async move {
        let mut target = request.target.clone();
        if !request.connection.is_empty() {
            target.connection = Some(request.connection.clone());
        }

        let selection = executor.registry().find_by_target(&target);
        let ordered = match order_scripts(&selection) {
            Ok(ordered) => ordered,
            Err(e) => {
                emit(
                    &tx,
                    ProgressEvent {
                        migration_id: String::new(),
                        status: ProgressStatus::Failed,
                        message: e.to_string(),
                        progress_percent: 100,
                    },
                )
                .await;
                return;
            }
        };

        let total = ordered.len().max(1);
        let ctx = ExecutionContext::default();
        for (index, script) in ordered.iter().enumerate() {
            let migration_id = script.migration_id();
            emit(
                &tx,
                ProgressEvent {
                    migration_id: migration_id.clone(),
                    status: ProgressStatus::Running,
                    message: "applying".to_string(),
                    progress_percent: ((index * 100) / total) as u8,
                },
            )
            .await;

            // Narrow the batch to this one script so events track it.
            let single = MigrationTarget {
                backend: Some(script.backend),
                connection: Some(script.connection.clone()),
                version: Some(script.version.clone()),
                ..Default::default()
            };
            let result = executor
                .execute_up_inline(&single, "", &request.schemas, request.dry_run, &ctx)
                .await;

            let progress_percent = (((index + 1) * 100) / total) as u8;
            if let Some(error) = result.errors.first() {
                emit(
                    &tx,
                    ProgressEvent {
                        migration_id,
                        status: ProgressStatus::Failed,
                        message: error.clone(),
                        progress_percent,
                    },
                )
                .await;
                break;
            }

            let status = if result.applied.iter().any(|a| a == &migration_id) {
                ProgressStatus::Success
            } else {
                ProgressStatus::Skipped
            };
            emit(
                &tx,
                ProgressEvent {
                    migration_id,
                    status,
                    message: String::new(),
                    progress_percent,
                },
            )
            .await;
        }
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}
