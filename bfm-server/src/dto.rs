//! Request and response shapes for the HTTP surface.

use serde::{Deserialize, Serialize};

use bfm_core::script::MigrationTarget;
use bfm_core::tracker::{MigrationDependencyRow, MigrationListRow};

/// Body of `POST /api/v1/migrations/up` and the streaming sibling.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpRequest {
    #[serde(default)]
    pub target: MigrationTarget,
    #[serde(default)]
    pub connection: String,
    #[serde(default)]
    pub schemas: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Body of `POST /api/v1/migrations/down`.
#[derive(Debug, Clone, Deserialize)]
pub struct DownRequest {
    pub migration_id: String,
    #[serde(default)]
    pub schemas: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Query filters of `GET /api/v1/migrations`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub schema: Option<String>,
    pub table: Option<String>,
    pub connection: Option<String>,
    pub backend: Option<String>,
    pub status: Option<String>,
    pub version: Option<String>,
}

/// Query of `GET /api/v1/migrations/recent`.
#[derive(Debug, Clone, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_recent_limit")]
    pub limit: i64,
}

fn default_recent_limit() -> i64 {
    20
}

/// Detail response: the list row enriched with payloads and dependencies.
#[derive(Debug, Serialize)]
pub struct MigrationDetail {
    #[serde(flatten)]
    pub row: MigrationListRow,
    pub up_payload: Option<String>,
    pub down_payload: Option<String>,
    pub dependencies: Vec<MigrationDependencyRow>,
}

/// One progress event on the streaming migrate surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub migration_id: String,
    pub status: ProgressStatus,
    pub message: String,
    pub progress_percent: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Success,
    Skipped,
    Failed,
}

/// Health body for `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
