//! Persistent row types for the four state tables, and the filter structs
//! the read queries accept.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::Row;

use crate::error::{BfmError, Result};
use crate::script::MigrationStatus;

/// One row of `migrations_list`: the summary record per migration-id.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationListRow {
    pub migration_id: String,
    pub schema: String,
    pub version: String,
    pub name: String,
    pub connection: String,
    pub backend: String,
    pub up_filename: String,
    pub down_filename: String,
    pub dependencies: Vec<String>,
    pub structured_dependencies: serde_json::Value,
    pub status: MigrationStatus,
    pub checksum: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of `migrations_executions`: per (migration, schema) state.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationExecutionRow {
    pub id: i64,
    pub migration_id: String,
    pub schema: String,
    pub version: String,
    pub connection: String,
    pub backend: String,
    pub status: MigrationStatus,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the append-only `migrations_history` log.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationHistoryRow {
    pub id: i64,
    pub migration_id: String,
    pub schema: String,
    pub version: String,
    pub connection: String,
    pub backend: String,
    pub status: MigrationStatus,
    pub error_message: Option<String>,
    pub executed_by: String,
    pub execution_method: String,
    pub execution_context: serde_json::Value,
    pub applied_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One row of `migrations_dependencies`, derived from script declarations.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationDependencyRow {
    pub id: i64,
    pub migration_id: String,
    pub dependency_id: String,
    pub connection: String,
    pub schema: Vec<String>,
    pub target: String,
    pub target_type: String,
    pub requires_table: Option<String>,
    pub requires_schema: Option<String>,
}

/// Filters accepted by the list query. Empty fields match all rows.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFilters {
    pub schema: Option<String>,
    pub connection: Option<String>,
    pub backend: Option<String>,
    pub status: Option<String>,
    pub version: Option<String>,
    /// Restrict to these migration-ids (used by the table filter, which is
    /// resolved against registry payloads by the caller).
    #[serde(skip)]
    pub migration_ids: Option<Vec<String>>,
}

/// Filters accepted by the history query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryFilters {
    pub migration_id: Option<String>,
    pub schema: Option<String>,
    pub connection: Option<String>,
    pub backend: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

/// Summary answer for the status endpoint: the latest winner over history.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatusSummary {
    pub migration_id: String,
    pub applied: bool,
    pub status: MigrationStatus,
    pub last_executed_at: Option<DateTime<Utc>>,
}

fn json_to_string_list(value: serde_json::Value) -> Vec<String> {
    serde_json::from_value(value).unwrap_or_default()
}

pub(crate) fn list_row(row: &Row) -> Result<MigrationListRow> {
    let status: String = row.get("status");
    Ok(MigrationListRow {
        migration_id: row.get("migration_id"),
        schema: row.get("schema_name"),
        version: row.get("version"),
        name: row.get("name"),
        connection: row.get("connection"),
        backend: row.get("backend"),
        up_filename: row.get("up_filename"),
        down_filename: row.get("down_filename"),
        dependencies: json_to_string_list(row.get("dependencies")),
        structured_dependencies: row.get("structured_dependencies"),
        status: MigrationStatus::parse(&status)?,
        checksum: row.get("checksum"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn execution_row(row: &Row) -> Result<MigrationExecutionRow> {
    let status: String = row.get("status");
    Ok(MigrationExecutionRow {
        id: row.get("id"),
        migration_id: row.get("migration_id"),
        schema: row.get("schema_name"),
        version: row.get("version"),
        connection: row.get("connection"),
        backend: row.get("backend"),
        status: MigrationStatus::parse(&status)?,
        applied: row.get("applied"),
        applied_at: row.get("applied_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn history_row(row: &Row) -> Result<MigrationHistoryRow> {
    let status: String = row.get("status");
    Ok(MigrationHistoryRow {
        id: row.get("id"),
        migration_id: row.get("migration_id"),
        schema: row.get("schema_name"),
        version: row.get("version"),
        connection: row.get("connection"),
        backend: row.get("backend"),
        status: MigrationStatus::parse(&status)?,
        error_message: row.get("error_message"),
        executed_by: row.get("executed_by"),
        execution_method: row.get("execution_method"),
        execution_context: row.get("execution_context"),
        applied_at: row.get("applied_at"),
        created_at: row.get("created_at"),
    })
}

pub(crate) fn dependency_row(row: &Row) -> Result<MigrationDependencyRow> {
    Ok(MigrationDependencyRow {
        id: row.get("id"),
        migration_id: row.get("migration_id"),
        dependency_id: row.get("dependency_id"),
        connection: row.get("connection"),
        schema: json_to_string_list(row.get("schema_names")),
        target: row.get("target"),
        target_type: row.get("target_type"),
        requires_table: row.get("requires_table"),
        requires_schema: row.get("requires_schema"),
    })
}

/// Normalize a user-supplied status filter, accepting the legacy `success`
/// spelling.
pub(crate) fn normalize_status_filter(raw: &str) -> Result<String> {
    MigrationStatus::parse(raw)
        .map(|s| s.as_str().to_string())
        .map_err(|_| BfmError::Validation(format!("Unknown status filter '{}'", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_status_filter_accepts_success() {
        assert_eq!(normalize_status_filter("success").unwrap(), "applied");
        assert_eq!(normalize_status_filter("rolled_back").unwrap(), "rolled_back");
        assert!(normalize_status_filter("done").is_err());
    }

    #[test]
    fn test_json_to_string_list_tolerates_garbage() {
        assert_eq!(
            json_to_string_list(serde_json::json!(["a", "b"])),
            vec!["a", "b"]
        );
        assert!(json_to_string_list(serde_json::json!({"x": 1})).is_empty());
    }
}
