//! One-shot import from the legacy single-table layout.
//!
//! Early deployments recorded everything in one `bfm_migrations` table,
//! encoding rollbacks as a `_rollback` suffix on the migration-id. On first
//! initialization against such a store, the tracker derives one list row
//! per base id and replays every original row into the history log.

use chrono::{DateTime, Utc};
use deadpool_postgres::Object;

use crate::backend::postgres::quote_ident;
use crate::error::Result;
use crate::script::{normalize_migration_id, MigrationStatus};

/// A row read from the legacy `bfm_migrations` table.
#[derive(Debug, Clone)]
pub(crate) struct LegacyRow {
    pub migration_id: String,
    pub schema: String,
    pub version: String,
    pub connection: String,
    pub backend: String,
    pub status: String,
    pub error_message: Option<String>,
    pub executed_by: String,
    pub execution_method: String,
    pub applied_at: DateTime<Utc>,
}

impl LegacyRow {
    /// Whether this row records a rollback, in either legacy encoding.
    fn is_rollback(&self) -> bool {
        self.status == "rolled_back" || self.migration_id.ends_with("_rollback")
    }

    /// Whether this row records a successful forward application.
    fn is_successful_apply(&self) -> bool {
        !self.is_rollback() && matches!(self.status.as_str(), "success" | "applied")
    }
}

/// Last-status computation for one base id: the most recent successful
/// application wins unless a rollback is more recent.
pub(crate) fn derive_list_status(rows: &[LegacyRow]) -> MigrationStatus {
    let last_apply = rows
        .iter()
        .filter(|r| r.is_successful_apply())
        .map(|r| r.applied_at)
        .max();
    let last_rollback = rows
        .iter()
        .filter(|r| r.is_rollback())
        .map(|r| r.applied_at)
        .max();

    match (last_apply, last_rollback) {
        (Some(applied), Some(rolled_back)) if rolled_back > applied => {
            MigrationStatus::RolledBack
        }
        (Some(_), _) => MigrationStatus::Applied,
        (None, Some(_)) => MigrationStatus::RolledBack,
        (None, None) => {
            if rows.iter().any(|r| r.status == "failed") {
                MigrationStatus::Failed
            } else {
                MigrationStatus::Pending
            }
        }
    }
}

/// Extract the name component from a canonical base id,
/// `{version}_{name}_{backend}_{connection}`.
pub(crate) fn name_from_base_id(
    base: &str,
    version: &str,
    backend: &str,
    connection: &str,
) -> String {
    let suffix = format!("_{}_{}", backend, connection);
    base.strip_prefix(version)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.strip_suffix(&suffix))
        .unwrap_or(base)
        .to_string()
}

async fn legacy_table_exists(client: &Object, schema: &str) -> Result<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS (
                SELECT FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = 'bfm_migrations'
            )",
            &[&schema],
        )
        .await?;
    Ok(row.get::<_, bool>(0))
}

async fn history_is_empty(client: &Object, schema: &str) -> Result<bool> {
    let sql = format!(
        "SELECT NOT EXISTS (SELECT 1 FROM {}.{})",
        quote_ident(schema),
        quote_ident("migrations_history")
    );
    let row = client.query_one(&sql, &[]).await?;
    Ok(row.get::<_, bool>(0))
}

/// Import the legacy table if present and not yet imported.
///
/// Runs in two phases: (1) one list row per unique base id with derived
/// last-status; (2) every original row appended into history, ids
/// normalized, rollback rows recorded with status `rolled_back`.
pub(crate) async fn migrate_legacy_table(client: &Object, schema: &str) -> Result<()> {
    if !legacy_table_exists(client, schema).await? {
        return Ok(());
    }
    if !history_is_empty(client, schema).await? {
        // Already imported on an earlier initialize.
        return Ok(());
    }

    log::info!("Importing legacy bfm_migrations table; schema={}", schema);

    let select = format!(
        "SELECT migration_id, COALESCE(schema_name, '') AS schema_name, version,
                connection, backend, status, error_message,
                COALESCE(executed_by, '') AS executed_by,
                COALESCE(execution_method, 'manual') AS execution_method,
                applied_at
         FROM {}.{} ORDER BY applied_at",
        quote_ident(schema),
        quote_ident("bfm_migrations")
    );
    let raw_rows = client.query(&select, &[]).await?;
    let rows: Vec<LegacyRow> = raw_rows
        .iter()
        .map(|row| LegacyRow {
            migration_id: row.get("migration_id"),
            schema: row.get("schema_name"),
            version: row.get("version"),
            connection: row.get("connection"),
            backend: row.get("backend"),
            status: row.get("status"),
            error_message: row.get("error_message"),
            executed_by: row.get("executed_by"),
            execution_method: row.get("execution_method"),
            applied_at: row.get("applied_at"),
        })
        .collect();

    // Phase 1: derive one list row per base id.
    let mut by_base: std::collections::BTreeMap<String, Vec<&LegacyRow>> =
        std::collections::BTreeMap::new();
    for row in &rows {
        let base = normalize_migration_id(&row.migration_id).base;
        by_base.entry(base).or_default().push(row);
    }

    let list_insert = format!(
        "INSERT INTO {}.{} (migration_id, schema_name, version, name, connection, backend, status)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (migration_id) DO NOTHING",
        quote_ident(schema),
        quote_ident("migrations_list")
    );
    for (base, group) in &by_base {
        let owned: Vec<LegacyRow> = group.iter().map(|r| (*r).clone()).collect();
        let status = derive_list_status(&owned);
        let first = group[0];
        let name = name_from_base_id(base, &first.version, &first.backend, &first.connection);
        client
            .execute(
                &list_insert,
                &[
                    base,
                    &first.schema,
                    &first.version,
                    &name,
                    &first.connection,
                    &first.backend,
                    &status.as_str(),
                ],
            )
            .await?;
    }

    // Phase 2: replay every original row, rollbacks included, into history.
    let history_insert = format!(
        "INSERT INTO {}.{} (migration_id, schema_name, version, connection, backend,
                            status, error_message, executed_by, execution_method,
                            execution_context, applied_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, '{{}}'::jsonb, $10)",
        quote_ident(schema),
        quote_ident("migrations_history")
    );
    for row in &rows {
        let base = normalize_migration_id(&row.migration_id).base;
        let status = if row.is_rollback() {
            "rolled_back".to_string()
        } else if row.status == "success" {
            "applied".to_string()
        } else {
            row.status.clone()
        };
        client
            .execute(
                &history_insert,
                &[
                    &base,
                    &row.schema,
                    &row.version,
                    &row.connection,
                    &row.backend,
                    &status,
                    &row.error_message,
                    &row.executed_by,
                    &row.execution_method,
                    &row.applied_at,
                ],
            )
            .await?;
    }

    log::info!(
        "Legacy import complete; migrations={}, history_rows={}",
        by_base.len(),
        rows.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(id: &str, status: &str, minute: u32) -> LegacyRow {
        LegacyRow {
            migration_id: id.to_string(),
            schema: String::new(),
            version: "20240101120000".to_string(),
            connection: "main".to_string(),
            backend: "postgresql".to_string(),
            status: status.to_string(),
            error_message: None,
            executed_by: "ops".to_string(),
            execution_method: "cli".to_string(),
            applied_at: Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap(),
        }
    }

    const BASE: &str = "20240101120000_add_users_postgresql_main";

    #[test]
    fn test_derive_status_apply_only() {
        let rows = vec![row(BASE, "success", 0)];
        assert_eq!(derive_list_status(&rows), MigrationStatus::Applied);
    }

    #[test]
    fn test_derive_status_rollback_after_apply() {
        let rows = vec![
            row(BASE, "success", 0),
            row(&format!("{}_rollback", BASE), "success", 5),
        ];
        assert_eq!(derive_list_status(&rows), MigrationStatus::RolledBack);
    }

    #[test]
    fn test_derive_status_reapply_after_rollback() {
        let rows = vec![
            row(BASE, "success", 0),
            row(&format!("{}_rollback", BASE), "success", 5),
            row(BASE, "success", 10),
        ];
        assert_eq!(derive_list_status(&rows), MigrationStatus::Applied);
    }

    #[test]
    fn test_derive_status_explicit_rolled_back_status() {
        let rows = vec![row(BASE, "success", 0), row(BASE, "rolled_back", 3)];
        assert_eq!(derive_list_status(&rows), MigrationStatus::RolledBack);
    }

    #[test]
    fn test_derive_status_failures_only() {
        let rows = vec![row(BASE, "failed", 0), row(BASE, "failed", 1)];
        assert_eq!(derive_list_status(&rows), MigrationStatus::Failed);
    }

    #[test]
    fn test_derive_status_no_rows_is_pending() {
        assert_eq!(derive_list_status(&[]), MigrationStatus::Pending);
    }

    #[test]
    fn test_name_from_base_id() {
        assert_eq!(
            name_from_base_id(BASE, "20240101120000", "postgresql", "main"),
            "add_users"
        );
        // Unparseable shapes fall back to the full id.
        assert_eq!(
            name_from_base_id("weird", "20240101120000", "postgresql", "main"),
            "weird"
        );
    }
}
