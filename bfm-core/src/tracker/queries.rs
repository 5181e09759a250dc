//! Read-only state queries: list, history, detail, executions, and the
//! latest-winner status computation.

use tokio_postgres::types::ToSql;

use crate::error::Result;
use crate::script::{normalize_migration_id, MigrationStatus};

use super::rows::{
    self, HistoryFilters, ListFilters, MigrationDependencyRow, MigrationExecutionRow,
    MigrationHistoryRow, MigrationListRow, MigrationStatusSummary,
};
use super::StateTracker;

/// Schema filter matching exact value OR comma-containment, the legacy
/// multi-schema encoding (`a,b,c`).
fn schema_condition(param_index: usize) -> String {
    format!(
        "(',' || schema_name || ',' LIKE '%,' || ${} || ',%')",
        param_index
    )
}

impl StateTracker {
    /// Rows of `migrations_list` matching the filters.
    pub async fn get_migration_list(&self, filters: &ListFilters) -> Result<Vec<MigrationListRow>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();

        if let Some(ref schema) = filters.schema {
            params.push(Box::new(schema.clone()));
            conditions.push(schema_condition(params.len()));
        }
        if let Some(ref connection) = filters.connection {
            params.push(Box::new(connection.clone()));
            conditions.push(format!("connection = ${}", params.len()));
        }
        if let Some(ref backend) = filters.backend {
            params.push(Box::new(backend.clone()));
            conditions.push(format!("backend = ${}", params.len()));
        }
        if let Some(ref status) = filters.status {
            params.push(Box::new(rows::normalize_status_filter(status)?));
            conditions.push(format!("status = ${}", params.len()));
        }
        if let Some(ref version) = filters.version {
            params.push(Box::new(version.clone()));
            conditions.push(format!("version = ${}", params.len()));
        }
        if let Some(ref ids) = filters.migration_ids {
            params.push(Box::new(ids.clone()));
            conditions.push(format!("migration_id = ANY(${})", params.len()));
        }

        let mut sql = format!("SELECT * FROM {}", self.table("migrations_list"));
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY version, migration_id");

        let client = self.client().await?;
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        let raw = client.query(&sql, &param_refs).await?;
        raw.iter().map(rows::list_row).collect()
    }

    /// History rows matching the filters, newest first. An id filter also
    /// matches legacy `_rollback`-suffixed records.
    pub async fn get_migration_history(
        &self,
        filters: &HistoryFilters,
    ) -> Result<Vec<MigrationHistoryRow>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();

        if let Some(ref id) = filters.migration_id {
            let base = normalize_migration_id(id).base;
            params.push(Box::new(base));
            conditions.push(format!(
                "(migration_id = ${} OR migration_id = ${} || '_rollback')",
                params.len(),
                params.len()
            ));
        }
        if let Some(ref schema) = filters.schema {
            params.push(Box::new(schema.clone()));
            conditions.push(schema_condition(params.len()));
        }
        if let Some(ref connection) = filters.connection {
            params.push(Box::new(connection.clone()));
            conditions.push(format!("connection = ${}", params.len()));
        }
        if let Some(ref backend) = filters.backend {
            params.push(Box::new(backend.clone()));
            conditions.push(format!("backend = ${}", params.len()));
        }
        if let Some(ref status) = filters.status {
            params.push(Box::new(rows::normalize_status_filter(status)?));
            conditions.push(format!("status = ${}", params.len()));
        }

        let mut sql = format!("SELECT * FROM {}", self.table("migrations_history"));
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY applied_at DESC, id DESC");
        if let Some(limit) = filters.limit {
            params.push(Box::new(limit));
            sql.push_str(&format!(" LIMIT ${}", params.len()));
        }

        let client = self.client().await?;
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        let raw = client.query(&sql, &param_refs).await?;
        raw.iter().map(rows::history_row).collect()
    }

    /// The list row for one migration, or None.
    pub async fn get_migration_detail(
        &self,
        migration_id: &str,
    ) -> Result<Option<MigrationListRow>> {
        let base = normalize_migration_id(migration_id).base;
        let sql = format!(
            "SELECT * FROM {} WHERE migration_id = $1",
            self.table("migrations_list")
        );
        let client = self.client().await?;
        let raw = client.query_opt(&sql, &[&base]).await?;
        raw.as_ref().map(rows::list_row).transpose()
    }

    /// Execution rows for one migration, ordered by schema.
    pub async fn get_migration_executions(
        &self,
        migration_id: &str,
    ) -> Result<Vec<MigrationExecutionRow>> {
        let base = normalize_migration_id(migration_id).base;
        let sql = format!(
            "SELECT * FROM {} WHERE migration_id = $1 ORDER BY schema_name, id",
            self.table("migrations_executions")
        );
        let client = self.client().await?;
        let raw = client.query(&sql, &[&base]).await?;
        raw.iter().map(rows::execution_row).collect()
    }

    /// Dependency rows recorded for one migration.
    pub async fn get_migration_dependencies(
        &self,
        migration_id: &str,
    ) -> Result<Vec<MigrationDependencyRow>> {
        let base = normalize_migration_id(migration_id).base;
        let sql = format!(
            "SELECT * FROM {} WHERE migration_id = $1 ORDER BY id",
            self.table("migrations_dependencies")
        );
        let client = self.client().await?;
        let raw = client.query(&sql, &[&base]).await?;
        raw.iter().map(rows::dependency_row).collect()
    }

    /// The most recent history rows across all migrations.
    pub async fn get_recent_executions(&self, limit: i64) -> Result<Vec<MigrationHistoryRow>> {
        self.get_migration_history(&HistoryFilters {
            limit: Some(limit),
            ..Default::default()
        })
        .await
    }

    /// Latest-winner status over history: the newest history row decides
    /// whether the migration counts as applied. Falls back to the list row
    /// when no history exists. None when the migration is unknown entirely.
    pub async fn get_migration_status(
        &self,
        migration_id: &str,
    ) -> Result<Option<MigrationStatusSummary>> {
        let base = normalize_migration_id(migration_id).base;
        let history = self
            .get_migration_history(&HistoryFilters {
                migration_id: Some(base.clone()),
                limit: Some(1),
                ..Default::default()
            })
            .await?;

        if let Some(latest) = history.first() {
            return Ok(Some(MigrationStatusSummary {
                migration_id: base,
                applied: latest.status == MigrationStatus::Applied,
                status: latest.status,
                last_executed_at: Some(latest.applied_at),
            }));
        }

        let detail = self.get_migration_detail(&base).await?;
        Ok(detail.map(|row| MigrationStatusSummary {
            migration_id: base,
            applied: row.status == MigrationStatus::Applied,
            status: row.status,
            last_executed_at: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_condition_matches_legacy_encoding() {
        // The SQL expression wraps both sides in commas, so 'b' matches
        // 'a,b,c' and the exact value 'b' but not 'ab'.
        let cond = schema_condition(1);
        assert!(cond.contains("',' || schema_name || ','"));
        assert!(cond.contains("'%,' || $1 || ',%'"));
    }
}
