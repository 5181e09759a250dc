//! Persistent state tracker.
//!
//! Owns the four state tables (`migrations_list`, `migrations_executions`,
//! `migrations_history`, `migrations_dependencies`) in a configurable schema
//! of a relational state store. Every mutation is a conflict-resolving
//! upsert or an append-only insert, so concurrent recorders on the same
//! (migration, schema) converge to last-writer-wins without the tracker
//! serializing its callers.

mod legacy;
mod queries;
mod reindex;
mod rows;

pub use reindex::ReindexReport;
pub use rows::{
    HistoryFilters, ListFilters, MigrationDependencyRow, MigrationExecutionRow,
    MigrationHistoryRow, MigrationListRow, MigrationStatusSummary,
};

use chrono::{DateTime, Utc};
use deadpool_postgres::{ManagerConfig, Pool, RecyclingMethod, Runtime};

use crate::backend::postgres::quote_ident;
use crate::config::{SslMode, StateStoreConfig};
use crate::error::{BfmError, Result};
use crate::script::{normalize_migration_id, Backend, ExecutionMethod, MigrationStatus};

/// Everything the tracker needs to write one migration outcome.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    /// Migration-id as supplied; normalized before any write.
    pub migration_id: String,
    /// Schemas the outcome applies to; empty touches only `migrations_list`.
    pub schemas: Vec<String>,
    pub version: String,
    pub connection: String,
    pub backend: Backend,
    /// Outcome being recorded. `Applied` marks the pair applied; `Failed`
    /// captures the error; `RolledBack` demotes the pair to pending.
    pub status: MigrationStatus,
    pub error_message: Option<String>,
    pub executed_by: String,
    pub execution_method: ExecutionMethod,
    pub execution_context: serde_json::Value,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Tracker over a deadpool-managed state-store pool.
pub struct StateTracker {
    pool: Pool,
    schema: String,
    max_idle: usize,
    conn_lifetime: std::time::Duration,
}

impl StateTracker {
    /// Build the pool from configuration. Connections are opened lazily on
    /// first checkout, so this performs no I/O.
    pub fn connect(config: &StateStoreConfig) -> Result<Self> {
        let mut pool_config = deadpool_postgres::Config::new();
        pool_config.host = Some(config.host.clone());
        pool_config.port = Some(config.port);
        pool_config.dbname = Some(config.database.clone());
        pool_config.user = Some(config.username.clone());
        if !config.password.is_empty() {
            pool_config.password = Some(config.password.clone());
        }
        pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        pool_config.pool = Some(deadpool_postgres::PoolConfig::new(config.max_open));

        let pool = match config.ssl_mode {
            SslMode::Require => {
                let tls = crate::backend::postgres::tls_connector();
                pool_config.create_pool(Some(Runtime::Tokio1), tls)
            }
            _ => pool_config.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls),
        }
        .map_err(|e| BfmError::ConfigError(format!("Cannot build state-store pool: {}", e)))?;

        Ok(Self {
            pool,
            schema: config.schema.clone(),
            max_idle: config.max_idle,
            conn_lifetime: std::time::Duration::from_secs(config.conn_lifetime_secs),
        })
    }

    /// The schema the state tables live in.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub(crate) async fn client(&self) -> Result<deadpool_postgres::Object> {
        Ok(self.pool.get().await?)
    }

    /// Fully-qualified, quoted table name inside the tracker schema.
    pub(crate) fn table(&self, name: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(name))
    }

    /// Drop pooled connections that outlived their configured lifetime, and
    /// trim idle connections beyond `max_idle`.
    pub fn sweep_idle(&self) {
        let lifetime = self.conn_lifetime;
        let max_idle = self.max_idle;
        let kept = std::cell::Cell::new(0usize);
        let _ = self.pool.retain(|_, metrics| {
            if metrics.age() > lifetime {
                return false;
            }
            kept.set(kept.get() + 1);
            kept.get() <= max_idle
        });
    }

    /// Create the schema, tables, and indexes idempotently, then run the
    /// one-shot legacy migration if a `bfm_migrations` table is present.
    pub async fn initialize(&self) -> Result<()> {
        let client = self.client().await?;
        let schema = quote_ident(&self.schema);
        let list = self.table("migrations_list");
        let executions = self.table("migrations_executions");
        let history = self.table("migrations_history");
        let dependencies = self.table("migrations_dependencies");

        let ddl = format!(
            r#"
CREATE SCHEMA IF NOT EXISTS {schema};

CREATE TABLE IF NOT EXISTS {list} (
    migration_id            TEXT PRIMARY KEY,
    schema_name             TEXT NOT NULL DEFAULT '',
    version                 TEXT NOT NULL,
    name                    TEXT NOT NULL,
    connection              TEXT NOT NULL,
    backend                 TEXT NOT NULL,
    up_filename             TEXT NOT NULL DEFAULT '',
    down_filename           TEXT NOT NULL DEFAULT '',
    dependencies            JSONB NOT NULL DEFAULT '[]'::jsonb,
    structured_dependencies JSONB NOT NULL DEFAULT '[]'::jsonb,
    status                  TEXT NOT NULL DEFAULT 'pending',
    checksum                BIGINT NOT NULL DEFAULT 0,
    created_at              TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at              TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS {executions} (
    id           BIGSERIAL PRIMARY KEY,
    migration_id TEXT NOT NULL REFERENCES {list} (migration_id) ON DELETE CASCADE,
    schema_name  TEXT NOT NULL DEFAULT '',
    version      TEXT NOT NULL,
    connection   TEXT NOT NULL,
    backend      TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'pending',
    applied      BOOLEAN NOT NULL DEFAULT FALSE,
    applied_at   TIMESTAMPTZ,
    created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (migration_id, schema_name, version, connection, backend)
);

CREATE TABLE IF NOT EXISTS {history} (
    id                BIGSERIAL PRIMARY KEY,
    migration_id      TEXT NOT NULL REFERENCES {list} (migration_id) ON DELETE CASCADE,
    schema_name       TEXT NOT NULL DEFAULT '',
    version           TEXT NOT NULL,
    connection        TEXT NOT NULL,
    backend           TEXT NOT NULL,
    status            TEXT NOT NULL,
    error_message     TEXT,
    executed_by       TEXT NOT NULL DEFAULT '',
    execution_method  TEXT NOT NULL DEFAULT 'api',
    execution_context JSONB NOT NULL DEFAULT '{{}}'::jsonb,
    applied_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
    created_at        TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS {dependencies} (
    id              BIGSERIAL PRIMARY KEY,
    migration_id    TEXT NOT NULL REFERENCES {list} (migration_id) ON DELETE CASCADE,
    dependency_id   TEXT NOT NULL REFERENCES {list} (migration_id) ON DELETE CASCADE,
    connection      TEXT NOT NULL,
    schema_names    JSONB NOT NULL DEFAULT '[]'::jsonb,
    target          TEXT NOT NULL,
    target_type     TEXT NOT NULL,
    requires_table  TEXT,
    requires_schema TEXT
);

CREATE INDEX IF NOT EXISTS migrations_list_conn_backend_idx
    ON {list} (connection, backend);
CREATE INDEX IF NOT EXISTS migrations_list_status_idx
    ON {list} (status);
CREATE INDEX IF NOT EXISTS migrations_executions_mid_idx
    ON {executions} (migration_id);
CREATE INDEX IF NOT EXISTS migrations_history_mid_idx
    ON {history} (migration_id);
CREATE INDEX IF NOT EXISTS migrations_history_applied_at_idx
    ON {history} (applied_at DESC);
"#,
        );
        client.batch_execute(&ddl).await?;

        legacy::migrate_legacy_table(&client, &self.schema).await?;

        log::debug!("State tracker initialized; schema={}", self.schema);
        Ok(())
    }

    /// Seed a pending `migrations_list` row for a scanned script.
    /// A row exists even with an empty schema so dependencies resolve.
    pub async fn register_scanned_migration(
        &self,
        migration_id: &str,
        schema: &str,
        version: &str,
        name: &str,
        connection: &str,
        backend: Backend,
    ) -> Result<()> {
        let id = normalize_migration_id(migration_id).base;
        let client = self.client().await?;
        let sql = format!(
            "INSERT INTO {} (migration_id, schema_name, version, name, connection, backend, status)
             VALUES ($1, $2, $3, $4, $5, $6, 'pending')
             ON CONFLICT (migration_id) DO NOTHING",
            self.table("migrations_list")
        );
        client
            .execute(
                &sql,
                &[&id, &schema, &version, &name, &connection, &backend.as_str()],
            )
            .await?;
        Ok(())
    }

    /// Update metadata on an existing `migrations_list` row.
    pub async fn update_migration_info(
        &self,
        migration_id: &str,
        schema: &str,
        up_filename: &str,
        down_filename: &str,
        dependencies: &[String],
        structured_dependencies: &serde_json::Value,
        checksum: i64,
    ) -> Result<()> {
        let id = normalize_migration_id(migration_id).base;
        let client = self.client().await?;
        let sql = format!(
            "UPDATE {} SET schema_name = $2, up_filename = $3, down_filename = $4,
                    dependencies = $5, structured_dependencies = $6, checksum = $7,
                    updated_at = now()
             WHERE migration_id = $1",
            self.table("migrations_list")
        );
        let deps = serde_json::to_value(dependencies)
            .map_err(|e| BfmError::Validation(format!("Unencodable dependency list: {}", e)))?;
        let updated = client
            .execute(
                &sql,
                &[
                    &id,
                    &schema,
                    &up_filename,
                    &down_filename,
                    &deps,
                    structured_dependencies,
                    &checksum,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(BfmError::MigrationNotFound { migration_id: id });
        }
        Ok(())
    }

    /// Delete the `migrations_list` row; executions, history, and dependency
    /// rows go with it via FK cascade. Returns whether a row was deleted.
    pub async fn delete_migration(&self, migration_id: &str) -> Result<bool> {
        let id = normalize_migration_id(migration_id).base;
        let client = self.client().await?;
        let sql = format!(
            "DELETE FROM {} WHERE migration_id = $1",
            self.table("migrations_list")
        );
        let deleted = client.execute(&sql, &[&id]).await?;
        Ok(deleted > 0)
    }

    /// True iff the list row for this id carries status `applied`.
    pub async fn is_migration_applied(&self, migration_id: &str) -> Result<bool> {
        let id = normalize_migration_id(migration_id).base;
        let client = self.client().await?;
        let sql = format!(
            "SELECT status FROM {} WHERE migration_id = $1",
            self.table("migrations_list")
        );
        let row = client.query_opt(&sql, &[&id]).await?;
        Ok(matches!(
            row.map(|r| r.get::<_, String>(0)),
            Some(status) if status == "applied"
        ))
    }

    /// Record one migration outcome.
    ///
    /// Normalizes the id, updates the summary status on `migrations_list`
    /// (no-op when the row is absent), and, per schema in the record,
    /// appends a history row and upserts the executions row keyed on the
    /// unique 5-tuple. With no schemas supplied only the list is touched.
    pub async fn record_migration(&self, record: &MigrationRecord) -> Result<()> {
        let normalized = normalize_migration_id(&record.migration_id);
        let is_rollback =
            normalized.is_rollback || record.status == MigrationStatus::RolledBack;
        let list_status = if is_rollback {
            MigrationStatus::RolledBack
        } else {
            record.status
        };
        let applied_at = record.applied_at.unwrap_or_else(Utc::now);

        let client = self.client().await?;

        let sql = format!(
            "UPDATE {} SET status = $2, updated_at = now() WHERE migration_id = $1",
            self.table("migrations_list")
        );
        let updated = client
            .execute(&sql, &[&normalized.base, &list_status.as_str()])
            .await?;
        if updated == 0 {
            // Without a list row the FK-bearing tables cannot be written.
            log::warn!(
                "No list row for {}; outcome not recorded in history/executions",
                normalized.base
            );
            return Ok(());
        }

        if record.schemas.is_empty() {
            return Ok(());
        }

        let history_status = if is_rollback {
            MigrationStatus::RolledBack
        } else {
            record.status
        };
        let (exec_status, exec_applied) = match history_status {
            MigrationStatus::Applied => (MigrationStatus::Applied, true),
            MigrationStatus::Failed => (MigrationStatus::Failed, false),
            // Rollback demotes the pair back to pending.
            MigrationStatus::RolledBack | MigrationStatus::Pending => {
                (MigrationStatus::Pending, false)
            }
        };

        let history_sql = format!(
            "INSERT INTO {} (migration_id, schema_name, version, connection, backend,
                             status, error_message, executed_by, execution_method,
                             execution_context, applied_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            self.table("migrations_history")
        );
        let executions_sql = format!(
            "INSERT INTO {} (migration_id, schema_name, version, connection, backend,
                             status, applied, applied_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (migration_id, schema_name, version, connection, backend)
             DO UPDATE SET
                 status = EXCLUDED.status,
                 applied = EXCLUDED.applied,
                 applied_at = CASE WHEN EXCLUDED.applied
                                   THEN EXCLUDED.applied_at
                                   ELSE {}.applied_at END,
                 updated_at = now()",
            self.table("migrations_executions"),
            // The conflicting row is addressed by bare table name in DO UPDATE.
            quote_ident("migrations_executions"),
        );

        for schema in &record.schemas {
            client
                .execute(
                    &history_sql,
                    &[
                        &normalized.base,
                        schema,
                        &record.version,
                        &record.connection,
                        &record.backend.as_str(),
                        &history_status.as_str(),
                        &record.error_message,
                        &record.executed_by,
                        &record.execution_method.as_str(),
                        &record.execution_context,
                        &applied_at,
                    ],
                )
                .await?;

            client
                .execute(
                    &executions_sql,
                    &[
                        &normalized.base,
                        schema,
                        &record.version,
                        &record.connection,
                        &record.backend.as_str(),
                        &exec_status.as_str(),
                        &exec_applied,
                        &applied_at,
                    ],
                )
                .await?;
        }

        Ok(())
    }
}
