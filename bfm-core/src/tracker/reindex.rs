//! Reconciliation of the in-memory registry with the persisted
//! `migrations_list` table.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::Result;
use crate::registry::ScriptRegistry;
use crate::script::{DependencyTargetType, MigrationScript};

use super::rows::ListFilters;
use super::StateTracker;

/// Outcome of one reindex pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReindexReport {
    /// Migration-ids newly inserted into the list.
    pub added: Vec<String>,
    /// Migration-ids deleted because their scripts left the disk.
    pub removed: Vec<String>,
    /// Migration-ids whose metadata or payload checksum changed.
    pub updated: Vec<String>,
    /// Total scripts in the registry after the pass.
    pub total: usize,
}

impl StateTracker {
    /// Reconcile registry state into the list/executions/dependencies
    /// tables. Safe to interleave with executor traffic: every write uses
    /// explicit conflict resolution.
    pub async fn reindex_migrations(&self, registry: &ScriptRegistry) -> Result<ReindexReport> {
        let scripts = registry.snapshot();
        let db_rows = self.get_migration_list(&ListFilters::default()).await?;
        let db_by_id: HashMap<String, i64> = db_rows
            .iter()
            .map(|row| (row.migration_id.clone(), row.checksum))
            .collect();

        let mut report = ReindexReport {
            total: scripts.len(),
            ..Default::default()
        };

        for (id, script) in &scripts {
            match db_by_id.get(id) {
                None => {
                    self.register_scanned_migration(
                        id,
                        &script.schema,
                        &script.version,
                        &script.name,
                        &script.connection,
                        script.backend,
                    )
                    .await?;
                    self.write_script_metadata(id, script).await?;
                    report.added.push(id.clone());
                }
                Some(&stored_checksum) => {
                    // Status is preserved; only metadata is overwritten.
                    self.write_script_metadata(id, script).await?;
                    if stored_checksum != script.checksum as i64 {
                        report.updated.push(id.clone());
                    }
                }
            }

            self.seed_execution_row(id, script).await?;
        }

        // Dependencies rebuild only after every list row exists, so the
        // dependency_id foreign key can resolve regardless of scan order.
        for (id, script) in &scripts {
            self.rebuild_dependencies(id, script, registry).await?;
        }

        for row in &db_rows {
            if !scripts.contains_key(&row.migration_id) {
                self.delete_migration(&row.migration_id).await?;
                report.removed.push(row.migration_id.clone());
            }
        }

        report.added.sort();
        report.removed.sort();
        report.updated.sort();
        log::info!(
            "Reindex complete; added={}, removed={}, updated={}, total={}",
            report.added.len(),
            report.removed.len(),
            report.updated.len(),
            report.total
        );
        Ok(report)
    }

    async fn write_script_metadata(&self, id: &str, script: &MigrationScript) -> Result<()> {
        let structured = serde_json::to_value(&script.structured_dependencies)
            .unwrap_or_else(|_| serde_json::json!([]));
        self.update_migration_info(
            id,
            &script.schema,
            &script.up_filename,
            &script.down_filename,
            &script.dependencies,
            &structured,
            script.checksum as i64,
        )
        .await
    }

    /// Ensure one executions row exists per declared schema, carrying over
    /// any recorded status.
    async fn seed_execution_row(&self, id: &str, script: &MigrationScript) -> Result<()> {
        let client = self.client().await?;
        let sql = format!(
            "INSERT INTO {} (migration_id, schema_name, version, connection, backend, status, applied)
             VALUES ($1, $2, $3, $4, $5, 'pending', FALSE)
             ON CONFLICT (migration_id, schema_name, version, connection, backend) DO NOTHING",
            self.table("migrations_executions")
        );
        client
            .execute(
                &sql,
                &[
                    &id,
                    &script.schema,
                    &script.version,
                    &script.connection,
                    &script.backend.as_str(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Delete-then-insert rebuild of the dependency rows for one migration.
    ///
    /// Structured dependencies resolve to concrete ids by (connection, name)
    /// or (connection, version); simple name dependencies resolve within the
    /// script's own connection. Unresolvable declarations are warned and
    /// skipped.
    async fn rebuild_dependencies(
        &self,
        id: &str,
        script: &MigrationScript,
        registry: &ScriptRegistry,
    ) -> Result<()> {
        let client = self.client().await?;
        let delete = format!(
            "DELETE FROM {} WHERE migration_id = $1",
            self.table("migrations_dependencies")
        );
        client.execute(&delete, &[&id]).await?;

        let insert = format!(
            "INSERT INTO {} (migration_id, dependency_id, connection, schema_names,
                             target, target_type, requires_table, requires_schema)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.table("migrations_dependencies")
        );

        for name in &script.dependencies {
            let resolved = registry
                .get_by_connection(&script.connection)
                .into_iter()
                .find(|s| &s.name == name);
            let Some(dep) = resolved else {
                log::warn!(
                    "Unresolvable dependency; migration_id={}, target={}",
                    id,
                    name
                );
                continue;
            };
            client
                .execute(
                    &insert,
                    &[
                        &id,
                        &dep.migration_id(),
                        &script.connection,
                        &serde_json::json!([]),
                        name,
                        &"name",
                        &Option::<String>::None,
                        &Option::<String>::None,
                    ],
                )
                .await?;
        }

        for dep in &script.structured_dependencies {
            let resolved = match dep.target_type {
                DependencyTargetType::Name => registry
                    .get_by_connection(&dep.connection)
                    .into_iter()
                    .find(|s| s.name == dep.target),
                DependencyTargetType::Version => {
                    registry.get_by_connection_and_version(&dep.connection, &dep.target)
                }
            };
            let Some(target_script) = resolved else {
                log::warn!(
                    "Unresolvable structured dependency; migration_id={}, connection={}, target={}",
                    id,
                    dep.connection,
                    dep.target
                );
                continue;
            };
            let target_type = match dep.target_type {
                DependencyTargetType::Name => "name",
                DependencyTargetType::Version => "version",
            };
            let schemas = serde_json::to_value(&dep.schema)
                .unwrap_or_else(|_| serde_json::json!([]));
            client
                .execute(
                    &insert,
                    &[
                        &id,
                        &target_script.migration_id(),
                        &dep.connection,
                        &schemas,
                        &dep.target,
                        &target_type,
                        &dep.requires_table,
                        &dep.requires_schema,
                    ],
                )
                .await?;
        }

        Ok(())
    }
}
