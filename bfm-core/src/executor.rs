//! The execution engine: resolves a request to an ordered script set,
//! applies each (migration, schema) pair through its backend driver, and
//! records every outcome through the state tracker.
//!
//! Per-script errors are captured into the result; once a script fails, the
//! remaining scripts of the request are not attempted (later scripts may
//! depend on the failed one through ordering alone). Planner errors (cycle,
//! unknown backend or connection) abort before anything is applied.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::backend::{BackendDriver, PreparedMigration};
use crate::config::ConnectionConfig;
use crate::dependency::order_scripts;
use crate::error::{BfmError, Result};
use crate::loader;
use crate::queue::{QueueEnvelope, QueueOperation, QueueProducer};
use crate::registry::ScriptRegistry;
use crate::script::{
    normalize_migration_id, Backend, ExecutionMethod, MigrationScript, MigrationStatus,
    MigrationTarget,
};
use crate::tracker::{MigrationRecord, ReindexReport, StateTracker};

/// Who triggered an operation and through which surface; flows into the
/// history log unchanged.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub executed_by: String,
    pub method: ExecutionMethod,
    pub context: serde_json::Value,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            executed_by: "api".to_string(),
            method: ExecutionMethod::Api,
            context: serde_json::Value::Null,
        }
    }
}

/// Aggregated outcome of one up/down request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationResult {
    /// True iff `errors` is empty.
    pub success: bool,
    /// Migration-ids applied (or that would be applied, on dry-run).
    pub applied: Vec<String>,
    /// Migration-ids skipped because they were already applied.
    pub skipped: Vec<String>,
    /// Captured per-script and planner error messages.
    pub errors: Vec<String>,
}

impl MigrationResult {
    /// The trivially successful empty result.
    pub fn empty() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    fn failed(message: String) -> Self {
        Self {
            success: false,
            errors: vec![message],
            ..Default::default()
        }
    }

    fn finish(mut self) -> Self {
        self.success = self.errors.is_empty();
        self
    }

    fn push_applied(&mut self, id: &str) {
        if !self.applied.iter().any(|a| a == id) {
            self.applied.push(id.to_string());
        }
    }

    fn push_skipped(&mut self, id: &str) {
        if !self.skipped.iter().any(|s| s == id) {
            self.skipped.push(id.to_string());
        }
    }
}

/// The planner and driver for migration requests.
pub struct Executor {
    registry: Arc<ScriptRegistry>,
    tracker: Arc<StateTracker>,
    backends: HashMap<Backend, Arc<dyn BackendDriver>>,
    connections: HashMap<String, ConnectionConfig>,
    queue: Option<Arc<dyn QueueProducer>>,
}

impl Executor {
    pub fn new(
        registry: Arc<ScriptRegistry>,
        tracker: Arc<StateTracker>,
        backends: HashMap<Backend, Arc<dyn BackendDriver>>,
        connections: HashMap<String, ConnectionConfig>,
    ) -> Self {
        Self {
            registry,
            tracker,
            backends,
            connections,
            queue: None,
        }
    }

    /// Attach a queue producer; up/down requests are then published instead
    /// of executed inline.
    pub fn with_queue(mut self, producer: Arc<dyn QueueProducer>) -> Self {
        self.queue = Some(producer);
        self
    }

    pub fn registry(&self) -> &Arc<ScriptRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    /// Apply every selected migration forward.
    pub async fn execute_up(
        &self,
        target: &MigrationTarget,
        connection: &str,
        schemas: &[String],
        dry_run: bool,
        ctx: &ExecutionContext,
    ) -> MigrationResult {
        if let Some(ref queue) = self.queue {
            let envelope = QueueEnvelope {
                operation: QueueOperation::Up,
                target: target.clone(),
                migration_id: None,
                connection: connection.to_string(),
                schemas: schemas.to_vec(),
                dry_run,
                executed_by: ctx.executed_by.clone(),
                execution_context: ctx.context.clone(),
            };
            return match queue.publish(&envelope).await {
                Ok(()) => MigrationResult::empty(),
                Err(e) => MigrationResult::failed(format!("queue publish failed: {}", e)),
            };
        }
        self.execute_up_inline(target, connection, schemas, dry_run, ctx)
            .await
    }

    /// The inline up path, also used by the queue worker.
    pub async fn execute_up_inline(
        &self,
        target: &MigrationTarget,
        connection: &str,
        schemas: &[String],
        dry_run: bool,
        ctx: &ExecutionContext,
    ) -> MigrationResult {
        let mut effective_target = target.clone();
        if !connection.is_empty() {
            effective_target.connection = Some(connection.to_string());
        }

        let selection = self.registry.find_by_target(&effective_target);
        if selection.is_empty() {
            return MigrationResult::empty();
        }

        // Planner checks abort before anything is applied.
        if let Err(e) = self.validate_selection(&selection) {
            return MigrationResult::failed(e.to_string());
        }
        let ordered = match order_scripts(&selection) {
            Ok(ordered) => ordered,
            Err(e) => return MigrationResult::failed(e.to_string()),
        };

        let schemas = effective_schemas(schemas);
        let mut result = MigrationResult::default();

        'scripts: for script in &ordered {
            let migration_id = script.migration_id();

            if !dry_run {
                if let Err(e) = self
                    .tracker
                    .register_scanned_migration(
                        &migration_id,
                        &script.schema,
                        &script.version,
                        &script.name,
                        &script.connection,
                        script.backend,
                    )
                    .await
                {
                    result
                        .errors
                        .push(format!("{}: {}", migration_id, e));
                    break 'scripts;
                }
            }

            let (list_applied, applied_set) = if dry_run {
                (false, Vec::new())
            } else {
                let list_applied = match self.tracker.is_migration_applied(&migration_id).await {
                    Ok(applied) => applied,
                    Err(e) => {
                        result.errors.push(format!("{}: {}", migration_id, e));
                        break 'scripts;
                    }
                };
                let applied_set = match self.applied_schemas(&migration_id).await {
                    Ok(set) => set,
                    Err(e) => {
                        result.errors.push(format!("{}: {}", migration_id, e));
                        break 'scripts;
                    }
                };
                (list_applied, applied_set)
            };

            let mut any_work = false;
            for schema in &schemas {
                let already_applied = list_applied
                    && applied_set.iter().any(|a| a == schema || a.is_empty());
                if already_applied {
                    continue;
                }
                any_work = true;

                if dry_run {
                    result.push_applied(&migration_id);
                    continue;
                }

                log::info!(
                    "Applying migration; migration_id={}, schema={}, backend={}",
                    migration_id,
                    schema,
                    script.backend
                );
                match self.apply_payload(script, schema, &script.up_payload, true).await {
                    Ok(()) => {
                        let record = self.record_for(
                            script,
                            vec![schema.clone()],
                            MigrationStatus::Applied,
                            None,
                            ctx,
                        );
                        if let Err(e) = self.tracker.record_migration(&record).await {
                            result.errors.push(format!("{}: {}", migration_id, e));
                            break 'scripts;
                        }
                        result.push_applied(&migration_id);
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        log::error!(
                            "Migration failed; migration_id={}, schema={}, reason={}",
                            migration_id,
                            schema,
                            reason
                        );
                        let record = self.record_for(
                            script,
                            vec![schema.clone()],
                            MigrationStatus::Failed,
                            Some(reason.clone()),
                            ctx,
                        );
                        if let Err(record_err) = self.tracker.record_migration(&record).await {
                            log::warn!(
                                "Failed to record migration failure; migration_id={}, error={}",
                                migration_id,
                                record_err
                            );
                        }
                        result.errors.push(format!("{}: {}", migration_id, reason));
                        // Later scripts may depend on this one; stop here.
                        break 'scripts;
                    }
                }
            }

            if !any_work {
                result.push_skipped(&migration_id);
            }
        }

        result.finish()
    }

    /// Apply the reverse payload of one migration.
    ///
    /// Unknown ids and rollback-incapable scripts surface as typed errors so
    /// the request surface can map them to 404/400; per-schema conditions
    /// are captured into the result instead.
    pub async fn execute_down(
        &self,
        migration_id: &str,
        schemas: &[String],
        dry_run: bool,
        ctx: &ExecutionContext,
    ) -> Result<MigrationResult> {
        let base = normalize_migration_id(migration_id).base;
        let script = self
            .registry
            .get_by_migration_id(&base)
            .ok_or_else(|| BfmError::MigrationNotFound {
                migration_id: base.clone(),
            })?;

        if let Some(ref queue) = self.queue {
            let envelope = QueueEnvelope {
                operation: QueueOperation::Down,
                target: MigrationTarget::default(),
                migration_id: Some(base),
                connection: script.connection.clone(),
                schemas: schemas.to_vec(),
                dry_run,
                executed_by: ctx.executed_by.clone(),
                execution_context: ctx.context.clone(),
            };
            return match queue.publish(&envelope).await {
                Ok(()) => Ok(MigrationResult::empty()),
                Err(e) => Ok(MigrationResult::failed(format!(
                    "queue publish failed: {}",
                    e
                ))),
            };
        }

        self.down_inline(&script, schemas, dry_run, ctx).await
    }

    /// Roll back a migration across every schema it is recorded applied on.
    pub async fn rollback(
        &self,
        migration_id: &str,
        ctx: &ExecutionContext,
    ) -> Result<MigrationResult> {
        let base = normalize_migration_id(migration_id).base;
        let script = self
            .registry
            .get_by_migration_id(&base)
            .ok_or_else(|| BfmError::MigrationNotFound {
                migration_id: base.clone(),
            })?;

        let schemas = self.applied_schemas(&base).await?;
        if schemas.is_empty() {
            return Err(BfmError::NotApplied { migration_id: base });
        }

        self.down_inline(&script, &schemas, false, ctx).await
    }

    async fn down_inline(
        &self,
        script: &MigrationScript,
        schemas: &[String],
        dry_run: bool,
        ctx: &ExecutionContext,
    ) -> Result<MigrationResult> {
        let migration_id = script.migration_id();
        if !script.has_down() {
            return Err(BfmError::RollbackUnavailable { migration_id });
        }

        let executions = self.tracker.get_migration_executions(&migration_id).await?;
        let schemas = effective_schemas(schemas);
        let mut result = MigrationResult::default();

        for schema in &schemas {
            let applied_here = executions
                .iter()
                .any(|e| e.applied && (e.schema == *schema || e.schema.is_empty()));
            if !applied_here {
                result.errors.push(format!(
                    "{}: not applied for schema '{}'",
                    migration_id, schema
                ));
                continue;
            }

            if dry_run {
                result.push_applied(&migration_id);
                continue;
            }

            log::info!(
                "Rolling back migration; migration_id={}, schema={}",
                migration_id,
                schema
            );
            match self
                .apply_payload(script, schema, &script.down_payload, false)
                .await
            {
                Ok(()) => {
                    let record = self.record_for(
                        script,
                        vec![schema.clone()],
                        MigrationStatus::RolledBack,
                        None,
                        ctx,
                    );
                    if let Err(e) = self.tracker.record_migration(&record).await {
                        result.errors.push(format!("{}: {}", migration_id, e));
                        continue;
                    }
                    result.push_applied(&migration_id);
                }
                Err(e) => {
                    let reason = e.to_string();
                    log::error!(
                        "Rollback failed; migration_id={}, schema={}, reason={}",
                        migration_id,
                        schema,
                        reason
                    );
                    let record = self.record_for(
                        script,
                        vec![schema.clone()],
                        MigrationStatus::Failed,
                        Some(reason.clone()),
                        ctx,
                    );
                    if let Err(record_err) = self.tracker.record_migration(&record).await {
                        log::warn!(
                            "Failed to record rollback failure; migration_id={}, error={}",
                            migration_id,
                            record_err
                        );
                    }
                    result.errors.push(format!("{}: {}", migration_id, reason));
                }
            }
        }

        Ok(result.finish())
    }

    /// Tracker initialization plus a health probe of every configured
    /// connection's backend; any failure makes the service unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        self.tracker.initialize().await?;
        self.tracker.sweep_idle();

        for (name, config) in &self.connections {
            let driver = self.driver_for(config.backend)?;
            let mut session = driver.connect(config).await.map_err(|e| {
                BfmError::BackendError {
                    backend: config.backend.to_string(),
                    reason: format!("connection '{}' unreachable: {}", name, e),
                }
            })?;
            let probe = session.health_check().await;
            session.close().await;
            probe.map_err(|e| BfmError::BackendError {
                backend: config.backend.to_string(),
                reason: format!("connection '{}' unhealthy: {}", name, e),
            })?;
        }
        Ok(())
    }

    /// Rescan the corpus into the registry, then reconcile the state tables.
    pub async fn reindex(&self, root: &Path) -> Result<ReindexReport> {
        let scripts = loader::scan_scripts(root)?;
        self.registry.replace_all(scripts);
        self.tracker.reindex_migrations(&self.registry).await
    }

    /// Schemas this migration is currently recorded applied on.
    async fn applied_schemas(&self, migration_id: &str) -> Result<Vec<String>> {
        let executions = self.tracker.get_migration_executions(migration_id).await?;
        let mut schemas: Vec<String> = executions
            .into_iter()
            .filter(|e| e.applied)
            .map(|e| e.schema)
            .collect();
        schemas.sort();
        schemas.dedup();
        Ok(schemas)
    }

    fn driver_for(&self, backend: Backend) -> Result<Arc<dyn BackendDriver>> {
        self.backends
            .get(&backend)
            .cloned()
            .ok_or_else(|| BfmError::UnknownBackend {
                name: backend.to_string(),
                available: {
                    let mut names: Vec<&str> =
                        self.backends.keys().map(|b| b.as_str()).collect();
                    names.sort_unstable();
                    names.join(", ")
                },
            })
    }

    fn connection_for(&self, name: &str) -> Result<&ConnectionConfig> {
        self.connections
            .get(name)
            .ok_or_else(|| BfmError::UnknownConnection {
                name: name.to_string(),
                available: {
                    let mut names: Vec<&str> =
                        self.connections.keys().map(String::as_str).collect();
                    names.sort_unstable();
                    names.join(", ")
                },
            })
    }

    /// Planner validation: every selected script must have a driver and a
    /// connection config before anything runs.
    fn validate_selection(&self, selection: &[MigrationScript]) -> Result<()> {
        for script in selection {
            self.driver_for(script.backend)?;
            self.connection_for(&script.connection)?;
        }
        Ok(())
    }

    /// One driver round-trip: connect, ensure the schema when applying
    /// forward, execute, close.
    async fn apply_payload(
        &self,
        script: &MigrationScript,
        schema: &str,
        payload: &str,
        ensure_schema: bool,
    ) -> Result<()> {
        let config = self.connection_for(&script.connection)?;
        let driver = self.driver_for(script.backend)?;
        let mut session = driver.connect(config).await?;

        let outcome = async {
            if ensure_schema && !schema.is_empty() && !session.schema_exists(schema).await? {
                session.create_schema(schema).await?;
            }
            session
                .execute_migration(&PreparedMigration {
                    migration_id: script.migration_id(),
                    payload: payload.to_string(),
                    schema: schema.to_string(),
                })
                .await
        }
        .await;

        session.close().await;
        outcome
    }

    fn record_for(
        &self,
        script: &MigrationScript,
        schemas: Vec<String>,
        status: MigrationStatus,
        error_message: Option<String>,
        ctx: &ExecutionContext,
    ) -> MigrationRecord {
        MigrationRecord {
            migration_id: script.migration_id(),
            schemas,
            version: script.version.clone(),
            connection: script.connection.clone(),
            backend: script.backend,
            status,
            error_message,
            executed_by: ctx.executed_by.clone(),
            execution_method: ctx.method,
            execution_context: ctx.context.clone(),
            applied_at: Some(Utc::now()),
        }
    }
}

/// An empty schema list means one application with the empty schema tag.
fn effective_schemas(schemas: &[String]) -> Vec<String> {
    if schemas.is_empty() {
        vec![String::new()]
    } else {
        schemas.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_schemas_defaults_to_empty_tag() {
        assert_eq!(effective_schemas(&[]), vec![String::new()]);
        assert_eq!(
            effective_schemas(&["a".to_string()]),
            vec!["a".to_string()]
        );
    }

    #[test]
    fn test_result_finish_rule() {
        let ok = MigrationResult {
            applied: vec!["x".to_string()],
            ..Default::default()
        }
        .finish();
        assert!(ok.success);

        let partial = MigrationResult {
            applied: vec!["x".to_string()],
            errors: vec!["y: boom".to_string()],
            ..Default::default()
        }
        .finish();
        assert!(!partial.success);
    }

    #[test]
    fn test_result_push_deduplicates() {
        let mut result = MigrationResult::default();
        result.push_applied("a");
        result.push_applied("a");
        result.push_skipped("b");
        result.push_skipped("b");
        assert_eq!(result.applied.len(), 1);
        assert_eq!(result.skipped.len(), 1);
    }

    #[test]
    fn test_empty_result_is_success() {
        let result = MigrationResult::empty();
        assert!(result.success);
        assert!(result.applied.is_empty());
        assert!(result.skipped.is_empty());
        assert!(result.errors.is_empty());
    }
}
