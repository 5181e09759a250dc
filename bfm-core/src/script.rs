//! Core migration entities: scripts, targets, statuses, and the canonical
//! migration-id normalization every consumer of externally-supplied ids
//! goes through.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BfmError, Result};

/// The kind of target data store a script applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Postgresql,
    Greptimedb,
    Etcd,
}

impl Backend {
    /// Canonical lowercase tag used in ids, filenames, and state rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Postgresql => "postgresql",
            Backend::Greptimedb => "greptimedb",
            Backend::Etcd => "etcd",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Backend {
    type Err = BfmError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(Backend::Postgresql),
            "greptimedb" | "greptime" => Ok(Backend::Greptimedb),
            "etcd" => Ok(Backend::Etcd),
            other => Err(BfmError::Validation(format!(
                "Unknown backend '{}'. Use 'postgresql', 'greptimedb', or 'etcd'.",
                other
            ))),
        }
    }
}

/// State of a migration as summarized in `migrations_list`, or of a
/// (migration, schema) pair as recorded in `migrations_executions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Applied,
    Failed,
    RolledBack,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Applied => "applied",
            MigrationStatus::Failed => "failed",
            MigrationStatus::RolledBack => "rolled_back",
        }
    }

    /// Parse a stored status, accepting the legacy `success` spelling.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MigrationStatus::Pending),
            "applied" | "success" => Ok(MigrationStatus::Applied),
            "failed" => Ok(MigrationStatus::Failed),
            "rolled_back" => Ok(MigrationStatus::RolledBack),
            other => Err(BfmError::Validation(format!(
                "Unknown migration status '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an execution was initiated, recorded in `migrations_history`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMethod {
    Manual,
    Api,
    Cli,
    Worker,
}

impl ExecutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMethod::Manual => "manual",
            ExecutionMethod::Api => "api",
            ExecutionMethod::Cli => "cli",
            ExecutionMethod::Worker => "worker",
        }
    }
}

impl fmt::Display for ExecutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a structured dependency points at a migration by name or version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyTargetType {
    Name,
    Version,
}

/// A dependency on a migration that may live on another connection or schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredDependency {
    /// Connection the dependency lives on.
    pub connection: String,
    /// Schemas the dependency must be applied to (empty means any).
    #[serde(default)]
    pub schema: Vec<String>,
    /// The migration name or version being depended on.
    pub target: String,
    /// How to interpret `target`.
    pub target_type: DependencyTargetType,
    /// Table that must exist before this migration runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_table: Option<String>,
    /// Schema that must exist before this migration runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_schema: Option<String>,
}

/// A versioned change script loaded from disk, immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationScript {
    /// Fixed-width lexicographically sortable timestamp, canonically
    /// 14 digits `YYYYMMDDHHMMSS`.
    pub version: String,
    /// Snake-case identifier from the filename.
    pub name: String,
    /// Target store kind.
    pub backend: Backend,
    /// Logical connection name this script applies to.
    pub connection: String,
    /// Optional single schema tag; empty means connection default.
    #[serde(default)]
    pub schema: String,
    /// Forward payload: SQL for relational/time-series stores, JSON for etcd.
    pub up_payload: String,
    /// Reverse payload; empty disables rollback for this script.
    #[serde(default)]
    pub down_payload: String,
    /// Filename the up payload was loaded from.
    #[serde(default)]
    pub up_filename: String,
    /// Filename the down payload was loaded from, if any.
    #[serde(default)]
    pub down_filename: String,
    /// Simple name references to other scripts on the same connection.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Cross-connection/schema dependency declarations.
    #[serde(default)]
    pub structured_dependencies: Vec<StructuredDependency>,
    /// CRC32 of up+down payloads; drives reindex change detection.
    #[serde(default)]
    pub checksum: u32,
}

impl MigrationScript {
    /// Canonical migration-id: `{version}_{name}_{backend}_{connection}`.
    pub fn migration_id(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.version, self.name, self.backend, self.connection
        )
    }

    /// Registry key tuple; two scripts with the same key are the same script.
    pub fn key(&self) -> (String, String, Backend, String) {
        (
            self.version.clone(),
            self.name.clone(),
            self.backend,
            self.connection.clone(),
        )
    }

    /// Whether this script can be rolled back.
    pub fn has_down(&self) -> bool {
        !self.down_payload.trim().is_empty()
    }

    /// CRC32 over both payloads.
    pub fn compute_checksum(up: &str, down: &str) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(up.as_bytes());
        hasher.update(down.as_bytes());
        hasher.finalize()
    }
}

/// Validate a script version: 10-20 ASCII digits, canonically 14.
pub fn validate_version(version: &str) -> Result<()> {
    if is_version_component(version) {
        Ok(())
    } else {
        Err(BfmError::ScriptParseError(format!(
            "Invalid version '{}': expected 10-20 decimal digits (canonically YYYYMMDDHHMMSS)",
            version
        )))
    }
}

/// A component is a version iff it is 10-20 characters, all decimal digits.
pub fn is_version_component(s: &str) -> bool {
    (10..=20).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit())
}

/// A migration-id reduced to its canonical base form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedId {
    /// `{version}_{name}_{backend}_{connection}` with any schema prefix and
    /// `_rollback` suffix stripped.
    pub base: String,
    /// Whether the input carried the legacy `_rollback` suffix.
    pub is_rollback: bool,
}

/// Normalize an externally-supplied migration-id.
///
/// Accepts the canonical form, the schema-prefixed form
/// `{schema}_{version}_...` (the leading component is stripped iff it is not
/// a version), and the legacy rollback form `{base}_rollback`.
pub fn normalize_migration_id(raw: &str) -> NormalizedId {
    let trimmed = raw.trim();
    let (without_suffix, is_rollback) = match trimmed.strip_suffix("_rollback") {
        Some(base) => (base, true),
        None => (trimmed, false),
    };

    let base = match without_suffix.split_once('_') {
        Some((first, rest)) if !is_version_component(first) && !rest.is_empty() => {
            // Leading component is a schema tag only when a version follows it.
            match rest.split_once('_') {
                Some((second, _)) if is_version_component(second) => rest.to_string(),
                _ => without_suffix.to_string(),
            }
        }
        _ => without_suffix.to_string(),
    };

    NormalizedId { base, is_rollback }
}

/// A filter narrowing the set of migrations a request operates on.
///
/// Empty fields match everything; a populated field must match exactly
/// (or, for `tables`, occur in the script payload).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<String>,
}

impl MigrationTarget {
    /// True when no field narrows the selection.
    pub fn is_empty(&self) -> bool {
        self.backend.is_none()
            && self.connection.is_none()
            && self.schema.is_none()
            && self.version.is_none()
            && self.tables.is_empty()
    }

    /// Whether a script passes this filter.
    pub fn matches(&self, script: &MigrationScript) -> bool {
        if let Some(backend) = self.backend {
            if script.backend != backend {
                return false;
            }
        }
        if let Some(ref connection) = self.connection {
            if &script.connection != connection {
                return false;
            }
        }
        if let Some(ref schema) = self.schema {
            if !schema.is_empty() && &script.schema != schema {
                return false;
            }
        }
        if let Some(ref version) = self.version {
            if &script.version != version {
                return false;
            }
        }
        if !self.tables.is_empty() {
            let found = self
                .tables
                .iter()
                .any(|t| script.up_payload.contains(t.as_str()));
            if !found {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(version: &str, name: &str, backend: Backend, connection: &str) -> MigrationScript {
        MigrationScript {
            version: version.to_string(),
            name: name.to_string(),
            backend,
            connection: connection.to_string(),
            schema: String::new(),
            up_payload: "CREATE TABLE test (id INT);".to_string(),
            down_payload: "DROP TABLE test;".to_string(),
            up_filename: format!("{}_{}.up.sql", version, name),
            down_filename: format!("{}_{}.down.sql", version, name),
            dependencies: vec![],
            structured_dependencies: vec![],
            checksum: 0,
        }
    }

    #[test]
    fn test_migration_id_format() {
        let s = script("20250101000000", "test_migration", Backend::Postgresql, "test");
        assert_eq!(
            s.migration_id(),
            "20250101000000_test_migration_postgresql_test"
        );
    }

    #[test]
    fn test_normalize_canonical_is_untouched() {
        let n = normalize_migration_id("20240101120000_add_users_postgresql_main");
        assert_eq!(n.base, "20240101120000_add_users_postgresql_main");
        assert!(!n.is_rollback);
    }

    #[test]
    fn test_normalize_strips_schema_prefix() {
        let n = normalize_migration_id("public_20240101120000_add_users_postgresql_main");
        assert_eq!(n.base, "20240101120000_add_users_postgresql_main");
        assert!(!n.is_rollback);
    }

    #[test]
    fn test_normalize_strips_rollback_suffix() {
        let n = normalize_migration_id("20240101120000_add_users_postgresql_main_rollback");
        assert_eq!(n.base, "20240101120000_add_users_postgresql_main");
        assert!(n.is_rollback);
    }

    #[test]
    fn test_normalize_strips_both() {
        let n = normalize_migration_id("public_20240101120000_add_users_postgresql_main_rollback");
        assert_eq!(n.base, "20240101120000_add_users_postgresql_main");
        assert!(n.is_rollback);
    }

    #[test]
    fn test_normalize_keeps_non_schema_prefix() {
        // "add" is followed by "users", not a version, so nothing is stripped.
        let n = normalize_migration_id("add_users_postgresql_main");
        assert_eq!(n.base, "add_users_postgresql_main");
    }

    #[test]
    fn test_normalize_version_first_short_id() {
        let n = normalize_migration_id("20240101120000_x");
        assert_eq!(n.base, "20240101120000_x");
    }

    #[test]
    fn test_is_version_component_bounds() {
        assert!(is_version_component("20240101120000"));
        assert!(is_version_component("1234567890")); // 10 digits
        assert!(!is_version_component("123456789")); // 9 digits
        assert!(!is_version_component("123456789012345678901")); // 21 digits
        assert!(!is_version_component("2024010112000a"));
    }

    #[test]
    fn test_validate_version() {
        assert!(validate_version("20250101000000").is_ok());
        assert!(validate_version("v20250101").is_err());
        assert!(validate_version("").is_err());
    }

    #[test]
    fn test_backend_round_trip() {
        for (raw, expect) in [
            ("postgresql", Backend::Postgresql),
            ("greptimedb", Backend::Greptimedb),
            ("etcd", Backend::Etcd),
        ] {
            let parsed: Backend = raw.parse().unwrap();
            assert_eq!(parsed, expect);
            assert_eq!(parsed.as_str(), raw);
        }
        assert!("mysql".parse::<Backend>().is_err());
    }

    #[test]
    fn test_status_parse_accepts_legacy_success() {
        assert_eq!(
            MigrationStatus::parse("success").unwrap(),
            MigrationStatus::Applied
        );
        assert_eq!(
            MigrationStatus::parse("rolled_back").unwrap(),
            MigrationStatus::RolledBack
        );
        assert!(MigrationStatus::parse("unknown").is_err());
    }

    #[test]
    fn test_target_empty_matches_all() {
        let target = MigrationTarget::default();
        let s = script("20250101000000", "a", Backend::Etcd, "kv");
        assert!(target.is_empty());
        assert!(target.matches(&s));
    }

    #[test]
    fn test_target_filters_by_backend_and_connection() {
        let target = MigrationTarget {
            backend: Some(Backend::Postgresql),
            connection: Some("main".to_string()),
            ..Default::default()
        };
        assert!(target.matches(&script("20250101000000", "a", Backend::Postgresql, "main")));
        assert!(!target.matches(&script("20250101000000", "a", Backend::Postgresql, "other")));
        assert!(!target.matches(&script("20250101000000", "a", Backend::Etcd, "main")));
    }

    #[test]
    fn test_target_table_filter_scans_payload() {
        let target = MigrationTarget {
            tables: vec!["test".to_string()],
            ..Default::default()
        };
        assert!(target.matches(&script("20250101000000", "a", Backend::Postgresql, "main")));
        let target = MigrationTarget {
            tables: vec!["orders".to_string()],
            ..Default::default()
        };
        assert!(!target.matches(&script("20250101000000", "a", Backend::Postgresql, "main")));
    }

    #[test]
    fn test_checksum_varies_with_payload() {
        let a = MigrationScript::compute_checksum("CREATE TABLE a;", "DROP TABLE a;");
        let b = MigrationScript::compute_checksum("CREATE TABLE b;", "DROP TABLE b;");
        assert_ne!(a, b);
        assert_eq!(a, MigrationScript::compute_checksum("CREATE TABLE a;", "DROP TABLE a;"));
    }

    #[test]
    fn test_structured_dependency_serde() {
        let json = r#"{"connection":"main","schema":["public"],"target":"add_users","target_type":"name","requires_table":"users"}"#;
        let dep: StructuredDependency = serde_json::from_str(json).unwrap();
        assert_eq!(dep.connection, "main");
        assert_eq!(dep.target_type, DependencyTargetType::Name);
        assert_eq!(dep.requires_table.as_deref(), Some("users"));
        assert!(dep.requires_schema.is_none());
    }
}
