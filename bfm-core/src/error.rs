//! Error types for BFM operations.

use std::fmt;

use thiserror::Error;

/// Display adapter over `tokio_postgres::Error` that surfaces the server
/// diagnostics (message, detail, hint, position) its own `Display` hides.
pub struct PgDiagnostics<'a>(pub &'a tokio_postgres::Error);

impl fmt::Display for PgDiagnostics<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(db) = self.0.as_db_error() {
            write!(f, "{}", db.message())?;
            let notes = [("detail", db.detail()), ("hint", db.hint())];
            for (label, note) in notes {
                if let Some(note) = note {
                    write!(f, "; {}: {}", label, note)?;
                }
            }
            if let Some(position) = db.position() {
                write!(f, "; at {:?}", position)?;
            }
            return Ok(());
        }

        // No server diagnostics: render the whole cause chain instead.
        write!(f, "{}", self.0)?;
        let mut cause = std::error::Error::source(self.0);
        while let Some(c) = cause {
            write!(f, ": {}", c)?;
            cause = c.source();
        }
        if self.0.is_closed() {
            write!(f, " (connection closed mid-operation)")?;
        }
        Ok(())
    }
}

/// Boundary classification of an error.
///
/// The request surface maps each kind to a response status: Validation and
/// Precondition to 400, NotFound to 404, Operational to 500 (or 206 when the
/// batch made partial progress).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input: missing required field, unparseable id, bad config value.
    Validation,
    /// The referenced migration (or related record) does not exist.
    NotFound,
    /// The request is well-formed but the current state forbids it.
    Precondition,
    /// Driver, network, or state-store failure.
    Operational,
}

/// All error types that BFM operations can produce.
#[derive(Error, Debug)]
pub enum BfmError {
    /// Invalid or missing configuration (env vars, TOML parse errors, etc.).
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A state-store query or connection operation failed.
    #[error("Database error: {}", PgDiagnostics(.0))]
    DatabaseError(#[from] tokio_postgres::Error),

    /// Checking out a state-store connection from the pool failed.
    #[error("State store pool error: {0}")]
    PoolError(#[from] deadpool_postgres::PoolError),

    /// A filesystem I/O operation failed (reading script files, config, etc.).
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A script filename or header block could not be parsed.
    #[error("Script parse error: {0}")]
    ScriptParseError(String),

    /// The request itself is malformed.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// No migration with this id exists in the registry or state store.
    #[error("Migration {migration_id} not found")]
    MigrationNotFound { migration_id: String },

    /// Rollback was requested for a migration that is not currently applied.
    #[error("migration is not applied")]
    NotApplied {
        /// The (normalized) id the caller asked to roll back.
        migration_id: String,
    },

    /// The script has no down payload, so it cannot be rolled back.
    #[error("Migration {migration_id} has no down payload; rollback is unavailable")]
    RollbackUnavailable { migration_id: String },

    /// A circular dependency was detected among the selected scripts.
    #[error("Migration dependency cycle detected: {path}")]
    DependencyCycle { path: String },

    /// A script references a backend with no registered driver.
    #[error("Unknown backend '{name}'. Available: {available}")]
    UnknownBackend { name: String, available: String },

    /// A script references a connection with no configuration entry.
    #[error("Unknown connection '{name}'. Available: {available}")]
    UnknownConnection { name: String, available: String },

    /// An HTTP round-trip to a backend (GreptimeDB, etcd) failed.
    #[error("Backend request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// A backend accepted the request but reported an error.
    #[error("Backend {backend} error: {reason}")]
    BackendError { backend: String, reason: String },

    /// Publishing to or consuming from the offload queue failed.
    #[error("Queue error: {0}")]
    QueueError(String),

    /// The filesystem watcher could not be installed or failed mid-run.
    #[error("Watch error: {0}")]
    WatchError(#[from] notify::Error),

    /// The state-store connection was lost during an operation.
    #[error("Connection lost during {operation}: {detail}")]
    ConnectionLost { operation: String, detail: String },
}

impl BfmError {
    /// Project this error onto its boundary classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BfmError::Validation(_) | BfmError::ScriptParseError(_) => ErrorKind::Validation,
            BfmError::MigrationNotFound { .. } => ErrorKind::NotFound,
            BfmError::NotApplied { .. } | BfmError::RollbackUnavailable { .. } => {
                ErrorKind::Precondition
            }
            _ => ErrorKind::Operational,
        }
    }
}

/// Convenience type alias for `Result<T, BfmError>`.
pub type Result<T> = std::result::Result<T, BfmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_kind() {
        assert_eq!(
            BfmError::Validation("missing target".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            BfmError::ScriptParseError("bad header".into()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_not_found_kind() {
        let err = BfmError::MigrationNotFound {
            migration_id: "20240101120000_add_users_postgresql_main".into(),
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_precondition_kind() {
        let err = BfmError::NotApplied {
            migration_id: "20240101120000_add_users_postgresql_main".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(err.to_string(), "migration is not applied");
    }

    #[test]
    fn test_operational_kind() {
        let err = BfmError::BackendError {
            backend: "etcd".into(),
            reason: "gateway timeout".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Operational);
        let err = BfmError::QueueError("producer closed".into());
        assert_eq!(err.kind(), ErrorKind::Operational);
    }

    #[test]
    fn test_cycle_message_names_path() {
        let err = BfmError::DependencyCycle {
            path: "a -> b -> a".into(),
        };
        assert!(err.to_string().contains("a -> b -> a"));
    }
}
