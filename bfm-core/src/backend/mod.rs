//! Uniform driver contract over heterogeneous data stores.
//!
//! Each driver exposes connect / execute / health-check / close. Connection
//! lifetime is one logical operation: the executor opens a session around
//! each migration application and closes it afterwards. Sessions are used
//! serially; drivers must tolerate the same config being connected from
//! multiple tasks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::script::Backend;

pub mod etcd;
pub mod greptime;
pub mod postgres;

/// A payload prepared for a single driver call. The executor selects the
/// up or down payload before constructing this; the driver never sees the
/// direction.
#[derive(Debug, Clone)]
pub struct PreparedMigration {
    /// Canonical migration-id, for logging and error context.
    pub migration_id: String,
    /// The direction-selected opaque payload (SQL or JSON operations).
    pub payload: String,
    /// Schema tag the payload applies to; empty means connection default.
    pub schema: String,
}

/// An open session against one configured connection.
#[async_trait]
pub trait BackendSession: Send {
    /// Apply the prepared payload. Relational and time-series drivers wrap
    /// SQL in a single transaction; the key-value driver applies each JSON
    /// operation atomically per key.
    async fn execute_migration(&mut self, prepared: &PreparedMigration) -> Result<()>;

    /// Cheap liveness probe against the store.
    async fn health_check(&mut self) -> Result<()>;

    /// Create the named schema if the store distinguishes schemas.
    async fn create_schema(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }

    /// Whether the named schema exists. Stores without a schema concept
    /// (key prefixes) report true.
    async fn schema_exists(&mut self, _name: &str) -> Result<bool> {
        Ok(true)
    }

    /// Release the session. Drivers holding nothing beyond dropped handles
    /// may leave this as the default.
    async fn close(&mut self) {}
}

/// Factory for sessions against one kind of store.
#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// The store kind this driver serves.
    fn backend(&self) -> Backend;

    /// Open an owned session for the given connection.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn BackendSession>>;
}

/// The built-in driver set, keyed by backend tag.
pub fn default_driver_map() -> HashMap<Backend, Arc<dyn BackendDriver>> {
    let mut map: HashMap<Backend, Arc<dyn BackendDriver>> = HashMap::new();
    map.insert(
        Backend::Postgresql,
        Arc::new(postgres::PostgresDriver::new()),
    );
    map.insert(
        Backend::Greptimedb,
        Arc::new(greptime::GreptimeDriver::new()),
    );
    map.insert(Backend::Etcd, Arc::new(etcd::EtcdDriver::new()));
    map
}
