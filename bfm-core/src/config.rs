//! Configuration loading and resolution.
//!
//! All runtime knobs are environment-driven (`BFM_*` variables); the fleet
//! of backend connections is declared in an optional TOML file referenced by
//! `BFM_CONNECTIONS_FILE`. Resolution order is env > file > defaults.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{BfmError, Result};
use crate::script::Backend;

/// SSL/TLS connection mode for PostgreSQL-speaking stores.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SslMode {
    /// Never use TLS.
    Disable,
    /// Try TLS first, fall back to plaintext.
    #[default]
    Prefer,
    /// Require TLS; fail if the handshake fails.
    Require,
}

impl FromStr for SslMode {
    type Err = BfmError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disable" | "disabled" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" | "required" => Ok(SslMode::Require),
            _ => Err(BfmError::ConfigError(format!(
                "Invalid SSL mode '{}'. Use 'disable', 'prefer', or 'require'.",
                s
            ))),
        }
    }
}

/// A named, configured endpoint of a backend.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Kind of store this connection points at.
    pub backend: Backend,
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Database name (ignored by etcd).
    #[serde(default)]
    pub database: String,
    /// User for authentication; empty disables auth.
    #[serde(default)]
    pub username: String,
    /// Password for authentication.
    #[serde(default)]
    pub password: String,
    /// Backend-specific settings (ssl_mode, timeouts, key prefixes, ...).
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl ConnectionConfig {
    /// Look up an extra setting parsed into `T`, falling back to `default`.
    pub fn extra_parsed<T: FromStr>(&self, key: &str, default: T) -> T {
        self.extra
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("backend", &self.backend)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Connection settings for the relational state store.
#[derive(Clone)]
pub struct StateStoreConfig {
    /// State-store hostname.
    pub host: String,
    /// State-store port.
    pub port: u16,
    /// Database holding the state tables.
    pub database: String,
    /// User for authentication.
    pub username: String,
    /// Password for authentication.
    pub password: String,
    /// Schema the four state tables live in.
    pub schema: String,
    /// SSL/TLS mode.
    pub ssl_mode: SslMode,
    /// Maximum open connections in the pool.
    pub max_open: usize,
    /// Idle connections kept warm.
    pub max_idle: usize,
    /// Maximum connection lifetime in seconds.
    pub conn_lifetime_secs: u64,
    /// Number of connect retries with exponential backoff.
    pub connect_retries: u32,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "bfm".to_string(),
            username: "bfm".to_string(),
            password: String::new(),
            schema: "bfm".to_string(),
            ssl_mode: SslMode::Prefer,
            max_open: 5,
            max_idle: 2,
            conn_lifetime_secs: 300,
            connect_retries: 0,
        }
    }
}

impl fmt::Debug for StateStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_open", &self.max_open)
            .field("max_idle", &self.max_idle)
            .field("conn_lifetime_secs", &self.conn_lifetime_secs)
            .field("connect_retries", &self.connect_retries)
            .finish()
    }
}

/// Script corpus settings.
#[derive(Debug, Clone)]
pub struct ScriptSettings {
    /// Root directory scanned for script pairs.
    pub root: PathBuf,
    /// Whether the filesystem watcher runs.
    pub watch: bool,
    /// Periodic reindex interval in seconds; 0 disables the ticker.
    pub reindex_interval_secs: u64,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("migrations"),
            watch: false,
            reindex_interval_secs: 0,
        }
    }
}

/// Which queue transport offloads execution, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueKind {
    /// Execute inline; no offload.
    #[default]
    None,
    /// In-process channel transport (worker runs in the same process).
    InProcess,
    /// Kafka transport (attached via an external producer/consumer plugin).
    Kafka,
    /// Pulsar transport (attached via an external producer/consumer plugin).
    Pulsar,
}

impl FromStr for QueueKind {
    type Err = BfmError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "none" => Ok(QueueKind::None),
            "inprocess" | "in-process" => Ok(QueueKind::InProcess),
            "kafka" => Ok(QueueKind::Kafka),
            "pulsar" => Ok(QueueKind::Pulsar),
            other => Err(BfmError::ConfigError(format!(
                "Invalid queue kind '{}'. Use 'none', 'inprocess', 'kafka', or 'pulsar'.",
                other
            ))),
        }
    }
}

/// Queue offload settings.
#[derive(Debug, Clone, Default)]
pub struct QueueSettings {
    /// Transport selection.
    pub kind: QueueKind,
    /// Broker endpoints, comma-separated in the environment.
    pub endpoints: Vec<String>,
    /// Topic the up/down envelopes are published on.
    pub topic: String,
}

/// HTTP listener and auth settings.
#[derive(Clone)]
pub struct ServerConfig {
    /// Port the HTTP surface listens on.
    pub port: u16,
    /// Bearer token callers must present.
    pub api_token: String,
    /// Log level passed to the logger at startup.
    pub log_level: String,
    /// Log format: "plain" or "json".
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            api_token: String::new(),
            log_level: "info".to_string(),
            log_format: "plain".to_string(),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("port", &self.port)
            .field("api_token", &"[REDACTED]")
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .finish()
    }
}

/// Top-level configuration for BFM.
#[derive(Debug, Clone, Default)]
pub struct BfmConfig {
    /// State-store connection and pool sizing.
    pub state: StateStoreConfig,
    /// Script corpus location and watcher settings.
    pub scripts: ScriptSettings,
    /// HTTP surface settings.
    pub server: ServerConfig,
    /// Queue offload settings.
    pub queue: QueueSettings,
    /// Named backend connections scripts refer to.
    pub connections: HashMap<String, ConnectionConfig>,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env_string(key) {
        Some(raw) => raw.parse().map_err(|_| {
            BfmError::ConfigError(format!("Invalid value '{}' for {}", raw, key))
        }),
        None => Ok(default),
    }
}

/// TOML shape of the connections file.
#[derive(Debug, Deserialize)]
struct ConnectionsFile {
    #[serde(default)]
    connections: HashMap<String, ConnectionConfig>,
}

impl BfmConfig {
    /// Load configuration from the environment and the optional
    /// connections file.
    pub fn from_env() -> Result<Self> {
        let mut config = BfmConfig::default();

        if let Some(host) = env_string("BFM_STATE_HOST") {
            config.state.host = host;
        }
        config.state.port = env_parse("BFM_STATE_PORT", config.state.port)?;
        if let Some(database) = env_string("BFM_STATE_DATABASE") {
            config.state.database = database;
        }
        if let Some(username) = env_string("BFM_STATE_USER") {
            config.state.username = username;
        }
        if let Ok(password) = std::env::var("BFM_STATE_PASSWORD") {
            config.state.password = password;
        }
        if let Some(schema) = env_string("BFM_STATE_SCHEMA") {
            config.state.schema = schema;
        }
        config.state.ssl_mode = env_parse("BFM_STATE_SSL_MODE", config.state.ssl_mode)?;
        config.state.max_open = env_parse("BFM_STATE_MAX_OPEN", config.state.max_open)?;
        config.state.max_idle = env_parse("BFM_STATE_MAX_IDLE", config.state.max_idle)?;
        config.state.conn_lifetime_secs =
            env_parse("BFM_STATE_CONN_LIFETIME_SECS", config.state.conn_lifetime_secs)?;
        config.state.connect_retries =
            env_parse("BFM_STATE_CONNECT_RETRIES", config.state.connect_retries)?;

        if let Some(root) = env_string("BFM_SCRIPTS_PATH") {
            config.scripts.root = PathBuf::from(root);
        }
        config.scripts.watch = env_parse("BFM_WATCH", config.scripts.watch)?;
        config.scripts.reindex_interval_secs = env_parse(
            "BFM_REINDEX_INTERVAL_SECS",
            config.scripts.reindex_interval_secs,
        )?;

        config.server.port = env_parse("BFM_HTTP_PORT", config.server.port)?;
        if let Some(token) = env_string("BFM_API_TOKEN") {
            config.server.api_token = token;
        }
        if let Some(level) = env_string("BFM_LOG_LEVEL") {
            config.server.log_level = level;
        }
        if let Some(format) = env_string("BFM_LOG_FORMAT") {
            config.server.log_format = format;
        }

        config.queue.kind = env_parse("BFM_QUEUE", config.queue.kind)?;
        if let Some(endpoints) = env_string("BFM_QUEUE_ENDPOINTS") {
            config.queue.endpoints = endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(topic) = env_string("BFM_QUEUE_TOPIC") {
            config.queue.topic = topic;
        }

        if let Some(path) = env_string("BFM_CONNECTIONS_FILE") {
            config.connections = load_connections_file(&PathBuf::from(path))?;
        }

        Ok(config)
    }
}

/// Parse the TOML connections file into the connection map.
pub fn load_connections_file(path: &std::path::Path) -> Result<HashMap<String, ConnectionConfig>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        BfmError::ConfigError(format!(
            "Cannot read connections file {}: {}",
            path.display(),
            e
        ))
    })?;
    let parsed: ConnectionsFile = toml::from_str(&raw).map_err(|e| {
        BfmError::ConfigError(format!(
            "Invalid connections file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(parsed.connections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_parsing() {
        assert_eq!("disable".parse::<SslMode>().unwrap(), SslMode::Disable);
        assert_eq!("Prefer".parse::<SslMode>().unwrap(), SslMode::Prefer);
        assert_eq!("REQUIRED".parse::<SslMode>().unwrap(), SslMode::Require);
        assert!("tls".parse::<SslMode>().is_err());
    }

    #[test]
    fn test_queue_kind_parsing() {
        assert_eq!("none".parse::<QueueKind>().unwrap(), QueueKind::None);
        assert_eq!("".parse::<QueueKind>().unwrap(), QueueKind::None);
        assert_eq!(
            "inprocess".parse::<QueueKind>().unwrap(),
            QueueKind::InProcess
        );
        assert_eq!("kafka".parse::<QueueKind>().unwrap(), QueueKind::Kafka);
        assert_eq!("Pulsar".parse::<QueueKind>().unwrap(), QueueKind::Pulsar);
        assert!("rabbitmq".parse::<QueueKind>().is_err());
    }

    #[test]
    fn test_state_defaults_match_pool_contract() {
        let cfg = StateStoreConfig::default();
        assert_eq!(cfg.max_open, 5);
        assert_eq!(cfg.max_idle, 2);
        assert_eq!(cfg.conn_lifetime_secs, 300);
    }

    #[test]
    fn test_debug_redacts_password() {
        let cfg = StateStoreConfig {
            password: "hunter2".to_string(),
            ..Default::default()
        };
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn test_connections_file_parsing() {
        let raw = r#"
[connections.main]
backend = "postgresql"
host = "db.internal"
port = 5432
database = "app"
username = "app"
password = "secret"

[connections.main.extra]
ssl_mode = "require"

[connections.kv]
backend = "etcd"
host = "etcd.internal"
port = 2379
"#;
        let parsed: ConnectionsFile = toml::from_str(raw).unwrap();
        let main = &parsed.connections["main"];
        assert_eq!(main.backend, Backend::Postgresql);
        assert_eq!(main.extra.get("ssl_mode").unwrap(), "require");
        let kv = &parsed.connections["kv"];
        assert_eq!(kv.backend, Backend::Etcd);
        assert!(kv.database.is_empty());
    }

    #[test]
    fn test_extra_parsed_fallback() {
        let cfg = ConnectionConfig {
            backend: Backend::Postgresql,
            host: "h".into(),
            port: 5432,
            database: "d".into(),
            username: String::new(),
            password: String::new(),
            extra: HashMap::from([("connect_timeout_secs".to_string(), "10".to_string())]),
        };
        assert_eq!(cfg.extra_parsed("connect_timeout_secs", 30u32), 10);
        assert_eq!(cfg.extra_parsed("missing", 30u32), 30);
    }
}
