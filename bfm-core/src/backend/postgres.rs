//! PostgreSQL driver: TLS-capable dialing with bounded retries, and
//! atomic payload execution.

use async_trait::async_trait;
use tokio_postgres::Client;

use crate::config::{ConnectionConfig, SslMode};
use crate::error::{BfmError, Result};

use super::{BackendDriver, BackendSession, PreparedMigration};

/// Quote a SQL identifier, doubling embedded double-quotes.
pub fn quote_ident(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for ch in name.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Reject identifiers outside `[a-zA-Z0-9_]` before they reach any SQL
/// string, quoting notwithstanding.
pub fn validate_identifier(name: &str) -> Result<()> {
    let safe = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if safe {
        Ok(())
    } else {
        Err(BfmError::Validation(format!(
            "'{}' is not a safe SQL identifier (letters, digits, and underscores only)",
            name
        )))
    }
}

/// rustls connector over the Mozilla CA bundle, ring provider.
pub(crate) fn tls_connector() -> tokio_postgres_rustls::MakeRustlsConnect {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(std::sync::Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .expect("ring provider supports the default protocol versions")
    .with_root_certificates(roots)
    .with_no_client_auth();
    tokio_postgres_rustls::MakeRustlsConnect::new(config)
}

/// SQLSTATE class 28 (invalid authorization / password). Retrying these
/// cannot succeed.
fn credentials_rejected(e: &tokio_postgres::Error) -> bool {
    e.as_db_error()
        .map(|db| db.code().code().starts_with("28"))
        .unwrap_or(false)
}

/// Render a key=value connection string from the config parts.
///
/// Appends TCP keepalive parameters when `keepalive_secs` is nonzero.
pub fn connection_string(config: &ConnectionConfig, keepalive_secs: u32) -> String {
    let mut parts = vec![
        format!("host={}", config.host),
        format!("port={}", config.port),
    ];
    if !config.database.is_empty() {
        parts.push(format!("dbname={}", config.database));
    }
    if !config.username.is_empty() {
        parts.push(format!("user={}", config.username));
    }
    if !config.password.is_empty() {
        parts.push(format!("password={}", config.password));
    }
    if keepalive_secs > 0 {
        parts.push("keepalives=1".to_string());
        parts.push(format!("keepalives_idle={}", keepalive_secs));
    }
    parts.join(" ")
}

/// Detach the connection's driver future onto the runtime; the client half
/// is unusable once this future stops.
fn keep_driving<D>(driver: D)
where
    D: std::future::Future<Output = std::result::Result<(), tokio_postgres::Error>>
        + Send
        + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = driver.await {
            log::warn!("postgres connection task ended with error: {}", e);
        }
    });
}

/// One connection target plus its negotiation policy.
struct Dialer {
    conn_string: String,
    ssl_mode: SslMode,
    timeout: Option<std::time::Duration>,
}

impl Dialer {
    async fn dial_plain(&self) -> std::result::Result<Client, tokio_postgres::Error> {
        let (client, driver) =
            tokio_postgres::connect(&self.conn_string, tokio_postgres::NoTls).await?;
        keep_driving(driver);
        Ok(client)
    }

    async fn dial_tls(&self) -> std::result::Result<Client, tokio_postgres::Error> {
        let (client, driver) =
            tokio_postgres::connect(&self.conn_string, tls_connector()).await?;
        keep_driving(driver);
        Ok(client)
    }

    async fn negotiate(&self) -> std::result::Result<Client, tokio_postgres::Error> {
        match self.ssl_mode {
            SslMode::Disable => self.dial_plain().await,
            SslMode::Require => self.dial_tls().await,
            SslMode::Prefer => match self.dial_tls().await {
                Ok(client) => Ok(client),
                Err(e) => {
                    log::debug!("TLS handshake declined ({}); retrying in plaintext", e);
                    self.dial_plain().await
                }
            },
        }
    }

    /// One attempt, bounded by the configured timeout.
    async fn attempt(&self) -> Result<Client> {
        let dial = self.negotiate();
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, dial).await {
                Ok(outcome) => outcome.map_err(Into::into),
                Err(_) => Err(BfmError::ConnectionLost {
                    operation: "connect".to_string(),
                    detail: format!("no response within {:?}", limit),
                }),
            },
            None => dial.await.map_err(Into::into),
        }
    }
}

/// Wait before retry `attempt`: 500ms per attempt, capped at 10s, with up
/// to +50% random jitter.
fn retry_delay(attempt: u32) -> std::time::Duration {
    let base = std::time::Duration::from_millis(500)
        .saturating_mul(attempt)
        .min(std::time::Duration::from_secs(10));
    base + base.mul_f64(fastrand::f64() * 0.5)
}

/// Connect with up to `retries` additional attempts. Credential rejections
/// abort immediately.
pub async fn connect_with_retries(
    conn_string: &str,
    ssl_mode: &SslMode,
    retries: u32,
    connect_timeout_secs: u32,
) -> Result<Client> {
    let dialer = Dialer {
        conn_string: conn_string.to_string(),
        ssl_mode: ssl_mode.clone(),
        timeout: (connect_timeout_secs > 0)
            .then(|| std::time::Duration::from_secs(connect_timeout_secs as u64)),
    };

    let mut attempt = 0u32;
    loop {
        match dialer.attempt().await {
            Ok(client) => {
                if attempt > 0 {
                    log::info!("postgres connection established on attempt {}", attempt + 1);
                }
                return Ok(client);
            }
            Err(e) => {
                let fatal = matches!(&e, BfmError::DatabaseError(pg) if credentials_rejected(pg));
                if fatal {
                    log::error!("postgres rejected the credentials; giving up: {}", e);
                    return Err(e);
                }
                if attempt >= retries {
                    return Err(e);
                }
                attempt += 1;
                let wait = retry_delay(attempt);
                log::warn!(
                    "postgres dial failed ({}); attempt {} of {} in {:?}",
                    e,
                    attempt + 1,
                    retries + 1,
                    wait
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Run a SQL payload atomically: SQL-level BEGIN, the payload, then COMMIT,
/// or ROLLBACK when any statement fails.
pub async fn run_in_transaction(client: &Client, sql: &str) -> Result<()> {
    client.batch_execute("BEGIN").await?;
    let outcome = client.batch_execute(sql).await;
    let finish = if outcome.is_ok() { "COMMIT" } else { "ROLLBACK" };
    match (outcome, client.batch_execute(finish).await) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(commit_err)) => Err(commit_err.into()),
        (Err(exec_err), finish_outcome) => {
            if let Err(rollback_err) = finish_outcome {
                log::warn!(
                    "rollback after failed statement also failed: {}",
                    rollback_err
                );
            }
            Err(exec_err.into())
        }
    }
}

/// Driver for PostgreSQL connections.
#[derive(Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BackendDriver for PostgresDriver {
    fn backend(&self) -> crate::script::Backend {
        crate::script::Backend::Postgresql
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn BackendSession>> {
        let ssl_mode: SslMode = config
            .extra
            .get("ssl_mode")
            .map(|raw| raw.parse())
            .transpose()?
            .unwrap_or_default();
        let retries = config.extra_parsed("connect_retries", 0u32);
        let connect_timeout_secs = config.extra_parsed("connect_timeout_secs", 30u32);
        let keepalive_secs = config.extra_parsed("keepalive_secs", 120u32);

        let conn_string = connection_string(config, keepalive_secs);
        let client =
            connect_with_retries(&conn_string, &ssl_mode, retries, connect_timeout_secs).await?;
        Ok(Box::new(PostgresSession { client }))
    }
}

/// One open PostgreSQL session.
pub struct PostgresSession {
    client: Client,
}

#[async_trait]
impl BackendSession for PostgresSession {
    async fn execute_migration(&mut self, prepared: &PreparedMigration) -> Result<()> {
        let sql = if prepared.schema.is_empty() {
            prepared.payload.clone()
        } else {
            validate_identifier(&prepared.schema)?;
            // SET LOCAL scopes the search_path to the wrapping transaction.
            format!(
                "SET LOCAL search_path TO {}, public;\n{}",
                quote_ident(&prepared.schema),
                prepared.payload
            )
        };
        run_in_transaction(&self.client, &sql).await
    }

    async fn health_check(&mut self) -> Result<()> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| BfmError::ConnectionLost {
                operation: "health check".to_string(),
                detail: e.to_string(),
            })?;
        Ok(())
    }

    async fn create_schema(&mut self, name: &str) -> Result<()> {
        validate_identifier(name)?;
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(name));
        self.client.batch_execute(&sql).await?;
        Ok(())
    }

    async fn schema_exists(&mut self, name: &str) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                    SELECT FROM information_schema.schemata WHERE schema_name = $1
                )",
                &[&name],
            )
            .await?;
        Ok(row.get::<_, bool>(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Backend;
    use std::collections::HashMap;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            backend: Backend::Postgresql,
            host: "localhost".to_string(),
            port: 5432,
            database: "app".to_string(),
            username: "app".to_string(),
            password: "secret".to_string(),
            extra: HashMap::new(),
        }
    }

    #[test]
    fn test_connection_string_parts() {
        let s = connection_string(&config(), 0);
        assert_eq!(
            s,
            "host=localhost port=5432 dbname=app user=app password=secret"
        );
    }

    #[test]
    fn test_connection_string_keepalive() {
        let s = connection_string(&config(), 90);
        assert!(s.ends_with("keepalives=1 keepalives_idle=90"));
    }

    #[test]
    fn test_connection_string_omits_empty_fields() {
        let mut cfg = config();
        cfg.username = String::new();
        cfg.password = String::new();
        let s = connection_string(&cfg, 0);
        assert_eq!(s, "host=localhost port=5432 dbname=app");
    }

    #[test]
    fn test_quote_ident_simple() {
        assert_eq!(quote_ident("users"), "\"users\"");
    }

    #[test]
    fn test_quote_ident_embedded_quotes() {
        assert_eq!(quote_ident("my\"schema"), "\"my\"\"schema\"");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("analytics").is_ok());
        assert!(validate_identifier("a_1").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("a-b").is_err());
        assert!(validate_identifier("a;drop").is_err());
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        // Jitter adds at most 50%, so bounds are checkable per attempt.
        let first = retry_delay(1);
        assert!(first >= std::time::Duration::from_millis(500));
        assert!(first <= std::time::Duration::from_millis(750));

        let capped = retry_delay(1000);
        assert!(capped >= std::time::Duration::from_secs(10));
        assert!(capped <= std::time::Duration::from_secs(15));
    }
}
