//! GreptimeDB driver over the HTTP API (`POST /v1/sql`).
//!
//! Statements are submitted one at a time; the schema tag selects the
//! Greptime database (`db` query parameter). Basic auth is used when the
//! connection carries credentials.

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::ConnectionConfig;
use crate::error::{BfmError, Result};
use crate::script::Backend;

use super::{BackendDriver, BackendSession, PreparedMigration};

/// Response envelope of the Greptime HTTP API.
#[derive(Debug, Deserialize)]
struct SqlResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    output: Vec<serde_json::Value>,
}

/// Split a SQL payload into individual statements.
///
/// Comment lines are dropped; the HTTP API wants one statement per call.
fn split_statements(payload: &str) -> Vec<String> {
    payload
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Driver for GreptimeDB connections.
pub struct GreptimeDriver {
    http: reqwest::Client,
}

impl GreptimeDriver {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for GreptimeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendDriver for GreptimeDriver {
    fn backend(&self) -> Backend {
        Backend::Greptimedb
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn BackendSession>> {
        let scheme = config
            .extra
            .get("scheme")
            .map(String::as_str)
            .unwrap_or("http");
        let session = GreptimeSession {
            http: self.http.clone(),
            base_url: format!("{}://{}:{}", scheme, config.host, config.port),
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        };
        Ok(Box::new(session))
    }
}

/// One logical Greptime session; HTTP is stateless, so this only carries
/// the resolved endpoint and credentials.
pub struct GreptimeSession {
    http: reqwest::Client,
    base_url: String,
    database: String,
    username: String,
    password: String,
}

impl GreptimeSession {
    fn db_for(&self, schema: &str) -> String {
        if schema.is_empty() {
            if self.database.is_empty() {
                "public".to_string()
            } else {
                self.database.clone()
            }
        } else {
            schema.to_string()
        }
    }

    async fn run_sql(&self, db: &str, sql: &str) -> Result<SqlResponse> {
        let url = format!("{}/v1/sql", self.base_url);
        let mut request = self
            .http
            .post(&url)
            .query(&[("db", db)])
            .form(&[("sql", sql)]);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BfmError::BackendError {
                backend: "greptimedb".to_string(),
                reason: format!("HTTP {}: {}", status, body),
            });
        }

        let parsed: SqlResponse = serde_json::from_str(&body).map_err(|e| {
            BfmError::BackendError {
                backend: "greptimedb".to_string(),
                reason: format!("Unparseable response: {} ({})", e, body),
            }
        })?;
        if parsed.code != 0 {
            return Err(BfmError::BackendError {
                backend: "greptimedb".to_string(),
                reason: parsed
                    .error
                    .unwrap_or_else(|| format!("code {}", parsed.code)),
            });
        }
        Ok(parsed)
    }
}

#[async_trait]
impl BackendSession for GreptimeSession {
    async fn execute_migration(&mut self, prepared: &PreparedMigration) -> Result<()> {
        let db = self.db_for(&prepared.schema);
        for statement in split_statements(&prepared.payload) {
            log::debug!(
                "Executing Greptime statement; migration_id={}, db={}",
                prepared.migration_id,
                db
            );
            self.run_sql(&db, &statement).await?;
        }
        Ok(())
    }

    async fn health_check(&mut self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(BfmError::BackendError {
                backend: "greptimedb".to_string(),
                reason: format!("Health endpoint returned {}", response.status()),
            });
        }
        Ok(())
    }

    async fn create_schema(&mut self, name: &str) -> Result<()> {
        // Greptime databases play the schema role.
        let sql = format!("CREATE DATABASE IF NOT EXISTS `{}`", name.replace('`', ""));
        self.run_sql(&self.db_for(""), &sql).await?;
        Ok(())
    }

    async fn schema_exists(&mut self, name: &str) -> Result<bool> {
        let response = self.run_sql(&self.db_for(""), "SHOW DATABASES").await?;
        // Row values arrive as [[name], [name], ...] under output[0].records.rows
        let found = response
            .output
            .first()
            .and_then(|o| o.pointer("/records/rows"))
            .and_then(|rows| rows.as_array())
            .map(|rows| {
                rows.iter().any(|row| {
                    row.as_array()
                        .and_then(|cells| cells.first())
                        .and_then(|cell| cell.as_str())
                        == Some(name)
                })
            })
            .unwrap_or(false);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements_drops_comments() {
        let payload = "-- bfm:backend greptimedb\n-- bfm:connection metrics\nCREATE TABLE cpu (ts TIMESTAMP TIME INDEX, usage DOUBLE);\nALTER TABLE cpu ADD COLUMN host STRING;";
        let statements = split_statements(payload);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE cpu"));
        assert!(statements[1].starts_with("ALTER TABLE cpu"));
    }

    #[test]
    fn test_split_statements_trailing_semicolon() {
        let statements = split_statements("SELECT 1;;\n;");
        assert_eq!(statements, vec!["SELECT 1"]);
    }

    #[test]
    fn test_sql_response_error_shape() {
        let raw = r#"{"code": 1004, "error": "table already exists"}"#;
        let parsed: SqlResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.code, 1004);
        assert_eq!(parsed.error.as_deref(), Some("table already exists"));
    }

    #[test]
    fn test_sql_response_rows_shape() {
        let raw = r#"{"code":0,"output":[{"records":{"rows":[["public"],["metrics"]]}}]}"#;
        let parsed: SqlResponse = serde_json::from_str(raw).unwrap();
        let rows = parsed.output[0].pointer("/records/rows").unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 2);
    }
}
