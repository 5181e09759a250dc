//! etcd driver over the v3 JSON gateway.
//!
//! Payloads are JSON operation lists; each operation is applied atomically
//! per key through `/v3/kv/put` and `/v3/kv/deleterange`. The schema tag is
//! a key prefix. Keys and values travel base64-encoded, per the gateway.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::config::ConnectionConfig;
use crate::error::{BfmError, Result};
use crate::script::Backend;

use super::{BackendDriver, BackendSession, PreparedMigration};

/// One key-value operation from a script payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KvOperation {
    /// Set `key` to `value`.
    Put { key: String, value: String },
    /// Delete exactly `key`.
    Delete { key: String },
    /// Delete every key under the `prefix`.
    DeletePrefix { prefix: String },
}

/// Parse a JSON payload into its operation list.
///
/// Accepts either a bare array or an `{"operations": [...]}` wrapper;
/// leading `//` comment lines (directive headers) are stripped first.
pub fn parse_operations(payload: &str) -> Result<Vec<KvOperation>> {
    let body: String = payload
        .lines()
        .filter(|line| !line.trim_start().starts_with("//"))
        .collect::<Vec<_>>()
        .join("\n");

    #[derive(Deserialize)]
    struct Wrapper {
        operations: Vec<KvOperation>,
    }

    if let Ok(ops) = serde_json::from_str::<Vec<KvOperation>>(&body) {
        return Ok(ops);
    }
    serde_json::from_str::<Wrapper>(&body)
        .map(|w| w.operations)
        .map_err(|e| {
            BfmError::ScriptParseError(format!("Invalid key-value operations payload: {}", e))
        })
}

/// Compute the exclusive range end for a prefix delete, per etcd semantics:
/// the prefix with its last byte incremented.
fn prefix_range_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    for i in (0..end.len()).rev() {
        if end[i] < 0xff {
            end[i] += 1;
            end.truncate(i + 1);
            return end;
        }
    }
    // All 0xff: delete to the end of the keyspace.
    vec![0]
}

/// Driver for etcd connections.
pub struct EtcdDriver {
    http: reqwest::Client,
}

impl EtcdDriver {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for EtcdDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendDriver for EtcdDriver {
    fn backend(&self) -> Backend {
        Backend::Etcd
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn BackendSession>> {
        let scheme = config
            .extra
            .get("scheme")
            .map(String::as_str)
            .unwrap_or("http");
        let mut session = EtcdSession {
            http: self.http.clone(),
            base_url: format!("{}://{}:{}", scheme, config.host, config.port),
            token: None,
        };
        if !config.username.is_empty() {
            session
                .authenticate(&config.username, &config.password)
                .await?;
        }
        Ok(Box::new(session))
    }
}

/// One logical etcd session; carries the gateway endpoint and, when auth is
/// enabled, the token obtained at connect time.
pub struct EtcdSession {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl EtcdSession {
    async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let url = format!("{}/v3/auth/authenticate", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "name": username, "password": password }))
            .send()
            .await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(BfmError::BackendError {
                backend: "etcd".to_string(),
                reason: format!("Authentication failed: HTTP {} {}", status, body),
            });
        }
        self.token = body
            .get("token")
            .and_then(|t| t.as_str())
            .map(str::to_string);
        Ok(())
    }

    async fn gateway_call(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.post(&url).json(&body);
        if let Some(ref token) = self.token {
            request = request.header("Authorization", token);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(BfmError::BackendError {
                backend: "etcd".to_string(),
                reason: format!("{} returned HTTP {}: {}", path, status, text),
            });
        }
        serde_json::from_str(&text).map_err(|e| BfmError::BackendError {
            backend: "etcd".to_string(),
            reason: format!("Unparseable gateway response: {} ({})", e, text),
        })
    }

    /// Prepend the schema tag as a key prefix, when present.
    fn scoped_key(schema: &str, key: &str) -> String {
        if schema.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", schema.trim_end_matches('/'), key)
        }
    }

    async fn apply(&self, schema: &str, op: &KvOperation) -> Result<()> {
        match op {
            KvOperation::Put { key, value } => {
                let key = Self::scoped_key(schema, key);
                self.gateway_call(
                    "/v3/kv/put",
                    json!({
                        "key": BASE64.encode(&key),
                        "value": BASE64.encode(value),
                    }),
                )
                .await?;
            }
            KvOperation::Delete { key } => {
                let key = Self::scoped_key(schema, key);
                self.gateway_call(
                    "/v3/kv/deleterange",
                    json!({ "key": BASE64.encode(&key) }),
                )
                .await?;
            }
            KvOperation::DeletePrefix { prefix } => {
                let prefix = Self::scoped_key(schema, prefix);
                self.gateway_call(
                    "/v3/kv/deleterange",
                    json!({
                        "key": BASE64.encode(&prefix),
                        "range_end": BASE64.encode(prefix_range_end(&prefix)),
                    }),
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackendSession for EtcdSession {
    async fn execute_migration(&mut self, prepared: &PreparedMigration) -> Result<()> {
        let operations = parse_operations(&prepared.payload)?;
        for op in &operations {
            log::debug!(
                "Applying key-value operation; migration_id={}, op={:?}",
                prepared.migration_id,
                op
            );
            self.apply(&prepared.schema, op).await?;
        }
        Ok(())
    }

    async fn health_check(&mut self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(BfmError::BackendError {
                backend: "etcd".to_string(),
                reason: format!("Health endpoint returned {}", response.status()),
            });
        }
        Ok(())
    }
}
