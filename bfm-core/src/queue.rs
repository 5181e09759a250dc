//! Queue offload model.
//!
//! When a producer is configured, the executor publishes up/down requests
//! as opaque JSON envelopes instead of running them inline; a worker
//! consumes the envelopes and drives the same executor. Delivery is
//! at-least-once; the tracker's upsert idempotence absorbs duplicates.
//!
//! Wire transports (Kafka, Pulsar) attach behind the producer/consumer
//! traits. The crate ships the in-process channel transport, which carries
//! serialized envelopes so the contract matches a real broker.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{QueueKind, QueueSettings};
use crate::error::{BfmError, Result};
use crate::executor::{ExecutionContext, Executor};
use crate::script::{ExecutionMethod, MigrationTarget};

/// Which executor operation an envelope requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOperation {
    Up,
    Down,
}

/// The offloaded request, as published on the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEnvelope {
    pub operation: QueueOperation,
    #[serde(default)]
    pub target: MigrationTarget,
    /// Set for down requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_id: Option<String>,
    #[serde(default)]
    pub connection: String,
    #[serde(default)]
    pub schemas: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub executed_by: String,
    #[serde(default)]
    pub execution_context: serde_json::Value,
}

/// Publishes envelopes toward the worker.
#[async_trait]
pub trait QueueProducer: Send + Sync {
    async fn publish(&self, envelope: &QueueEnvelope) -> Result<()>;
}

/// Delivers envelopes to the worker. `None` means the transport closed.
#[async_trait]
pub trait QueueConsumer: Send {
    async fn next(&mut self) -> Option<QueueEnvelope>;
}

/// In-process transport half: producer side.
pub struct InProcessProducer {
    tx: tokio::sync::mpsc::Sender<String>,
}

/// In-process transport half: consumer side.
pub struct InProcessConsumer {
    rx: tokio::sync::mpsc::Receiver<String>,
}

/// Build the in-process transport pair.
pub fn in_process_channel(capacity: usize) -> (InProcessProducer, InProcessConsumer) {
    let (tx, rx) = tokio::sync::mpsc::channel(capacity);
    (InProcessProducer { tx }, InProcessConsumer { rx })
}

#[async_trait]
impl QueueProducer for InProcessProducer {
    async fn publish(&self, envelope: &QueueEnvelope) -> Result<()> {
        let encoded = serde_json::to_string(envelope)
            .map_err(|e| BfmError::QueueError(format!("Unencodable envelope: {}", e)))?;
        self.tx
            .send(encoded)
            .await
            .map_err(|_| BfmError::QueueError("Queue consumer is gone".to_string()))
    }
}

#[async_trait]
impl QueueConsumer for InProcessConsumer {
    async fn next(&mut self) -> Option<QueueEnvelope> {
        loop {
            let encoded = self.rx.recv().await?;
            match serde_json::from_str(&encoded) {
                Ok(envelope) => return Some(envelope),
                Err(e) => {
                    log::error!("Dropping undecodable envelope: {}", e);
                }
            }
        }
    }
}

/// Construct the configured transport, if any.
///
/// `None` queue kind runs everything inline. The broker transports are
/// external collaborators; selecting one without its plugin is a
/// configuration error.
pub fn build_transport(
    settings: &QueueSettings,
) -> Result<Option<(Arc<dyn QueueProducer>, InProcessConsumer)>> {
    match settings.kind {
        QueueKind::None => Ok(None),
        QueueKind::InProcess => {
            let (producer, consumer) = in_process_channel(64);
            Ok(Some((Arc::new(producer), consumer)))
        }
        QueueKind::Kafka | QueueKind::Pulsar => Err(BfmError::ConfigError(format!(
            "Queue kind {:?} requires the external transport plugin; use 'inprocess' or 'none'",
            settings.kind
        ))),
    }
}

/// Worker loop: consume envelopes and run them inline on the executor.
///
/// Returns when the transport closes. Failures are logged and recorded by
/// the executor; the worker never retries on its own.
pub async fn run_worker(executor: Arc<Executor>, mut consumer: impl QueueConsumer) {
    log::info!("Queue worker started");
    while let Some(envelope) = consumer.next().await {
        let ctx = ExecutionContext {
            executed_by: if envelope.executed_by.is_empty() {
                "worker".to_string()
            } else {
                envelope.executed_by.clone()
            },
            method: ExecutionMethod::Worker,
            context: envelope.execution_context.clone(),
        };

        match envelope.operation {
            QueueOperation::Up => {
                let result = executor
                    .execute_up_inline(
                        &envelope.target,
                        &envelope.connection,
                        &envelope.schemas,
                        envelope.dry_run,
                        &ctx,
                    )
                    .await;
                log::info!(
                    "Worker processed up request; applied={}, skipped={}, errors={}",
                    result.applied.len(),
                    result.skipped.len(),
                    result.errors.len()
                );
            }
            QueueOperation::Down => {
                let Some(ref migration_id) = envelope.migration_id else {
                    log::error!("Down envelope without migration_id; dropped");
                    continue;
                };
                match executor
                    .execute_down(migration_id, &envelope.schemas, envelope.dry_run, &ctx)
                    .await
                {
                    Ok(result) => {
                        log::info!(
                            "Worker processed down request; migration_id={}, errors={}",
                            migration_id,
                            result.errors.len()
                        );
                    }
                    Err(e) => {
                        log::error!(
                            "Worker down request failed; migration_id={}, error={}",
                            migration_id,
                            e
                        );
                    }
                }
            }
        }
    }
    log::info!("Queue worker stopped: transport closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Backend;

    #[tokio::test]
    async fn test_envelope_round_trip_through_channel() {
        let (producer, mut consumer) = in_process_channel(4);
        let envelope = QueueEnvelope {
            operation: QueueOperation::Up,
            target: MigrationTarget {
                backend: Some(Backend::Postgresql),
                connection: Some("main".to_string()),
                ..Default::default()
            },
            migration_id: None,
            connection: "main".to_string(),
            schemas: vec!["public".to_string()],
            dry_run: false,
            executed_by: "tester".to_string(),
            execution_context: serde_json::json!({"request_id": "r-1"}),
        };
        producer.publish(&envelope).await.unwrap();
        let received = consumer.next().await.unwrap();
        assert_eq!(received.operation, QueueOperation::Up);
        assert_eq!(received.connection, "main");
        assert_eq!(received.schemas, vec!["public"]);
        assert_eq!(received.execution_context["request_id"], "r-1");
    }

    #[tokio::test]
    async fn test_consumer_ends_when_producer_dropped() {
        let (producer, mut consumer) = in_process_channel(1);
        drop(producer);
        assert!(consumer.next().await.is_none());
    }

    #[test]
    fn test_envelope_json_shape() {
        let envelope = QueueEnvelope {
            operation: QueueOperation::Down,
            target: MigrationTarget::default(),
            migration_id: Some("20250101000000_a_postgresql_main".to_string()),
            connection: String::new(),
            schemas: vec![],
            dry_run: true,
            executed_by: String::new(),
            execution_context: serde_json::Value::Null,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["operation"], "down");
        assert_eq!(json["dry_run"], true);
        assert_eq!(
            json["migration_id"],
            "20250101000000_a_postgresql_main"
        );
    }

    #[test]
    fn test_build_transport_kinds() {
        let none = QueueSettings::default();
        assert!(build_transport(&none).unwrap().is_none());

        let inprocess = QueueSettings {
            kind: QueueKind::InProcess,
            ..Default::default()
        };
        assert!(build_transport(&inprocess).unwrap().is_some());

        let kafka = QueueSettings {
            kind: QueueKind::Kafka,
            ..Default::default()
        };
        assert!(build_transport(&kafka).is_err());
    }
}
