//! JetStream-backed execution store.
//!
//! Two streams per namespace:
//!
//! - a history stream (`<ns>.history.<execution_id>` subjects, one
//!   subject per execution for cheap replay),
//! - a work-queue stream (`<ns>.queue.<task_queue>` subjects, work-queue
//!   retention so each submission is delivered to one worker).
//!
//! Every payload crosses the boundary through the engine's versioned
//! wire codec.

use crate::event::HistoryEvent;
use crate::store::{ExecutionRequest, ExecutionStore, StoreError};
use async_nats::jetstream;
use async_trait::async_trait;
use cascade_core::ExecutionId;
use cascade_engine::codec;
use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// How long draining a replay consumer waits for the next message.
const REPLAY_IDLE_TIMEOUT: Duration = Duration::from_millis(500);

/// Connection settings for the durable scheduler substrate.
#[derive(Debug, Clone)]
pub struct SchedulerConnection {
    /// Server address, e.g. `nats://localhost:4222`; a `tls://` scheme
    /// connects over TLS.
    pub address: String,
    /// Namespace isolating streams and subjects.
    pub namespace: String,
    /// Task queue this worker/client binds to.
    pub task_queue: String,
}

impl SchedulerConnection {
    /// Creates a connection config with defaults for namespace and queue.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            namespace: "default".to_string(),
            task_queue: "main".to_string(),
        }
    }

    fn history_stream_name(&self) -> String {
        format!("CASCADE_{}_HISTORY", self.namespace.to_uppercase())
    }

    fn queue_stream_name(&self) -> String {
        format!("CASCADE_{}_QUEUE", self.namespace.to_uppercase())
    }

    fn history_subject(&self, execution_id: ExecutionId) -> String {
        format!("cascade.{}.history.{execution_id}", self.namespace)
    }

    fn history_wildcard(&self) -> String {
        format!("cascade.{}.history.>", self.namespace)
    }

    fn queue_subject(&self) -> String {
        format!("cascade.{}.queue.{}", self.namespace, self.task_queue)
    }

    fn queue_wildcard(&self) -> String {
        format!("cascade.{}.queue.>", self.namespace)
    }

    fn consumer_name(&self) -> String {
        format!("cascade-worker-{}", self.task_queue)
    }
}

/// JetStream-backed implementation of [`ExecutionStore`].
pub struct NatsExecutionStore {
    jetstream: Arc<jetstream::Context>,
    connection: SchedulerConnection,
    queue_messages: Mutex<Option<jetstream::consumer::pull::Stream>>,
}

impl NatsExecutionStore {
    /// Connects and ensures the streams exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection or stream setup fails.
    pub async fn connect(connection: SchedulerConnection) -> Result<Self, StoreError> {
        let client = async_nats::connect(&connection.address).await.map_err(|e| {
            StoreError::ConnectionFailed {
                message: e.to_string(),
            }
        })?;
        let jetstream = jetstream::new(client);

        Self::ensure_streams(&jetstream, &connection).await?;
        info!(
            address = %connection.address,
            namespace = %connection.namespace,
            task_queue = %connection.task_queue,
            "connected to scheduler substrate"
        );

        Ok(Self {
            jetstream: Arc::new(jetstream),
            connection,
            queue_messages: Mutex::new(None),
        })
    }

    async fn ensure_streams(
        jetstream: &jetstream::Context,
        connection: &SchedulerConnection,
    ) -> Result<(), StoreError> {
        let history_config = jetstream::stream::Config {
            name: connection.history_stream_name(),
            subjects: vec![connection.history_wildcard()],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::Limits,
            ..Default::default()
        };
        jetstream
            .get_or_create_stream(history_config)
            .await
            .map_err(|e| StoreError::ConnectionFailed {
                message: format!("failed to create history stream: {e}"),
            })?;

        let queue_config = jetstream::stream::Config {
            name: connection.queue_stream_name(),
            subjects: vec![connection.queue_wildcard()],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            ..Default::default()
        };
        jetstream
            .get_or_create_stream(queue_config)
            .await
            .map_err(|e| StoreError::ConnectionFailed {
                message: format!("failed to create queue stream: {e}"),
            })?;

        Ok(())
    }

    fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        let envelope = codec::encode(value).map_err(|e| StoreError::PublishFailed {
            message: e.to_string(),
        })?;
        codec::to_bytes(&envelope).map_err(|e| StoreError::PublishFailed {
            message: e.to_string(),
        })
    }

    fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
        let envelope = codec::from_bytes(bytes).map_err(|e| StoreError::LoadFailed {
            message: e.to_string(),
        })?;
        codec::decode(envelope).map_err(|e| StoreError::LoadFailed {
            message: e.to_string(),
        })
    }

    async fn publish(&self, subject: String, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.jetstream
            .publish(subject, bytes.into())
            .await
            .map_err(|e| StoreError::PublishFailed {
                message: e.to_string(),
            })?
            .await
            .map_err(|e| StoreError::PublishFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn queue_consumer(
        &self,
    ) -> Result<jetstream::consumer::Consumer<jetstream::consumer::pull::Config>, StoreError>
    {
        let stream = self
            .jetstream
            .get_stream(self.connection.queue_stream_name())
            .await
            .map_err(|e| StoreError::LoadFailed {
                message: format!("failed to get queue stream: {e}"),
            })?;

        stream
            .get_or_create_consumer(
                &self.connection.consumer_name(),
                jetstream::consumer::pull::Config {
                    durable_name: Some(self.connection.consumer_name()),
                    filter_subject: self.connection.queue_subject(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| StoreError::LoadFailed {
                message: format!("failed to create queue consumer: {e}"),
            })
    }
}

#[async_trait]
impl ExecutionStore for NatsExecutionStore {
    async fn append_event(
        &self,
        execution_id: ExecutionId,
        event: HistoryEvent,
    ) -> Result<(), StoreError> {
        debug!(execution = %execution_id, kind = event.kind(), "appending history event");
        let bytes = Self::encode_payload(&event)?;
        self.publish(self.connection.history_subject(execution_id), bytes)
            .await
    }

    async fn load_events(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        let stream = self
            .jetstream
            .get_stream(self.connection.history_stream_name())
            .await
            .map_err(|e| StoreError::LoadFailed {
                message: format!("failed to get history stream: {e}"),
            })?;

        let consumer = stream
            .create_consumer(jetstream::consumer::pull::Config {
                filter_subject: self.connection.history_subject(execution_id),
                deliver_policy: jetstream::consumer::DeliverPolicy::All,
                ..Default::default()
            })
            .await
            .map_err(|e| StoreError::LoadFailed {
                message: format!("failed to create replay consumer: {e}"),
            })?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| StoreError::LoadFailed {
                message: format!("failed to read replay messages: {e}"),
            })?;

        let mut events = Vec::new();
        while let Ok(Some(message)) =
            tokio::time::timeout(REPLAY_IDLE_TIMEOUT, messages.next()).await
        {
            let message = message.map_err(|e| StoreError::LoadFailed {
                message: e.to_string(),
            })?;
            events.push(Self::decode_payload(&message.payload)?);
            message.ack().await.map_err(|e| StoreError::LoadFailed {
                message: format!("failed to ack replay message: {e}"),
            })?;
        }

        Ok(events)
    }

    async fn enqueue(&self, request: ExecutionRequest) -> Result<(), StoreError> {
        let bytes = Self::encode_payload(&request)?;
        self.publish(self.connection.queue_subject(), bytes).await
    }

    async fn next_request(&self) -> Result<Option<ExecutionRequest>, StoreError> {
        let mut guard = self.queue_messages.lock().await;
        if guard.is_none() {
            let consumer = self.queue_consumer().await?;
            let messages = consumer
                .messages()
                .await
                .map_err(|e| StoreError::LoadFailed {
                    message: format!("failed to subscribe to queue: {e}"),
                })?;
            *guard = Some(messages);
        }

        let messages = guard.as_mut().expect("queue subscription installed");
        match messages.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(StoreError::LoadFailed {
                message: e.to_string(),
            }),
            Some(Ok(message)) => {
                let request: ExecutionRequest = Self::decode_payload(&message.payload)?;
                message.ack().await.map_err(|e| StoreError::LoadFailed {
                    message: format!("failed to ack queue message: {e}"),
                })?;
                Ok(Some(request))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_layout() {
        let connection = SchedulerConnection {
            address: "nats://localhost:4222".to_string(),
            namespace: "staging".to_string(),
            task_queue: "etl".to_string(),
        };
        let execution_id = ExecutionId::new();

        assert_eq!(connection.history_stream_name(), "CASCADE_STAGING_HISTORY");
        assert_eq!(connection.queue_stream_name(), "CASCADE_STAGING_QUEUE");
        assert!(
            connection
                .history_subject(execution_id)
                .starts_with("cascade.staging.history.exec_")
        );
        assert_eq!(connection.queue_subject(), "cascade.staging.queue.etl");
        assert_eq!(connection.consumer_name(), "cascade-worker-etl");
    }

    #[test]
    fn payload_codec_roundtrip() {
        let event = HistoryEvent::TimerFired {
            timestamp: chrono::Utc::now(),
        };
        let bytes = NatsExecutionStore::encode_payload(&event).expect("encode");
        let decoded: HistoryEvent =
            NatsExecutionStore::decode_payload(&bytes).expect("decode");
        assert_eq!(event, decoded);
    }
}
