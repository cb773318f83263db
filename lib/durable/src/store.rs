//! The execution store seam.
//!
//! One trait covers what the worker and client need from the durable
//! substrate: an append-only per-execution event log and a work queue of
//! submitted executions. Implementations: JetStream (production) and
//! in-memory (tests, embedded runs).

use crate::event::HistoryEvent;
use async_trait::async_trait;
use cascade_core::ExecutionId;
use cascade_engine::orchestrator::OrchestrationInput;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A queued request to run a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// The id assigned at submission.
    pub execution_id: ExecutionId,
    /// The orchestration input.
    pub input: OrchestrationInput,
}

/// Errors from execution store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Failed to reach the substrate.
    ConnectionFailed { message: String },
    /// Failed to append or enqueue.
    PublishFailed { message: String },
    /// Failed to load events or pull a request.
    LoadFailed { message: String },
    /// The store was shut down.
    Closed,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { message } => {
                write!(f, "execution store connection failed: {message}")
            }
            Self::PublishFailed { message } => write!(f, "event publish failed: {message}"),
            Self::LoadFailed { message } => write!(f, "event load failed: {message}"),
            Self::Closed => write!(f, "execution store is closed"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Event log plus work queue.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Appends one event to an execution's log.
    async fn append_event(
        &self,
        execution_id: ExecutionId,
        event: HistoryEvent,
    ) -> Result<(), StoreError>;

    /// Loads an execution's full log, in append order.
    async fn load_events(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Vec<HistoryEvent>, StoreError>;

    /// Enqueues an execution for a worker to pick up.
    async fn enqueue(&self, request: ExecutionRequest) -> Result<(), StoreError>;

    /// Awaits the next queued execution. Returns `None` when the store is
    /// shutting down.
    async fn next_request(&self) -> Result<Option<ExecutionRequest>, StoreError>;

    /// True when a cancel request has been recorded for the execution.
    async fn cancel_requested(&self, execution_id: ExecutionId) -> Result<bool, StoreError> {
        let events = self.load_events(execution_id).await?;
        Ok(events
            .iter()
            .any(|e| matches!(e, HistoryEvent::CancelRequested { .. })))
    }
}
