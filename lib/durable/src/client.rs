//! The client surface: start, status, result, cancel.

use crate::event::HistoryEvent;
use crate::store::{ExecutionRequest, ExecutionStore, StoreError};
use cascade_core::ExecutionId;
use cascade_engine::definition::WorkflowDefinition;
use cascade_engine::error::{EngineError, SerializedError};
use cascade_engine::item::ExecutionItem;
use cascade_engine::orchestrator::{ExecutionStatus, ExecutionVerdict, OrchestrationInput};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// How often `result(wait)` re-reads the log.
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Errors from client operations.
#[derive(Debug)]
pub enum ClientError {
    /// Store failure.
    Store(StoreError),
    /// The workflow definition failed validation.
    InvalidWorkflow(EngineError),
    /// No execution with the given id.
    NotFound { execution_id: ExecutionId },
    /// The execution has not finished yet.
    NotFinished { execution_id: ExecutionId },
    /// Waiting for the result exceeded the given timeout.
    Timeout { execution_id: ExecutionId },
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::InvalidWorkflow(e) => write!(f, "invalid workflow: {e}"),
            Self::NotFound { execution_id } => {
                write!(f, "execution not found: {execution_id}")
            }
            Self::NotFinished { execution_id } => {
                write!(f, "execution not finished: {execution_id}")
            }
            Self::Timeout { execution_id } => {
                write!(f, "timed out waiting for execution {execution_id}")
            }
        }
    }
}

impl std::error::Error for ClientError {}

impl From<StoreError> for ClientError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Coarse status derived from the history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    /// Submitted, no step has completed.
    Queued,
    /// Steps are running.
    Running,
    /// Suspended on a durable timer.
    Waiting,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancelled.
    Canceled,
}

/// A status snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatusReport {
    /// The execution id.
    pub execution_id: ExecutionId,
    /// Derived status.
    pub status: ReportedStatus,
    /// The pending timer instant, while waiting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_till: Option<DateTime<Utc>>,
    /// Last node known to have completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_node_executed: Option<String>,
    /// The terminal error, when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

/// Starts and inspects executions.
pub struct ExecutionClient<S: ExecutionStore> {
    store: Arc<S>,
}

impl<S: ExecutionStore> ExecutionClient<S> {
    /// Creates a client over a store.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Validates and submits a workflow, returning a fresh execution id.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid definitions or store failures.
    pub async fn start(
        &self,
        workflow_definition: WorkflowDefinition,
        input_data: Option<Vec<ExecutionItem>>,
    ) -> Result<ExecutionId, ClientError> {
        self.start_with_id(ExecutionId::new(), workflow_definition, input_data)
            .await
    }

    /// Validates and submits a workflow under a caller-chosen id.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid definitions or store failures.
    pub async fn start_with_id(
        &self,
        execution_id: ExecutionId,
        workflow_definition: WorkflowDefinition,
        input_data: Option<Vec<ExecutionItem>>,
    ) -> Result<ExecutionId, ClientError> {
        workflow_definition
            .validate()
            .map_err(ClientError::InvalidWorkflow)?;
        let input = OrchestrationInput {
            execution_id: execution_id.to_string(),
            workflow_definition,
            input_data,
        };

        self.store
            .append_event(
                execution_id,
                HistoryEvent::ExecutionStarted {
                    input: input.clone(),
                    timestamp: Utc::now(),
                },
            )
            .await?;
        self.store
            .enqueue(ExecutionRequest {
                execution_id,
                input,
            })
            .await?;

        info!(execution = %execution_id, "execution submitted");
        Ok(execution_id)
    }

    /// Reports the execution's current status.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids.
    pub async fn status(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionStatusReport, ClientError> {
        let events = self.store.load_events(execution_id).await?;
        if events.is_empty() {
            return Err(ClientError::NotFound { execution_id });
        }

        let mut status = ReportedStatus::Queued;
        let mut wait_till = None;
        let mut last_node_executed = None;
        let mut error = None;

        for event in &events {
            match event {
                HistoryEvent::ExecutionStarted { .. } => {}
                HistoryEvent::StepCompleted { output, .. } => {
                    status = ReportedStatus::Running;
                    wait_till = None;
                    if let Some(last) = &output.last_node_executed {
                        last_node_executed = Some(last.clone());
                    }
                }
                HistoryEvent::StepFailed { error: e, .. } => {
                    status = ReportedStatus::Failed;
                    error = Some(e.clone());
                }
                HistoryEvent::TimerStarted { fire_at, .. } => {
                    status = ReportedStatus::Waiting;
                    wait_till = Some(*fire_at);
                }
                HistoryEvent::TimerFired { .. } => {
                    status = ReportedStatus::Running;
                    wait_till = None;
                }
                HistoryEvent::CancelRequested { .. } => {}
                HistoryEvent::ExecutionCompleted { verdict, .. } => {
                    status = match verdict.status {
                        ExecutionStatus::Success => ReportedStatus::Succeeded,
                        ExecutionStatus::Error => ReportedStatus::Failed,
                        ExecutionStatus::Canceled => ReportedStatus::Canceled,
                        ExecutionStatus::Waiting => ReportedStatus::Waiting,
                    };
                    wait_till = None;
                    error = verdict.error.clone();
                }
            }
        }

        Ok(ExecutionStatusReport {
            execution_id,
            status,
            wait_till,
            last_node_executed,
            error,
        })
    }

    /// Returns the terminal verdict.
    ///
    /// With `wait` unset, an unfinished execution yields `NotFinished`.
    /// With `wait` set, polls until the verdict lands or `timeout`
    /// elapses (no timeout when `None`).
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `NotFinished`, `Timeout`, or store failures.
    pub async fn result(
        &self,
        execution_id: ExecutionId,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<ExecutionVerdict, ClientError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            let events = self.store.load_events(execution_id).await?;
            if events.is_empty() {
                return Err(ClientError::NotFound { execution_id });
            }
            if let Some(verdict) = events.iter().rev().find_map(|e| match e {
                HistoryEvent::ExecutionCompleted { verdict, .. } => Some(verdict.clone()),
                _ => None,
            }) {
                return Ok(verdict);
            }
            if !wait {
                return Err(ClientError::NotFinished { execution_id });
            }
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                return Err(ClientError::Timeout { execution_id });
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }
    }

    /// Starts an execution and awaits its verdict.
    ///
    /// # Errors
    ///
    /// As [`Self::start`] and [`Self::result`].
    pub async fn run(
        &self,
        workflow_definition: WorkflowDefinition,
        input_data: Option<Vec<ExecutionItem>>,
        timeout: Option<Duration>,
    ) -> Result<(ExecutionId, ExecutionVerdict), ClientError> {
        let execution_id = self.start(workflow_definition, input_data).await?;
        let verdict = self.result(execution_id, true, timeout).await?;
        Ok((execution_id, verdict))
    }

    /// Requests cancellation; honored at the next suspension point.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids or store failures.
    pub async fn cancel(&self, execution_id: ExecutionId) -> Result<(), ClientError> {
        let events = self.store.load_events(execution_id).await?;
        if events.is_empty() {
            return Err(ClientError::NotFound { execution_id });
        }
        self.store
            .append_event(
                execution_id,
                HistoryEvent::CancelRequested {
                    timestamp: Utc::now(),
                },
            )
            .await?;
        info!(execution = %execution_id, "cancel requested");
        Ok(())
    }
}
