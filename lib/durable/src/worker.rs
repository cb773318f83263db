//! The worker runtime.
//!
//! Pulls queued executions and drives each orchestration machine:
//! replay the log, then perform commands: step tasks under a timeout,
//! retry policy, and a process-wide concurrency bound; durable timers
//! re-armed from history after restarts; cancellation honored at every
//! suspension point. Each signal is appended to history *before* it is
//! applied, so a crash at any boundary resumes without losing progress
//! (a step cut short by a crash simply re-runs; the diff discipline makes
//! that safe).

use crate::event::{HistoryEvent, ReplayError, replay};
use crate::store::{ExecutionRequest, ExecutionStore, StoreError};
use cascade_core::ExecutionId;
use cascade_engine::error::SerializedError;
use cascade_engine::orchestrator::{Orchestration, OrchestratorCommand, OrchestratorSignal};
use cascade_engine::step::{StepContext, StepInput, StepOutput, run_step};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How often suspension points re-check for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Retry policy for step-task invocations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub maximum_attempts: u32,
    /// Delay before the second attempt.
    pub initial_interval: Duration,
    /// Cap on the delay between attempts.
    pub maximum_interval: Duration,
    /// Multiplier applied per attempt.
    pub backoff_coefficient: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: 3,
            initial_interval: Duration::from_secs(1),
            maximum_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given (1-based) attempt.
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.backoff_coefficient.powi(attempt.saturating_sub(2) as i32);
        let delay = self.initial_interval.mul_f64(factor);
        delay.min(self.maximum_interval)
    }
}

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Per-invocation step timeout.
    pub step_timeout: Duration,
    /// Step retry policy.
    pub retry: RetryPolicy,
    /// Concurrent step tasks across all executions.
    pub max_concurrent_step_tasks: usize,
    /// Concurrent executions being driven.
    pub max_concurrent_executions: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            max_concurrent_step_tasks: 10,
            max_concurrent_executions: 100,
        }
    }
}

/// Errors from the worker runtime.
#[derive(Debug)]
pub enum WorkerError {
    /// Store failure while pulling work.
    Store(StoreError),
    /// A history log failed to replay.
    Replay {
        execution_id: ExecutionId,
        source: ReplayError,
    },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Replay {
                execution_id,
                source,
            } => write!(f, "replay failed for {execution_id}: {source}"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<StoreError> for WorkerError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Drives executions against a store.
pub struct Worker<S: ExecutionStore + 'static> {
    store: Arc<S>,
    step_context: StepContext,
    config: WorkerConfig,
    step_permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl<S: ExecutionStore + 'static> Worker<S> {
    /// Creates a worker over a store and the step collaborators.
    #[must_use]
    pub fn new(store: Arc<S>, step_context: StepContext, config: WorkerConfig) -> Self {
        let step_permits = Arc::new(Semaphore::new(config.max_concurrent_step_tasks.max(1)));
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            step_context,
            config,
            step_permits,
            shutdown,
        }
    }

    /// Requests a graceful shutdown: no new executions are pulled and
    /// `run` returns once in-flight executions settle.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Runs until shutdown, pulling and driving executions.
    ///
    /// # Errors
    ///
    /// Returns a store error when pulling work fails terminally.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let execution_permits = Arc::new(Semaphore::new(self.config.max_concurrent_executions));

        info!(
            step_timeout_seconds = self.config.step_timeout.as_secs(),
            max_concurrent_step_tasks = self.config.max_concurrent_step_tasks,
            "worker started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                request = self.store.next_request() => {
                    match request? {
                        None => break,
                        Some(request) => {
                            let permit = execution_permits
                                .clone()
                                .acquire_owned()
                                .await
                                .expect("execution semaphore closed");
                            let driver = ExecutionDriver {
                                store: self.store.clone(),
                                step_context: self.step_context.clone(),
                                config: self.config.clone(),
                                step_permits: self.step_permits.clone(),
                            };
                            in_flight.spawn(async move {
                                let execution_id = request.execution_id;
                                if let Err(e) = driver.drive(request).await {
                                    error!(execution = %execution_id, error = %e, "execution driver failed");
                                }
                                drop(permit);
                            });
                        }
                    }
                }
            }
        }

        info!(in_flight = in_flight.len(), "worker draining");
        while in_flight.join_next().await.is_some() {}
        info!("worker stopped");
        Ok(())
    }
}

/// Drives one execution to a suspension-free conclusion.
struct ExecutionDriver<S: ExecutionStore + 'static> {
    store: Arc<S>,
    step_context: StepContext,
    config: WorkerConfig,
    step_permits: Arc<Semaphore>,
}

impl<S: ExecutionStore + 'static> ExecutionDriver<S> {
    async fn drive(&self, request: ExecutionRequest) -> Result<(), WorkerError> {
        let execution_id = request.execution_id;
        let events = self.store.load_events(execution_id).await?;
        if events.is_empty() {
            // The queue outran the start event; nothing to recover from.
            self.store
                .append_event(
                    execution_id,
                    HistoryEvent::ExecutionStarted {
                        input: request.input.clone(),
                        timestamp: Utc::now(),
                    },
                )
                .await?;
        }
        let events = self.store.load_events(execution_id).await?;
        let outcome = replay(&events).map_err(|source| WorkerError::Replay {
            execution_id,
            source,
        })?;

        if outcome.is_terminal() {
            info!(execution = %execution_id, "execution already terminal, nothing to do");
            return Ok(());
        }

        info!(
            execution = %execution_id,
            replayed_events = events.len(),
            "driving execution"
        );

        let mut machine = outcome.machine;
        let mut recorded_timer = outcome.pending_timer;

        if outcome.cancel_requested {
            machine.apply(OrchestratorSignal::Canceled);
        }

        loop {
            match machine.next_command() {
                OrchestratorCommand::RunStep(step_input) => {
                    if self.check_cancel(execution_id, &mut machine).await? {
                        continue;
                    }
                    let signal = self.run_step_with_retry(execution_id, step_input).await;
                    let event = match &signal {
                        OrchestratorSignal::StepCompleted { output } => {
                            HistoryEvent::StepCompleted {
                                output: output.clone(),
                                timestamp: Utc::now(),
                            }
                        }
                        OrchestratorSignal::StepFailed { error } => HistoryEvent::StepFailed {
                            error: error.clone(),
                            timestamp: Utc::now(),
                        },
                        _ => unreachable!("step execution yields step signals"),
                    };
                    self.store.append_event(execution_id, event).await?;
                    machine.apply(signal);
                }
                OrchestratorCommand::StartTimer(fire_at) => {
                    // Re-arming after a crash must not duplicate the event.
                    if recorded_timer != Some(fire_at) {
                        self.store
                            .append_event(
                                execution_id,
                                HistoryEvent::TimerStarted {
                                    fire_at,
                                    timestamp: Utc::now(),
                                },
                            )
                            .await?;
                        recorded_timer = Some(fire_at);
                    }
                    if self.sleep_until(execution_id, fire_at, &mut machine).await? {
                        continue;
                    }
                    recorded_timer = None;
                    self.store
                        .append_event(
                            execution_id,
                            HistoryEvent::TimerFired {
                                timestamp: Utc::now(),
                            },
                        )
                        .await?;
                    machine.apply(OrchestratorSignal::TimerFired);
                }
                OrchestratorCommand::Complete(verdict) => {
                    info!(
                        execution = %execution_id,
                        status = ?verdict.status,
                        "execution complete"
                    );
                    self.store
                        .append_event(
                            execution_id,
                            HistoryEvent::ExecutionCompleted {
                                verdict: *verdict,
                                timestamp: Utc::now(),
                            },
                        )
                        .await?;
                    return Ok(());
                }
            }
        }
    }

    /// Applies the cancel signal when requested. Returns true when the
    /// machine was cancelled (caller re-reads the next command).
    async fn check_cancel(
        &self,
        execution_id: ExecutionId,
        machine: &mut Orchestration,
    ) -> Result<bool, WorkerError> {
        if self.store.cancel_requested(execution_id).await? {
            info!(execution = %execution_id, "cancel requested");
            machine.apply(OrchestratorSignal::Canceled);
            return Ok(true);
        }
        Ok(false)
    }

    /// Sleeps until the timer instant, polling for cancellation. Returns
    /// true when the sleep ended in cancellation.
    async fn sleep_until(
        &self,
        execution_id: ExecutionId,
        fire_at: DateTime<Utc>,
        machine: &mut Orchestration,
    ) -> Result<bool, WorkerError> {
        loop {
            let remaining = fire_at - Utc::now();
            if remaining <= chrono::Duration::zero() {
                return Ok(false);
            }
            let chunk = remaining
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(CANCEL_POLL_INTERVAL);
            tokio::time::sleep(chunk).await;

            if self.check_cancel(execution_id, machine).await? {
                return Ok(true);
            }
        }
    }

    /// Runs the step task under the timeout and retry policy; terminal
    /// failures become a `StepFailed` signal (the scheduler-failure
    /// conversion).
    async fn run_step_with_retry(
        &self,
        execution_id: ExecutionId,
        step_input: StepInput,
    ) -> OrchestratorSignal {
        let mut last_failure = String::new();

        for attempt in 1..=self.config.retry.maximum_attempts.max(1) {
            let delay = self.config.retry.delay_before(attempt);
            if !delay.is_zero() {
                warn!(
                    execution = %execution_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying step task"
                );
                tokio::time::sleep(delay).await;
            }

            match self.run_step_once(step_input.clone()).await {
                Ok(output) => return OrchestratorSignal::StepCompleted { output },
                Err(failure) => {
                    warn!(
                        execution = %execution_id,
                        attempt,
                        failure = %failure,
                        "step attempt failed"
                    );
                    last_failure = failure;
                }
            }
        }

        let mut error = SerializedError::generic(format!(
            "step task failed after {} attempts: {last_failure}",
            self.config.retry.maximum_attempts.max(1)
        ));
        error.timestamp = Some(Utc::now());
        OrchestratorSignal::StepFailed { error }
    }

    /// One step attempt: bounded by the semaphore, the timeout, and
    /// isolated in its own task so a panic does not take the driver down.
    async fn run_step_once(&self, step_input: StepInput) -> Result<StepOutput, String> {
        let permit = self
            .step_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| "step semaphore closed".to_string())?;

        let context = self.step_context.clone();
        let timeout = self.config.step_timeout;
        let mut handle = tokio::spawn(async move {
            let output = run_step(step_input, &context).await;
            drop(permit);
            output
        });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(join_error)) => Err(format!("step task panicked: {join_error}")),
            Err(_) => {
                handle.abort();
                Err(format!(
                    "step task exceeded timeout of {}s",
                    timeout.as_secs()
                ))
            }
        }
    }
}
