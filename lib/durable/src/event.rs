//! Execution history events and replay.
//!
//! The event log is the source of truth for an execution. The first event
//! is always `ExecutionStarted` (carrying the full orchestration input so
//! recovery needs nothing else); every later event maps onto one
//! orchestrator signal. Rebuilding state is a pure fold over the log;
//! identical events always produce an identical machine.

use cascade_engine::error::SerializedError;
use cascade_engine::orchestrator::{
    ExecutionVerdict, Orchestration, OrchestrationInput, OrchestratorSignal, Phase,
};
use cascade_engine::step::StepOutput;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One entry in an execution's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HistoryEvent {
    /// The execution was submitted. Always first.
    ExecutionStarted {
        input: OrchestrationInput,
        timestamp: DateTime<Utc>,
    },
    /// A step task returned.
    StepCompleted {
        output: StepOutput,
        timestamp: DateTime<Utc>,
    },
    /// A step task failed terminally (timeout / crash, retries spent).
    StepFailed {
        error: SerializedError,
        timestamp: DateTime<Utc>,
    },
    /// A durable timer was armed.
    TimerStarted {
        fire_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    /// The armed timer fired.
    TimerFired { timestamp: DateTime<Utc> },
    /// The client requested cancellation.
    CancelRequested { timestamp: DateTime<Utc> },
    /// The execution reached its verdict. Always last.
    ExecutionCompleted {
        verdict: ExecutionVerdict,
        timestamp: DateTime<Utc>,
    },
}

impl HistoryEvent {
    /// A short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "executionStarted",
            Self::StepCompleted { .. } => "stepCompleted",
            Self::StepFailed { .. } => "stepFailed",
            Self::TimerStarted { .. } => "timerStarted",
            Self::TimerFired { .. } => "timerFired",
            Self::CancelRequested { .. } => "cancelRequested",
            Self::ExecutionCompleted { .. } => "executionCompleted",
        }
    }
}

/// Errors from replaying a history log.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayError {
    /// The log is empty.
    NoEvents,
    /// The first event was not `ExecutionStarted`.
    MissingExecutionStarted,
    /// A second `ExecutionStarted` appeared.
    DuplicateExecutionStarted,
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEvents => write!(f, "no history events"),
            Self::MissingExecutionStarted => {
                write!(f, "first history event must be executionStarted")
            }
            Self::DuplicateExecutionStarted => {
                write!(f, "duplicate executionStarted event")
            }
        }
    }
}

impl std::error::Error for ReplayError {}

/// The state recovered from a history log.
#[derive(Debug)]
pub struct ReplayOutcome {
    /// The rebuilt machine, positioned exactly where the log ends.
    pub machine: Orchestration,
    /// A timer armed but not yet fired; must be re-armed on resume.
    pub pending_timer: Option<DateTime<Utc>>,
    /// A cancel request observed in the log.
    pub cancel_requested: bool,
    /// The verdict, when the log reached `ExecutionCompleted`.
    pub verdict: Option<ExecutionVerdict>,
}

impl ReplayOutcome {
    /// True when the execution already finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.verdict.is_some() || self.machine.phase() == Phase::Done
    }
}

/// Rebuilds orchestration state from a history log.
///
/// Events must be in append order (earliest first).
///
/// # Errors
///
/// Returns an error for structurally invalid logs.
pub fn replay(events: &[HistoryEvent]) -> Result<ReplayOutcome, ReplayError> {
    let mut iter = events.iter();

    let first = iter.next().ok_or(ReplayError::NoEvents)?;
    let HistoryEvent::ExecutionStarted { input, .. } = first else {
        return Err(ReplayError::MissingExecutionStarted);
    };

    let mut machine = Orchestration::new(input.clone());
    let mut pending_timer = None;
    let mut cancel_requested = false;
    let mut verdict = None;

    for event in iter {
        match event {
            HistoryEvent::ExecutionStarted { .. } => {
                return Err(ReplayError::DuplicateExecutionStarted);
            }
            HistoryEvent::StepCompleted { output, .. } => {
                machine.apply(OrchestratorSignal::StepCompleted {
                    output: output.clone(),
                });
            }
            HistoryEvent::StepFailed { error, .. } => {
                machine.apply(OrchestratorSignal::StepFailed {
                    error: error.clone(),
                });
            }
            HistoryEvent::TimerStarted { fire_at, .. } => {
                pending_timer = Some(*fire_at);
            }
            HistoryEvent::TimerFired { .. } => {
                pending_timer = None;
                machine.apply(OrchestratorSignal::TimerFired);
            }
            HistoryEvent::CancelRequested { .. } => {
                cancel_requested = true;
            }
            HistoryEvent::ExecutionCompleted { verdict: v, .. } => {
                verdict = Some(v.clone());
            }
        }
    }

    Ok(ReplayOutcome {
        machine,
        pending_timer,
        cancel_requested,
        verdict,
    })
}
