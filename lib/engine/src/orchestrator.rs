//! The orchestration state machine: the deterministic driver.
//!
//! One [`Orchestration`] exists per execution. It is pure: it consults no
//! clock, performs no I/O, and holds no collaborator handles. The durable
//! worker asks it for the next [`OrchestratorCommand`], performs the
//! command (step task, timer), and feeds back an [`OrchestratorSignal`].
//! Replay after a crash re-creates the machine from its input and
//! re-applies the recorded signals; because every transition is a pure
//! function of `(state, signal)`, the rebuilt machine continues exactly
//! where the lost one stopped.
//!
//! The loop it encodes: submit accumulated state → step task → merge the
//! diff → sleep when the step set `waitTill` → repeat until complete.

use crate::definition::WorkflowDefinition;
use crate::error::SerializedError;
use crate::item::ExecutionItem;
use crate::state::RunState;
use crate::step::{StepInput, StepOutput};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Input of an orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationInput {
    /// The execution id assigned by the client.
    pub execution_id: String,
    /// The workflow to run.
    pub workflow_definition: WorkflowDefinition,
    /// Seed input items for the start node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data: Option<Vec<ExecutionItem>>,
}

/// Terminal status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Completed with a final output.
    Success,
    /// Stopped on a fatal error.
    Error,
    /// Suspended on a timer (non-terminal; reported while waiting).
    Waiting,
    /// Cancelled before completion.
    Canceled,
}

/// The terminal verdict returned to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionVerdict {
    /// True on success.
    pub success: bool,
    /// The last node's most recent output, on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<ExecutionItem>>,
    /// The terminal error, on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
    /// The full accumulated state.
    pub run_state: RunState,
    /// Terminal status.
    pub status: ExecutionStatus,
}

/// What the worker must do next on behalf of the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorCommand {
    /// Invoke the step task with this input (under the retry policy).
    RunStep(StepInput),
    /// Arm a durable timer until the given instant.
    StartTimer(DateTime<Utc>),
    /// The execution is over; deliver the verdict.
    Complete(Box<ExecutionVerdict>),
}

/// What happened to the last command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorSignal {
    /// The step task returned.
    StepCompleted { output: StepOutput },
    /// The step task failed after retries were exhausted (scheduler-level
    /// failure: timeout, worker crash).
    StepFailed { error: SerializedError },
    /// The armed timer fired.
    TimerFired,
    /// The client cancelled the execution.
    Canceled,
}

/// The phase the machine is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Waiting for a step-task result.
    AwaitingStep,
    /// Waiting for a timer to fire.
    AwaitingTimer,
    /// Terminal.
    Done,
}

/// The deterministic orchestration state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Orchestration {
    input: OrchestrationInput,
    state: RunState,
    phase: Phase,
    previously_executed: BTreeSet<String>,
    first_step: bool,
    verdict: Option<ExecutionVerdict>,
}

impl Orchestration {
    /// Creates the machine in its initial phase.
    #[must_use]
    pub fn new(input: OrchestrationInput) -> Self {
        Self {
            input,
            state: RunState::empty(),
            phase: Phase::AwaitingStep,
            previously_executed: BTreeSet::new(),
            first_step: true,
            verdict: None,
        }
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The accumulated state (partial until terminal).
    #[must_use]
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// The command the worker must perform next.
    #[must_use]
    pub fn next_command(&self) -> OrchestratorCommand {
        match self.phase {
            Phase::AwaitingStep => OrchestratorCommand::RunStep(StepInput {
                execution_id: self.input.execution_id.clone(),
                workflow_definition: self.input.workflow_definition.clone(),
                run_state: self.state.clone(),
                input_data: if self.first_step {
                    self.input.input_data.clone()
                } else {
                    None
                },
                previously_executed_nodes: self.previously_executed.clone(),
            }),
            Phase::AwaitingTimer => {
                // Phase invariant: wait_till is always set here. The epoch
                // fallback keeps the machine clock-free regardless.
                OrchestratorCommand::StartTimer(self.state.wait_till.unwrap_or_default())
            }
            Phase::Done => OrchestratorCommand::Complete(Box::new(
                self.verdict.clone().unwrap_or_else(|| {
                    self.make_verdict(
                        false,
                        None,
                        Some(SerializedError::generic(
                            "orchestration completed without a verdict",
                        )),
                        ExecutionStatus::Error,
                    )
                }),
            )),
        }
    }

    /// Applies a signal, advancing the machine.
    pub fn apply(&mut self, signal: OrchestratorSignal) {
        if self.phase == Phase::Done {
            return;
        }
        match signal {
            OrchestratorSignal::StepCompleted { output } => self.apply_step_output(output),
            OrchestratorSignal::StepFailed { error } => {
                self.state.result_data.error = Some(error.clone());
                self.finish(false, None, Some(error), ExecutionStatus::Error);
            }
            OrchestratorSignal::TimerFired => {
                self.state.wait_till = None;
                self.previously_executed = self.state.executed_nodes();
                self.phase = Phase::AwaitingStep;
            }
            OrchestratorSignal::Canceled => {
                self.finish(false, None, None, ExecutionStatus::Canceled);
            }
        }
    }

    fn apply_step_output(&mut self, output: StepOutput) {
        self.first_step = false;

        // Diff merge: append new entries, replace bookkeeping wholesale.
        self.state.merge_run_data(output.new_run_data);
        self.state.execution_data = output.execution_data;
        if let Some(last) = output.last_node_executed {
            self.state.result_data.last_node_executed = Some(last);
        }

        if let Some(instant) = output.wait_till {
            self.state.wait_till = Some(instant);
            self.phase = Phase::AwaitingTimer;
            return;
        }

        if let Some(error) = output.error {
            self.state.result_data.error = Some(error.clone());
            self.finish(false, None, Some(error), ExecutionStatus::Error);
            return;
        }

        self.finish(true, output.final_output, None, ExecutionStatus::Success);
    }

    fn finish(
        &mut self,
        success: bool,
        data: Option<Vec<ExecutionItem>>,
        error: Option<SerializedError>,
        status: ExecutionStatus,
    ) {
        self.verdict = Some(self.make_verdict(success, data, error, status));
        self.phase = Phase::Done;
    }

    fn make_verdict(
        &self,
        success: bool,
        data: Option<Vec<ExecutionItem>>,
        error: Option<SerializedError>,
        status: ExecutionStatus,
    ) -> ExecutionVerdict {
        ExecutionVerdict {
            success,
            data,
            error,
            run_state: self.state.clone(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{PortData, RunData, TaskData, TaskDataSource};
    use serde_json::json;

    fn input() -> OrchestrationInput {
        OrchestrationInput {
            execution_id: "exec-test".to_string(),
            workflow_definition: WorkflowDefinition {
                name: Some("test".to_string()),
                ..WorkflowDefinition::default()
            },
            input_data: Some(vec![ExecutionItem::from_json(json!({"seed": 1}))]),
        }
    }

    fn task_data(field: &str) -> TaskData {
        TaskData {
            start_time: Utc::now(),
            execution_time_ms: 1,
            source: vec![Some(TaskDataSource::from_node("Start"))],
            data: PortData::single(vec![ExecutionItem::from_json(json!({field: true}))]),
            error: None,
            hints: vec![],
        }
    }

    fn step_output(nodes: &[&str], wait_till: Option<DateTime<Utc>>) -> StepOutput {
        let mut new_run_data = RunData::new();
        for node in nodes {
            new_run_data.insert((*node).to_string(), vec![task_data(node)]);
        }
        StepOutput {
            complete: wait_till.is_none(),
            new_run_data,
            execution_data: Default::default(),
            last_node_executed: nodes.last().map(ToString::to_string),
            wait_till,
            error: None,
            final_output: Some(vec![ExecutionItem::from_json(json!({"done": true}))]),
        }
    }

    #[test]
    fn first_command_carries_seed_input() {
        let machine = Orchestration::new(input());
        let OrchestratorCommand::RunStep(step_input) = machine.next_command() else {
            panic!("expected RunStep");
        };
        assert!(step_input.input_data.is_some());
        assert!(step_input.previously_executed_nodes.is_empty());
        assert!(step_input.run_state.is_fresh());
    }

    #[test]
    fn successful_step_completes_with_verdict() {
        let mut machine = Orchestration::new(input());
        machine.apply(OrchestratorSignal::StepCompleted {
            output: step_output(&["A", "B"], None),
        });

        assert_eq!(machine.phase(), Phase::Done);
        let OrchestratorCommand::Complete(verdict) = machine.next_command() else {
            panic!("expected Complete");
        };
        assert!(verdict.success);
        assert_eq!(verdict.status, ExecutionStatus::Success);
        assert_eq!(
            verdict.run_state.result_data.last_node_executed.as_deref(),
            Some("B")
        );
        assert_eq!(verdict.run_state.result_data.run_data.len(), 2);
    }

    #[test]
    fn wait_till_transitions_to_timer_then_back() {
        let wait_until = Utc::now() + chrono::Duration::seconds(30);
        let mut machine = Orchestration::new(input());

        machine.apply(OrchestratorSignal::StepCompleted {
            output: step_output(&["Before", "Wait"], Some(wait_until)),
        });
        assert_eq!(machine.phase(), Phase::AwaitingTimer);
        assert_eq!(
            machine.next_command(),
            OrchestratorCommand::StartTimer(wait_until)
        );

        machine.apply(OrchestratorSignal::TimerFired);
        assert_eq!(machine.phase(), Phase::AwaitingStep);

        // The resumed step must not receive seed input again, and the
        // already-merged nodes are excluded from future diffs.
        let OrchestratorCommand::RunStep(step_input) = machine.next_command() else {
            panic!("expected RunStep");
        };
        assert!(step_input.input_data.is_none());
        assert!(step_input.previously_executed_nodes.contains("Before"));
        assert!(step_input.previously_executed_nodes.contains("Wait"));
        assert!(step_input.run_state.wait_till.is_none());
    }

    #[test]
    fn merge_appends_across_steps() {
        let wait_until = Utc::now();
        let mut machine = Orchestration::new(input());

        machine.apply(OrchestratorSignal::StepCompleted {
            output: step_output(&["A"], Some(wait_until)),
        });
        machine.apply(OrchestratorSignal::TimerFired);
        machine.apply(OrchestratorSignal::StepCompleted {
            output: step_output(&["B"], None),
        });

        let state = machine.state();
        assert_eq!(state.result_data.run_data.len(), 2);
        assert!(state.result_data.run_data.contains_key("A"));
        assert!(state.result_data.run_data.contains_key("B"));
    }

    #[test]
    fn step_error_produces_error_verdict() {
        let mut machine = Orchestration::new(input());
        let mut output = step_output(&["A"], None);
        output.error = Some(SerializedError::generic("node blew up"));
        output.final_output = None;

        machine.apply(OrchestratorSignal::StepCompleted { output });

        let OrchestratorCommand::Complete(verdict) = machine.next_command() else {
            panic!("expected Complete");
        };
        assert!(!verdict.success);
        assert_eq!(verdict.status, ExecutionStatus::Error);
        assert!(verdict.error.is_some());
        // Partial run data is preserved in the verdict.
        assert!(verdict.run_state.result_data.run_data.contains_key("A"));
    }

    #[test]
    fn scheduler_failure_converts_to_generic_error() {
        let mut machine = Orchestration::new(input());
        machine.apply(OrchestratorSignal::StepFailed {
            error: SerializedError::generic("step retries exhausted"),
        });

        let OrchestratorCommand::Complete(verdict) = machine.next_command() else {
            panic!("expected Complete");
        };
        assert_eq!(verdict.status, ExecutionStatus::Error);
        assert!(
            verdict
                .run_state
                .result_data
                .error
                .as_ref()
                .is_some_and(|e| e.message.contains("retries exhausted"))
        );
    }

    #[test]
    fn cancellation_keeps_partial_state() {
        let mut machine = Orchestration::new(input());
        machine.apply(OrchestratorSignal::StepCompleted {
            output: step_output(&["A"], Some(Utc::now())),
        });
        machine.apply(OrchestratorSignal::Canceled);

        let OrchestratorCommand::Complete(verdict) = machine.next_command() else {
            panic!("expected Complete");
        };
        assert_eq!(verdict.status, ExecutionStatus::Canceled);
        assert!(!verdict.success);
        assert!(verdict.run_state.result_data.run_data.contains_key("A"));
    }

    #[test]
    fn signals_after_done_are_ignored() {
        let mut machine = Orchestration::new(input());
        machine.apply(OrchestratorSignal::StepCompleted {
            output: step_output(&["A"], None),
        });
        let before = machine.clone();

        machine.apply(OrchestratorSignal::TimerFired);
        machine.apply(OrchestratorSignal::Canceled);
        assert_eq!(machine, before);
    }

    #[test]
    fn replay_reproduces_identical_commands() {
        let wait_until = Utc::now() + chrono::Duration::seconds(5);
        let signals = vec![
            OrchestratorSignal::StepCompleted {
                output: step_output(&["A", "Wait"], Some(wait_until)),
            },
            OrchestratorSignal::TimerFired,
            OrchestratorSignal::StepCompleted {
                output: step_output(&["B"], None),
            },
        ];

        // Drive a machine live, recording every command.
        let mut live = Orchestration::new(input());
        let mut live_commands = vec![live.next_command()];
        for signal in &signals {
            live.apply(signal.clone());
            live_commands.push(live.next_command());
        }

        // Rebuild from scratch and re-apply the same signals, as replay
        // does after a crash at any boundary.
        let mut replayed = Orchestration::new(input());
        let mut replayed_commands = vec![replayed.next_command()];
        for signal in &signals {
            replayed.apply(signal.clone());
            replayed_commands.push(replayed.next_command());
        }

        assert_eq!(live_commands, replayed_commands);
        assert_eq!(live, replayed);
    }
}
