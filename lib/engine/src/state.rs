//! Run state: the checkpointed state of an in-progress execution.
//!
//! The orchestration owns one [`RunState`] per execution and threads it by
//! value through the scheduler boundary to the step task. The step task
//! returns a diff; the orchestration merges it. Run data is append-only:
//! a re-run of a node within the same execution appends a new [`TaskData`],
//! never mutates an earlier one.

use crate::error::SerializedError;
use crate::item::ExecutionItem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};

/// Map from node name to that node's recorded runs, in run order.
pub type RunData = BTreeMap<String, Vec<TaskData>>;

/// Where a frame's input items came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDataSource {
    /// Name of the node that produced the items.
    pub previous_node: String,
    /// Output port on the producing node, when not port 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_node_output: Option<usize>,
    /// Run index on the producing node, when not the first run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_node_run: Option<usize>,
}

impl TaskDataSource {
    /// Creates a source for port 0 of the given node's latest run.
    #[must_use]
    pub fn from_node(previous_node: impl Into<String>) -> Self {
        Self {
            previous_node: previous_node.into(),
            previous_node_output: None,
            previous_node_run: None,
        }
    }
}

/// Output items grouped by port kind. Only `"main"` exists today.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortData {
    /// Items per output port.
    #[serde(default)]
    pub main: Vec<Vec<ExecutionItem>>,
}

impl PortData {
    /// Wraps a single port of items.
    #[must_use]
    pub fn single(items: Vec<ExecutionItem>) -> Self {
        Self { main: vec![items] }
    }
}

/// The recorded result of one node run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskData {
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// Wall-clock duration of the run in milliseconds.
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
    /// Where each input port's items came from.
    #[serde(default)]
    pub source: Vec<Option<TaskDataSource>>,
    /// The produced items, per output port.
    pub data: PortData,
    /// The failure, when the run errored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
    /// Advisory hints surfaced to the user.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

impl TaskData {
    /// First output port of this run, if any.
    #[must_use]
    pub fn first_output(&self) -> Option<&Vec<ExecutionItem>> {
        self.data.main.first()
    }
}

/// A node plus the input data prepared for it, pending execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteFrame {
    /// Node name.
    pub node: String,
    /// Input items, per input port.
    pub data: PortData,
    /// Where each input port's items came from.
    #[serde(default)]
    pub source: Vec<Option<TaskDataSource>>,
}

/// Terminal and cursor results of the execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultData {
    /// Recorded node runs, append-only.
    #[serde(default)]
    pub run_data: RunData,
    /// Name of the last node that completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_node_executed: Option<String>,
    /// Terminal error, if the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

/// Items accumulated for a multi-input node, per run index and input port.
/// `None` marks a port whose branch has not reported yet.
pub type WaitingItems = BTreeMap<String, BTreeMap<u32, Vec<Option<Vec<ExecutionItem>>>>>;

/// Sources matching [`WaitingItems`] entries.
pub type WaitingSources = BTreeMap<String, BTreeMap<u32, Vec<Option<TaskDataSource>>>>;

/// Scheduler bookkeeping: pending frames and merge accumulators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionData {
    /// Frames pending execution, last-in-first-out.
    #[serde(default)]
    pub node_execution_stack: Vec<ExecuteFrame>,
    /// Multi-input merge accumulators.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub waiting_execution: WaitingItems,
    /// Sources for the merge accumulators.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub waiting_execution_source: WaitingSources,
    /// Free-form scratch shared between node runs.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context_data: Map<String, JsonValue>,
    /// Free-form execution metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, JsonValue>,
}

impl ExecutionData {
    /// Returns true when no frames are pending and no joins are waiting.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.node_execution_stack.is_empty() && self.waiting_execution.is_empty()
    }

    /// Deposits one branch's arrival for a multi-input node.
    ///
    /// `expected_ports` is the set of input ports that have at least one
    /// incoming connection. When the final expected port reports for this
    /// run index, the accumulator is removed and an [`ExecuteFrame`] with
    /// the assembled input (missing optional ports supply `[]`) is
    /// returned.
    pub fn deposit_waiting(
        &mut self,
        node: &str,
        run_index: u32,
        input_index: usize,
        expected_ports: &BTreeSet<usize>,
        items: Vec<ExecutionItem>,
        source: TaskDataSource,
    ) -> Option<ExecuteFrame> {
        let port_count = expected_ports.iter().copied().max().map_or(1, |m| m + 1);

        let slots = self
            .waiting_execution
            .entry(node.to_string())
            .or_default()
            .entry(run_index)
            .or_insert_with(|| vec![None; port_count]);
        if slots.len() < port_count {
            slots.resize(port_count, None);
        }
        // A branch that reports twice for the same port extends the items
        // in arrival order.
        match &mut slots[input_index] {
            Some(existing) => existing.extend(items),
            slot @ None => *slot = Some(items),
        }

        let sources = self
            .waiting_execution_source
            .entry(node.to_string())
            .or_default()
            .entry(run_index)
            .or_insert_with(|| vec![None; port_count]);
        if sources.len() < port_count {
            sources.resize(port_count, None);
        }
        sources[input_index] = Some(source);

        let ready = expected_ports
            .iter()
            .all(|&port| slots.get(port).is_some_and(Option::is_some));
        if !ready {
            return None;
        }

        let slots = take_waiting_entry(&mut self.waiting_execution, node, run_index)
            .unwrap_or_default();
        let sources = take_waiting_entry(&mut self.waiting_execution_source, node, run_index)
            .unwrap_or_default();

        Some(ExecuteFrame {
            node: node.to_string(),
            data: PortData {
                main: slots.into_iter().map(Option::unwrap_or_default).collect(),
            },
            source: sources,
        })
    }
}

/// Removes one `(node, run_index)` accumulator entry, dropping the node's
/// outer entry when it becomes empty.
fn take_waiting_entry<T>(
    map: &mut BTreeMap<String, BTreeMap<u32, Vec<T>>>,
    node: &str,
    run_index: u32,
) -> Option<Vec<T>> {
    let per_run = map.get_mut(node)?;
    let removed = per_run.remove(&run_index);
    if per_run.is_empty() {
        map.remove(node);
    }
    removed
}

/// The full durable state of an in-progress execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    /// Results and terminal error.
    #[serde(default)]
    pub result_data: ResultData,
    /// Pending frames and merge accumulators.
    #[serde(default)]
    pub execution_data: ExecutionData,
    /// The input the execution was started with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_data: Option<JsonValue>,
    /// Wall-clock instant the execution must not resume before.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_till: Option<DateTime<Utc>>,
}

impl RunState {
    /// Creates the empty state an execution starts from.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true when nothing is pending: the execution is complete.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.execution_data.is_drained()
    }

    /// Returns true when no node has run and nothing is queued, the shape
    /// a brand-new execution presents to the first step.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.result_data.run_data.is_empty()
            && self.execution_data.node_execution_stack.is_empty()
    }

    /// Number of recorded runs for a node; the next run gets this index.
    #[must_use]
    pub fn run_count(&self, node: &str) -> u32 {
        self.result_data
            .run_data
            .get(node)
            .map_or(0, |runs| runs.len() as u32)
    }

    /// Appends a run to a node's run data.
    pub fn push_task_data(&mut self, node: &str, task_data: TaskData) {
        self.result_data
            .run_data
            .entry(node.to_string())
            .or_default()
            .push(task_data);
        self.result_data.last_node_executed = Some(node.to_string());
    }

    /// The most recent output of the last node executed (its first port).
    #[must_use]
    pub fn last_output(&self) -> Option<&Vec<ExecutionItem>> {
        let name = self.result_data.last_node_executed.as_deref()?;
        self.result_data
            .run_data
            .get(name)?
            .last()?
            .first_output()
    }

    /// Merges a step diff into the accumulated run data, appending per
    /// node name and leaving existing entries untouched.
    pub fn merge_run_data(&mut self, diff: RunData) {
        for (name, runs) in diff {
            self.result_data
                .run_data
                .entry(name)
                .or_default()
                .extend(runs);
        }
    }

    /// Node names that already have recorded runs.
    #[must_use]
    pub fn executed_nodes(&self) -> BTreeSet<String> {
        self.result_data.run_data.keys().cloned().collect()
    }
}

/// Restricts run data to nodes outside `previously_executed`: the diff a
/// step returns so history payloads stay bounded.
#[must_use]
pub fn run_data_diff(run_data: &RunData, previously_executed: &BTreeSet<String>) -> RunData {
    run_data
        .iter()
        .filter(|(name, _)| !previously_executed.contains(*name))
        .map(|(name, runs)| (name.clone(), runs.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task_data(field: &str) -> TaskData {
        TaskData {
            start_time: Utc::now(),
            execution_time_ms: 1,
            source: vec![],
            data: PortData::single(vec![ExecutionItem::from_json(json!({field: true}))]),
            error: None,
            hints: vec![],
        }
    }

    #[test]
    fn fresh_state_is_fresh_and_finished() {
        let state = RunState::empty();
        assert!(state.is_fresh());
        assert!(state.is_finished());
    }

    #[test]
    fn push_task_data_appends_and_tracks_cursor() {
        let mut state = RunState::empty();
        state.push_task_data("Set", task_data("first"));
        state.push_task_data("Set", task_data("second"));

        assert_eq!(state.run_count("Set"), 2);
        assert_eq!(
            state.result_data.last_node_executed.as_deref(),
            Some("Set")
        );
        let last = state.last_output().expect("output");
        assert_eq!(last[0].json.get("second"), Some(&json!(true)));
    }

    #[test]
    fn merge_appends_without_touching_existing_runs() {
        let mut state = RunState::empty();
        state.push_task_data("A", task_data("a0"));

        let before = state.result_data.run_data["A"].clone();

        let mut diff = RunData::new();
        diff.insert("A".to_string(), vec![task_data("a1")]);
        diff.insert("B".to_string(), vec![task_data("b0")]);
        state.merge_run_data(diff);

        assert_eq!(state.result_data.run_data["A"][0], before[0]);
        assert_eq!(state.result_data.run_data["A"].len(), 2);
        assert_eq!(state.result_data.run_data["B"].len(), 1);
    }

    #[test]
    fn diff_excludes_previously_executed() {
        let mut run_data = RunData::new();
        run_data.insert("A".to_string(), vec![task_data("a")]);
        run_data.insert("B".to_string(), vec![task_data("b")]);

        let previously = ["A".to_string()].into_iter().collect();
        let diff = run_data_diff(&run_data, &previously);

        assert_eq!(diff.keys().collect::<Vec<_>>(), vec!["B"]);
    }

    #[test]
    fn deposit_waiting_promotes_when_all_ports_report() {
        let mut data = ExecutionData::default();
        let expected: BTreeSet<usize> = [0, 1].into_iter().collect();

        let first = data.deposit_waiting(
            "Merge",
            0,
            1,
            &expected,
            vec![ExecutionItem::from_json(json!({"right": 1}))],
            TaskDataSource::from_node("B"),
        );
        assert!(first.is_none());
        assert!(!data.is_drained());

        let frame = data
            .deposit_waiting(
                "Merge",
                0,
                0,
                &expected,
                vec![ExecutionItem::from_json(json!({"left": 1}))],
                TaskDataSource::from_node("A"),
            )
            .expect("all ports reported");

        assert_eq!(frame.node, "Merge");
        assert_eq!(frame.data.main.len(), 2);
        assert_eq!(frame.data.main[0][0].json.get("left"), Some(&json!(1)));
        assert_eq!(frame.data.main[1][0].json.get("right"), Some(&json!(1)));
        assert_eq!(
            frame.source[0].as_ref().map(|s| s.previous_node.as_str()),
            Some("A")
        );
        // Accumulator fully drained after promotion.
        assert!(data.is_drained());
    }

    #[test]
    fn deposit_waiting_keys_run_indices_independently() {
        let mut data = ExecutionData::default();
        let expected: BTreeSet<usize> = [0, 1].into_iter().collect();

        assert!(
            data.deposit_waiting(
                "Merge",
                0,
                0,
                &expected,
                vec![],
                TaskDataSource::from_node("A"),
            )
            .is_none()
        );
        assert!(
            data.deposit_waiting(
                "Merge",
                1,
                0,
                &expected,
                vec![],
                TaskDataSource::from_node("A"),
            )
            .is_none()
        );

        // Completing run 0 must not consume run 1's accumulator.
        assert!(
            data.deposit_waiting(
                "Merge",
                0,
                1,
                &expected,
                vec![],
                TaskDataSource::from_node("B"),
            )
            .is_some()
        );
        assert!(!data.is_drained());
    }

    #[test]
    fn run_state_serde_roundtrip() {
        let mut state = RunState::empty();
        state.push_task_data("A", task_data("a"));
        state.execution_data.node_execution_stack.push(ExecuteFrame {
            node: "B".to_string(),
            data: PortData::single(vec![ExecutionItem::empty()]),
            source: vec![Some(TaskDataSource::from_node("A"))],
        });
        state.wait_till = Some(Utc::now());

        let json = serde_json::to_string(&state).expect("serialize");
        let parsed: RunState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(state, parsed);
    }

    #[test]
    fn wire_keys_are_camel_case() {
        let state = RunState::empty();
        let value = serde_json::to_value(&state).expect("serialize");
        assert!(value.get("resultData").is_some());
        assert!(value.get("executionData").is_some());
        assert!(value["executionData"].get("nodeExecutionStack").is_some());
    }
}
