//! The workflow step task: the side-effecting unit.
//!
//! One invocation runs as many ready nodes as possible and stops on the
//! first of: all work drained (complete), a node requested a timer wait,
//! or a fatal node error. The returned [`StepOutput`] carries only a
//! *diff* of run data (entries for nodes absent from
//! `previously_executed_nodes`) so history payloads stay bounded however
//! long the workflow runs.
//!
//! All I/O of the system happens in here (through the collaborator
//! seams); the orchestration never performs any.

use crate::context::{Collaborators, NodeExecutionContext};
use crate::definition::WorkflowDefinition;
use crate::error::{EngineError, SerializedError};
use crate::item::ExecutionItem;
use crate::registry::NodeTypeProvider;
use crate::state::{
    ExecuteFrame, ExecutionData, PortData, RunData, RunState, TaskData, TaskDataSource,
    run_data_diff,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Input of one step-task invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInput {
    /// The execution this step belongs to.
    pub execution_id: String,
    /// The workflow definition.
    pub workflow_definition: WorkflowDefinition,
    /// Accumulated state at entry.
    pub run_state: RunState,
    /// Seed input items; only present on the first invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data: Option<Vec<ExecutionItem>>,
    /// Node names whose run data the orchestration already holds.
    #[serde(default)]
    pub previously_executed_nodes: BTreeSet<String>,
}

/// Output of one step-task invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    /// True when no work remains (including the fatal-error case).
    pub complete: bool,
    /// Run data for nodes not in `previously_executed_nodes`.
    #[serde(default)]
    pub new_run_data: RunData,
    /// Residual stack and merge accumulators.
    #[serde(default)]
    pub execution_data: ExecutionData,
    /// Last node that completed in this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_node_executed: Option<String>,
    /// Set when a node requested a timer wait.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_till: Option<DateTime<Utc>>,
    /// Set when a node failed fatally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
    /// The last node's most recent output, on complete success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<Vec<ExecutionItem>>,
}

/// Collaborator bundle the worker threads into every step invocation.
#[derive(Clone)]
pub struct StepContext {
    /// Node type resolution.
    pub registry: Arc<dyn NodeTypeProvider>,
    /// Credential, HTTP, and binary seams.
    pub collaborators: Collaborators,
}

/// Runs one step of a workflow execution.
///
/// Never fails at the call boundary: engine-internal errors come back as
/// a `Generic` error with an empty diff and empty bookkeeping.
pub async fn run_step(input: StepInput, context: &StepContext) -> StepOutput {
    let execution_id = input.execution_id.clone();
    match execute_step(input, context).await {
        Ok(output) => output,
        Err(engine_error) => {
            warn!(
                execution = %execution_id,
                error = %engine_error,
                "step task failed outside node execution"
            );
            StepOutput {
                complete: true,
                error: Some(SerializedError::from(engine_error).with_timestamp(Utc::now())),
                ..StepOutput::default()
            }
        }
    }
}

async fn execute_step(input: StepInput, context: &StepContext) -> Result<StepOutput, EngineError> {
    let StepInput {
        execution_id,
        workflow_definition: definition,
        mut run_state,
        input_data,
        previously_executed_nodes,
    } = input;

    // Resuming after a wait: the instant has passed by contract.
    run_state.wait_till = None;

    if run_state.is_fresh() {
        seed_first_frame(&mut run_state, &definition, input_data, context)?;
    }

    let incoming_ports = definition.incoming_ports();
    let mut wait_till = None;

    loop {
        let Some(frame) = run_state.execution_data.node_execution_stack.pop() else {
            // The stack drained. Promote any join still waiting on a
            // branch that will never report, supplying `[]` for the
            // missing ports.
            if let Some(frame) = promote_stalled_join(&mut run_state.execution_data) {
                run_state.execution_data.node_execution_stack.push(frame);
                continue;
            }
            break;
        };

        let node = definition
            .node(&frame.node)
            .ok_or_else(|| EngineError::NodeNotFound {
                name: frame.node.clone(),
            })?;

        if node.disabled {
            debug!(node = %node.name, "skipping disabled node, passing data through");
            let items = frame.data.main.first().cloned().unwrap_or_default();
            let routed = route_outputs(
                &mut run_state,
                &definition,
                &incoming_ports,
                &node.name,
                0,
                &[items],
            );
            push_frames(&mut run_state.execution_data.node_execution_stack, routed);
            continue;
        }

        let node_type = context
            .registry
            .by_name_and_version(&node.type_name, Some(node.type_version))?;

        let run_index = run_state.run_count(&node.name);
        let started_at = Utc::now();
        let started = std::time::Instant::now();

        let mut node_context = NodeExecutionContext::new(
            node,
            &definition,
            &frame.data,
            &run_state.result_data.run_data,
            &execution_id,
            run_index,
            started_at,
            &context.collaborators,
        );

        let result = node_type.execute(&mut node_context).await;
        let requested_wait = node_context.wait_till();
        drop(node_context);

        let execution_time_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output_ports) => {
                debug!(
                    node = %node.name,
                    run_index,
                    outputs = output_ports.len(),
                    "node completed"
                );
                run_state.push_task_data(
                    &node.name,
                    TaskData {
                        start_time: started_at,
                        execution_time_ms,
                        source: frame.source.clone(),
                        data: PortData {
                            main: output_ports.clone(),
                        },
                        error: None,
                        hints: vec![],
                    },
                );

                let routed = route_outputs(
                    &mut run_state,
                    &definition,
                    &incoming_ports,
                    &node.name,
                    run_index,
                    &output_ports,
                );
                push_frames(&mut run_state.execution_data.node_execution_stack, routed);

                if let Some(instant) = requested_wait {
                    info!(node = %node.name, wait_till = %instant, "node requested wait");
                    wait_till = Some(instant);
                    break;
                }
            }
            Err(node_error) => {
                let serialized = SerializedError::from_node_error(&node_error, &node.name)
                    .with_timestamp(Utc::now());

                if node.continue_on_fail {
                    // Whole-node failure with continue-on-fail: the error
                    // becomes the node's output and flow continues.
                    info!(node = %node.name, error = %node_error, "continuing after failure");
                    let error_item = ExecutionItem {
                        json: [(
                            "error".to_string(),
                            serde_json::Value::String(node_error.to_string()),
                        )]
                        .into_iter()
                        .collect(),
                        error: Some(serialized),
                        ..ExecutionItem::default()
                    };
                    let output_ports = vec![vec![error_item]];
                    run_state.push_task_data(
                        &node.name,
                        TaskData {
                            start_time: started_at,
                            execution_time_ms,
                            source: frame.source.clone(),
                            data: PortData {
                                main: output_ports.clone(),
                            },
                            error: None,
                            hints: vec![],
                        },
                    );
                    let routed = route_outputs(
                        &mut run_state,
                        &definition,
                        &incoming_ports,
                        &node.name,
                        run_index,
                        &output_ports,
                    );
                    push_frames(&mut run_state.execution_data.node_execution_stack, routed);
                } else {
                    warn!(node = %node.name, error = %node_error, "node failed");
                    run_state.push_task_data(
                        &node.name,
                        TaskData {
                            start_time: started_at,
                            execution_time_ms,
                            source: frame.source.clone(),
                            data: PortData::default(),
                            error: Some(serialized.clone()),
                            hints: vec![],
                        },
                    );
                    run_state.result_data.error = Some(serialized.clone());

                    return Ok(StepOutput {
                        complete: true,
                        new_run_data: run_data_diff(
                            &run_state.result_data.run_data,
                            &previously_executed_nodes,
                        ),
                        execution_data: run_state.execution_data,
                        last_node_executed: run_state.result_data.last_node_executed,
                        wait_till: None,
                        error: Some(serialized),
                        final_output: None,
                    });
                }
            }
        }
    }

    let new_run_data = run_data_diff(&run_state.result_data.run_data, &previously_executed_nodes);
    let last_node_executed = run_state.result_data.last_node_executed.clone();

    if let Some(instant) = wait_till {
        return Ok(StepOutput {
            complete: false,
            new_run_data,
            execution_data: run_state.execution_data,
            last_node_executed,
            wait_till: Some(instant),
            error: None,
            final_output: None,
        });
    }

    let final_output = run_state.last_output().cloned();
    Ok(StepOutput {
        complete: true,
        new_run_data,
        execution_data: run_state.execution_data,
        last_node_executed,
        wait_till: None,
        error: None,
        final_output,
    })
}

/// Locates the start node and pushes the first frame.
///
/// Selection order: a trigger-typed node, else a manual-trigger node,
/// else the first enabled node.
fn seed_first_frame(
    run_state: &mut RunState,
    definition: &WorkflowDefinition,
    input_data: Option<Vec<ExecutionItem>>,
    context: &StepContext,
) -> Result<(), EngineError> {
    let trigger = definition.nodes.iter().find(|node| {
        !node.disabled
            && context
                .registry
                .by_name(&node.type_name)
                .is_some_and(|t| t.description().is_trigger())
    });
    let start_node = trigger
        .or_else(|| {
            definition
                .nodes
                .iter()
                .find(|n| !n.disabled && n.type_name.ends_with("manualTrigger"))
        })
        .or_else(|| definition.first_enabled_node())
        .ok_or_else(|| EngineError::Bookkeeping {
            message: "workflow has no runnable nodes".to_string(),
        })?;

    let items = input_data.unwrap_or_else(|| vec![ExecutionItem::empty()]);
    run_state.start_data = serde_json::to_value(&items).ok();
    run_state
        .execution_data
        .node_execution_stack
        .push(ExecuteFrame {
            node: start_node.name.clone(),
            data: PortData::single(items),
            source: vec![],
        });
    info!(start_node = %start_node.name, "seeded first frame");
    Ok(())
}

/// Routes one node's outputs to its downstream nodes.
///
/// Single-input targets get a frame immediately; multi-input targets
/// accumulate in the waiting maps until every connected port has
/// reported for the target's upcoming run index. Returned frames are in
/// connection order; empty ports do not propagate.
fn route_outputs(
    run_state: &mut RunState,
    definition: &WorkflowDefinition,
    incoming_ports: &HashMap<String, BTreeSet<usize>>,
    source_node: &str,
    source_run_index: u32,
    output_ports: &[Vec<ExecutionItem>],
) -> Vec<ExecuteFrame> {
    let Some(destinations) = definition.destinations(source_node) else {
        return vec![];
    };

    let mut frames = Vec::new();
    for (output_index, targets) in destinations.main.iter().enumerate() {
        let Some(items) = output_ports.get(output_index) else {
            continue;
        };
        if items.is_empty() {
            // A branch that produced nothing does not run downstream.
            continue;
        }

        for target in targets {
            let source = TaskDataSource {
                previous_node: source_node.to_string(),
                previous_node_output: (output_index > 0).then_some(output_index),
                previous_node_run: (source_run_index > 0).then_some(source_run_index as usize),
            };
            let expected = incoming_ports
                .get(&target.node)
                .cloned()
                .unwrap_or_default();

            if expected.len() <= 1 {
                let mut data = PortData::default();
                data.main.resize(target.index + 1, Vec::new());
                data.main[target.index] = items.clone();
                let mut sources = vec![None; target.index + 1];
                sources[target.index] = Some(source);
                frames.push(ExecuteFrame {
                    node: target.node.clone(),
                    data,
                    source: sources,
                });
            } else {
                let target_run_index = run_state.run_count(&target.node);
                if let Some(frame) = run_state.execution_data.deposit_waiting(
                    &target.node,
                    target_run_index,
                    target.index,
                    &expected,
                    items.clone(),
                    source,
                ) {
                    frames.push(frame);
                }
            }
        }
    }
    frames
}

/// Pushes frames so the first-listed connection executes first under the
/// stack's LIFO pop.
fn push_frames(stack: &mut Vec<ExecuteFrame>, frames: Vec<ExecuteFrame>) {
    for frame in frames.into_iter().rev() {
        stack.push(frame);
    }
}

/// Promotes the first waiting join whose remaining branches can no longer
/// report, filling the missing ports with `[]`.
fn promote_stalled_join(execution_data: &mut ExecutionData) -> Option<ExecuteFrame> {
    let (node, run_index) = execution_data
        .waiting_execution
        .iter()
        .find_map(|(node, runs)| {
            runs.keys().next().map(|&run_index| (node.clone(), run_index))
        })?;

    let slots = execution_data
        .waiting_execution
        .get_mut(&node)
        .and_then(|runs| runs.remove(&run_index))
        .unwrap_or_default();
    if execution_data
        .waiting_execution
        .get(&node)
        .is_some_and(|runs| runs.is_empty())
    {
        execution_data.waiting_execution.remove(&node);
    }

    let sources = execution_data
        .waiting_execution_source
        .get_mut(&node)
        .and_then(|runs| runs.remove(&run_index))
        .unwrap_or_default();
    if execution_data
        .waiting_execution_source
        .get(&node)
        .is_some_and(|runs| runs.is_empty())
    {
        execution_data.waiting_execution_source.remove(&node);
    }

    debug!(node = %node, run_index, "promoting stalled join with partial input");
    Some(ExecuteFrame {
        node,
        data: PortData {
            main: slots.into_iter().map(Option::unwrap_or_default).collect(),
        },
        source: sources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{
        BinaryMetadata, BinaryScope, BinaryStore, BinaryUploadMetadata, CredentialResolving,
        HttpRequester, HttpResponse, RequestOptions, StoredBinary,
    };
    use crate::definition::CredentialRef;
    use crate::definition::WorkflowNode;
    use crate::error::{ErrorKind, NodeError};
    use crate::registry::{KnownTypes, NodeType, NodeTypeDescription, RegistryError};
    use async_trait::async_trait;
    use serde_json::{Value as JsonValue, json};

    // -- collaborator fakes -------------------------------------------------

    struct NoCredentials;

    #[async_trait]
    impl CredentialResolving for NoCredentials {
        async fn resolve(
            &self,
            _node: &WorkflowNode,
            cred_type: &str,
            _cred_ref: &CredentialRef,
            _raw: bool,
        ) -> Result<JsonValue, EngineError> {
            Err(EngineError::Credential {
                message: format!("no credentials in tests ({cred_type})"),
            })
        }

        async fn authenticate(
            &self,
            _cred_type: &str,
            _credentials: &JsonValue,
            options: RequestOptions,
            _node: &WorkflowNode,
        ) -> Result<RequestOptions, EngineError> {
            Ok(options)
        }
    }

    struct NoHttp;

    #[async_trait]
    impl HttpRequester for NoHttp {
        async fn request(&self, _options: RequestOptions) -> Result<HttpResponse, NodeError> {
            Err(NodeError::api("no network in tests"))
        }
    }

    struct NoBinary;

    #[async_trait]
    impl BinaryStore for NoBinary {
        async fn store(
            &self,
            _scope: &BinaryScope,
            _bytes: Vec<u8>,
            _metadata: BinaryUploadMetadata,
        ) -> Result<StoredBinary, EngineError> {
            unimplemented!("no binary store in step tests")
        }

        async fn as_bytes(&self, _id: &str) -> Result<Vec<u8>, EngineError> {
            unimplemented!("no binary store in step tests")
        }

        async fn metadata(&self, _id: &str) -> Result<BinaryMetadata, EngineError> {
            unimplemented!("no binary store in step tests")
        }

        async fn delete(&self, _id: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn step_context(registry: TestRegistry) -> StepContext {
        StepContext {
            registry: Arc::new(registry),
            collaborators: Collaborators {
                credentials: Arc::new(NoCredentials),
                http: Arc::new(NoHttp),
                binary: Arc::new(NoBinary),
                inline_binary_threshold: 1024,
            },
        }
    }

    // -- node fakes ---------------------------------------------------------

    fn description(name: &str, groups: &[&str], inputs: usize, outputs: usize) -> NodeTypeDescription {
        NodeTypeDescription {
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            versions: vec![1],
            default_version: 1,
            groups: groups.iter().map(ToString::to_string).collect(),
            inputs,
            outputs,
            credentials: vec![],
        }
    }

    /// Passes input through; marked as a trigger.
    struct TriggerNode(NodeTypeDescription);

    #[async_trait]
    impl NodeType for TriggerNode {
        fn description(&self) -> &NodeTypeDescription {
            &self.0
        }

        async fn execute(
            &self,
            context: &mut NodeExecutionContext<'_>,
        ) -> Result<Vec<Vec<ExecutionItem>>, NodeError> {
            Ok(vec![context.input_data(0).to_vec()])
        }
    }

    /// Merges the resolved `values` parameter into each item.
    struct EmitNode(NodeTypeDescription);

    #[async_trait]
    impl NodeType for EmitNode {
        fn description(&self) -> &NodeTypeDescription {
            &self.0
        }

        async fn execute(
            &self,
            context: &mut NodeExecutionContext<'_>,
        ) -> Result<Vec<Vec<ExecutionItem>>, NodeError> {
            let mut out = Vec::new();
            for (index, item) in context.input_data(0).to_vec().into_iter().enumerate() {
                let values = context.node_parameter("values", index)?;
                let mut item = item.with_pairing(index);
                if let JsonValue::Object(map) = values {
                    item.json.extend(map);
                }
                out.push(item);
            }
            Ok(vec![out])
        }
    }

    /// Always fails with an operation error.
    struct FailNode(NodeTypeDescription);

    #[async_trait]
    impl NodeType for FailNode {
        fn description(&self) -> &NodeTypeDescription {
            &self.0
        }

        async fn execute(
            &self,
            _context: &mut NodeExecutionContext<'_>,
        ) -> Result<Vec<Vec<ExecutionItem>>, NodeError> {
            Err(NodeError::operation("configured to fail"))
        }
    }

    /// Requests a wait and passes input through.
    struct WaitingNode(NodeTypeDescription);

    #[async_trait]
    impl NodeType for WaitingNode {
        fn description(&self) -> &NodeTypeDescription {
            &self.0
        }

        async fn execute(
            &self,
            context: &mut NodeExecutionContext<'_>,
        ) -> Result<Vec<Vec<ExecutionItem>>, NodeError> {
            let seconds = context
                .node_parameter_or("seconds", 0, json!(1))
                .as_i64()
                .unwrap_or(1);
            context.set_wait_till(Utc::now() + chrono::Duration::seconds(seconds));
            Ok(vec![context.input_data(0).to_vec()])
        }
    }

    /// Concatenates all input ports into one output.
    struct JoinNode(NodeTypeDescription);

    #[async_trait]
    impl NodeType for JoinNode {
        fn description(&self) -> &NodeTypeDescription {
            &self.0
        }

        async fn execute(
            &self,
            context: &mut NodeExecutionContext<'_>,
        ) -> Result<Vec<Vec<ExecutionItem>>, NodeError> {
            let mut merged = Vec::new();
            for port in 0..context.input_port_count() {
                merged.extend(context.input_data(port).to_vec());
            }
            Ok(vec![merged])
        }
    }

    struct TestRegistry;

    impl NodeTypeProvider for TestRegistry {
        fn by_name(&self, type_name: &str) -> Option<Arc<dyn crate::registry::NodeType>> {
            let node: Arc<dyn crate::registry::NodeType> = match type_name {
                "test.trigger" => {
                    Arc::new(TriggerNode(description("test.trigger", &["trigger"], 0, 1)))
                }
                "test.emit" => Arc::new(EmitNode(description("test.emit", &["transform"], 1, 1))),
                "test.fail" => Arc::new(FailNode(description("test.fail", &["transform"], 1, 1))),
                "test.wait" => {
                    Arc::new(WaitingNode(description("test.wait", &["organization"], 1, 1)))
                }
                "test.join" => Arc::new(JoinNode(description("test.join", &["transform"], 2, 1))),
                _ => return None,
            };
            Some(node)
        }

        fn by_name_and_version(
            &self,
            type_name: &str,
            _version: Option<u32>,
        ) -> Result<Arc<dyn crate::registry::NodeType>, RegistryError> {
            self.by_name(type_name)
                .ok_or_else(|| RegistryError::UnknownNodeType {
                    type_name: type_name.to_string(),
                })
        }

        fn known_types(&self) -> KnownTypes {
            KnownTypes {
                nodes: vec![
                    "test.trigger".to_string(),
                    "test.emit".to_string(),
                    "test.fail".to_string(),
                    "test.wait".to_string(),
                    "test.join".to_string(),
                ],
                credentials: vec![],
            }
        }
    }

    // -- helpers ------------------------------------------------------------

    fn definition(value: JsonValue) -> WorkflowDefinition {
        serde_json::from_value(value).expect("definition")
    }

    fn node_json(name: &str, type_name: &str, parameters: JsonValue) -> JsonValue {
        json!({
            "id": name.to_lowercase(),
            "name": name,
            "type": type_name,
            "typeVersion": 1,
            "position": [0.0, 0.0],
            "parameters": parameters
        })
    }

    fn first_input(definition: WorkflowDefinition, items: Vec<ExecutionItem>) -> StepInput {
        StepInput {
            execution_id: "exec-step-test".to_string(),
            workflow_definition: definition,
            run_state: RunState::empty(),
            input_data: Some(items),
            previously_executed_nodes: BTreeSet::new(),
        }
    }

    // -- tests --------------------------------------------------------------

    #[tokio::test]
    async fn linear_workflow_runs_to_completion() {
        let definition = definition(json!({
            "name": "linear",
            "nodes": [
                node_json("Start", "test.trigger", json!({})),
                node_json("Set", "test.emit", json!({"values": {"newField": "hello world"}})),
            ],
            "connections": {
                "Start": {"main": [[{"node": "Set", "type": "main", "index": 0}]]}
            }
        }));
        let context = step_context(TestRegistry);

        let input_items = vec![ExecutionItem::from_json(json!({"existingField": "existing value"}))];
        let output = run_step(first_input(definition, input_items), &context).await;

        assert!(output.complete);
        assert!(output.error.is_none());
        assert_eq!(output.last_node_executed.as_deref(), Some("Set"));
        assert_eq!(output.new_run_data.len(), 2);
        assert_eq!(output.new_run_data["Set"].len(), 1);

        let final_items = output.final_output.expect("final output");
        assert_eq!(final_items.len(), 1);
        assert_eq!(
            final_items[0].json.get("existingField"),
            Some(&json!("existing value"))
        );
        assert_eq!(
            final_items[0].json.get("newField"),
            Some(&json!("hello world"))
        );
        assert!(output.execution_data.is_drained());
    }

    #[tokio::test]
    async fn expression_reads_prior_node_output() {
        let definition = definition(json!({
            "name": "expr",
            "nodes": [
                node_json("Input", "test.emit", json!({"values": {"source": "from input"}})),
                node_json("Transform", "test.emit", json!({
                    "values": {"fromInput": "={{ $node[\"Input\"].json.source }}"}
                })),
            ],
            "connections": {
                "Input": {"main": [[{"node": "Transform", "type": "main", "index": 0}]]}
            }
        }));
        let context = step_context(TestRegistry);

        let output = run_step(
            first_input(definition, vec![ExecutionItem::empty()]),
            &context,
        )
        .await;

        assert!(output.complete);
        let keys: Vec<_> = output.new_run_data.keys().cloned().collect();
        assert_eq!(keys, vec!["Input".to_string(), "Transform".to_string()]);
        let final_items = output.final_output.expect("final output");
        assert_eq!(
            final_items[0].json.get("fromInput"),
            Some(&json!("from input"))
        );
    }

    #[tokio::test]
    async fn diff_excludes_previously_executed_nodes() {
        let definition = definition(json!({
            "name": "diff",
            "nodes": [
                node_json("Start", "test.trigger", json!({})),
                node_json("Set", "test.emit", json!({"values": {"x": 1}})),
            ],
            "connections": {
                "Start": {"main": [[{"node": "Set", "type": "main", "index": 0}]]}
            }
        }));
        let context = step_context(TestRegistry);

        let mut input = first_input(definition, vec![ExecutionItem::empty()]);
        // Simulate the orchestration already holding Start's run data.
        input
            .run_state
            .push_task_data("Start", TaskData {
                start_time: Utc::now(),
                execution_time_ms: 0,
                source: vec![],
                data: PortData::single(vec![ExecutionItem::empty()]),
                error: None,
                hints: vec![],
            });
        input
            .run_state
            .execution_data
            .node_execution_stack
            .push(ExecuteFrame {
                node: "Set".to_string(),
                data: PortData::single(vec![ExecutionItem::empty()]),
                source: vec![Some(TaskDataSource::from_node("Start"))],
            });
        input.previously_executed_nodes = ["Start".to_string()].into_iter().collect();
        input.input_data = None;

        let output = run_step(input, &context).await;

        assert!(output.complete);
        assert_eq!(
            output.new_run_data.keys().collect::<Vec<_>>(),
            vec!["Set"]
        );
    }

    #[tokio::test]
    async fn wait_stops_step_and_resume_completes() {
        let definition = definition(json!({
            "name": "wait",
            "nodes": [
                node_json("Start", "test.trigger", json!({})),
                node_json("Before", "test.emit", json!({"values": {"beforeWait": true}})),
                node_json("Pause", "test.wait", json!({"seconds": 2})),
                node_json("After", "test.emit", json!({"values": {"afterWait": true}})),
            ],
            "connections": {
                "Start": {"main": [[{"node": "Before", "type": "main", "index": 0}]]},
                "Before": {"main": [[{"node": "Pause", "type": "main", "index": 0}]]},
                "Pause": {"main": [[{"node": "After", "type": "main", "index": 0}]]}
            }
        }));
        let context = step_context(TestRegistry);

        let seed = vec![ExecutionItem::from_json(json!({"testInput": "keep me"}))];
        let first = run_step(first_input(definition.clone(), seed), &context).await;

        assert!(!first.complete);
        assert!(first.wait_till.is_some());
        assert_eq!(first.last_node_executed.as_deref(), Some("Pause"));
        // Downstream of the wait is parked, not executed.
        assert!(!first.new_run_data.contains_key("After"));
        assert_eq!(first.execution_data.node_execution_stack.len(), 1);
        assert_eq!(first.execution_data.node_execution_stack[0].node, "After");

        // Second invocation after the timer: state as left by the first.
        let mut state = RunState::empty();
        state.merge_run_data(first.new_run_data.clone());
        state.result_data.last_node_executed = first.last_node_executed.clone();
        state.execution_data = first.execution_data.clone();

        let second = run_step(
            StepInput {
                execution_id: "exec-step-test".to_string(),
                workflow_definition: definition,
                run_state: state,
                input_data: None,
                previously_executed_nodes: first.new_run_data.keys().cloned().collect(),
            },
            &context,
        )
        .await;

        assert!(second.complete);
        assert_eq!(second.last_node_executed.as_deref(), Some("After"));
        assert_eq!(
            second.new_run_data.keys().collect::<Vec<_>>(),
            vec!["After"]
        );
        let final_items = second.final_output.expect("final output");
        assert_eq!(final_items[0].json.get("testInput"), Some(&json!("keep me")));
        assert_eq!(final_items[0].json.get("beforeWait"), Some(&json!(true)));
        assert_eq!(final_items[0].json.get("afterWait"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn fatal_error_terminates_with_error_output() {
        let definition = definition(json!({
            "name": "fatal",
            "nodes": [
                node_json("Start", "test.trigger", json!({})),
                node_json("Boom", "test.fail", json!({})),
                node_json("Never", "test.emit", json!({"values": {"reached": true}})),
            ],
            "connections": {
                "Start": {"main": [[{"node": "Boom", "type": "main", "index": 0}]]},
                "Boom": {"main": [[{"node": "Never", "type": "main", "index": 0}]]}
            }
        }));
        let context = step_context(TestRegistry);

        let output = run_step(
            first_input(definition, vec![ExecutionItem::empty()]),
            &context,
        )
        .await;

        assert!(output.complete);
        let error = output.error.expect("error");
        assert_eq!(error.kind, ErrorKind::NodeOperation);
        assert_eq!(error.node.as_deref(), Some("Boom"));
        assert_eq!(output.last_node_executed.as_deref(), Some("Boom"));
        assert!(!output.new_run_data.contains_key("Never"));
        // The failing run is recorded with its error.
        assert!(output.new_run_data["Boom"][0].error.is_some());
    }

    #[tokio::test]
    async fn continue_on_fail_attaches_error_and_flows_on() {
        let mut boom = node_json("Boom", "test.fail", json!({}));
        boom["continueOnFail"] = json!(true);
        let definition = definition(json!({
            "name": "continue",
            "nodes": [
                node_json("Start", "test.trigger", json!({})),
                boom,
                node_json("Next", "test.emit", json!({"values": {"reached": true}})),
            ],
            "connections": {
                "Start": {"main": [[{"node": "Boom", "type": "main", "index": 0}]]},
                "Boom": {"main": [[{"node": "Next", "type": "main", "index": 0}]]}
            }
        }));
        let context = step_context(TestRegistry);

        let output = run_step(
            first_input(definition, vec![ExecutionItem::empty()]),
            &context,
        )
        .await;

        assert!(output.complete);
        assert!(output.error.is_none());
        assert_eq!(output.last_node_executed.as_deref(), Some("Next"));

        let boom_items = output.new_run_data["Boom"][0]
            .first_output()
            .expect("items");
        let attached = boom_items[0].error.as_ref().expect("attached error");
        assert_eq!(attached.kind, ErrorKind::NodeOperation);

        let final_items = output.final_output.expect("final output");
        assert_eq!(final_items[0].json.get("reached"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn branches_join_at_multi_input_node() {
        let definition = definition(json!({
            "name": "join",
            "nodes": [
                node_json("Start", "test.trigger", json!({})),
                node_json("Left", "test.emit", json!({"values": {"left": true}})),
                node_json("Right", "test.emit", json!({"values": {"right": true}})),
                node_json("Join", "test.join", json!({})),
            ],
            "connections": {
                "Start": {"main": [[
                    {"node": "Left", "type": "main", "index": 0},
                    {"node": "Right", "type": "main", "index": 0}
                ]]},
                "Left": {"main": [[{"node": "Join", "type": "main", "index": 0}]]},
                "Right": {"main": [[{"node": "Join", "type": "main", "index": 1}]]}
            }
        }));
        let context = step_context(TestRegistry);

        let output = run_step(
            first_input(definition, vec![ExecutionItem::empty()]),
            &context,
        )
        .await;

        assert!(output.complete);
        assert!(output.execution_data.is_drained());
        // The join ran exactly once, with both branches' items.
        assert_eq!(output.new_run_data["Join"].len(), 1);
        let joined = output.new_run_data["Join"][0]
            .first_output()
            .expect("items");
        assert_eq!(joined.len(), 2);
        assert_eq!(joined[0].json.get("left"), Some(&json!(true)));
        assert_eq!(joined[1].json.get("right"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn unknown_node_type_is_a_generic_error() {
        let definition = definition(json!({
            "name": "unknown",
            "nodes": [node_json("Ghost", "test.ghost", json!({}))],
            "connections": {}
        }));
        let context = step_context(TestRegistry);

        let output = run_step(
            first_input(definition, vec![ExecutionItem::empty()]),
            &context,
        )
        .await;

        assert!(output.complete);
        let error = output.error.expect("error");
        assert_eq!(error.kind, ErrorKind::Generic);
        assert!(error.message.contains("test.ghost"));
        assert!(output.new_run_data.is_empty());
    }

    #[tokio::test]
    async fn branch_order_is_first_connection_first() {
        let definition = definition(json!({
            "name": "order",
            "nodes": [
                node_json("Start", "test.trigger", json!({})),
                node_json("First", "test.emit", json!({"values": {"n": 1}})),
                node_json("Second", "test.emit", json!({"values": {"n": 2}})),
            ],
            "connections": {
                "Start": {"main": [[
                    {"node": "First", "type": "main", "index": 0},
                    {"node": "Second", "type": "main", "index": 0}
                ]]}
            }
        }));
        let context = step_context(TestRegistry);

        let output = run_step(
            first_input(definition, vec![ExecutionItem::empty()]),
            &context,
        )
        .await;

        assert!(output.complete);
        // The fan-out order is preserved: Second completes last.
        assert_eq!(output.last_node_executed.as_deref(), Some("Second"));
    }
}
