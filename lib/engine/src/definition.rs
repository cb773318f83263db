//! Workflow definition types.
//!
//! A workflow is a JSON document: a list of typed nodes plus a map of
//! directed "main" connections. The shape mirrors the common automation
//! format: `connections[source]["main"]` is an ordered list of output
//! ports, each an ordered list of targets. Port order is the branch order
//! of multi-output nodes; target order within a port is the fan-out order.

use crate::error::EngineError;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A reference from a node to a stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRef {
    /// Credential id in the credential store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Human-readable credential name.
    pub name: String,
}

/// A single node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    /// Unique node id.
    pub id: String,
    /// Human-readable name, unique within the workflow. Connections and
    /// run data are keyed by this name.
    pub name: String,
    /// Node type name, e.g. `cascade.set`.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Node type version.
    #[serde(default = "default_type_version")]
    pub type_version: u32,
    /// Canvas position; carried but not interpreted by the engine.
    #[serde(default)]
    pub position: [f64; 2],
    /// Parameter bag. String values starting with `=` are expressions.
    #[serde(default)]
    pub parameters: Map<String, JsonValue>,
    /// Credential references by credential type name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, CredentialRef>,
    /// Disabled nodes pass their input through untouched.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    /// When set, node failures attach to output items instead of
    /// stopping the execution.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub continue_on_fail: bool,
    /// Free-form author notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_type_version() -> u32 {
    1
}

/// One target of an outgoing connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTarget {
    /// Target node name.
    pub node: String,
    /// Input port kind on the target (always `"main"` today).
    #[serde(rename = "type", default = "main_kind")]
    pub kind: String,
    /// Input port index on the target.
    #[serde(default)]
    pub index: usize,
}

fn main_kind() -> String {
    "main".to_string()
}

/// Outgoing connections of one node, by output-port kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConnections {
    /// Main data connections: outer index = output port, inner order =
    /// fan-out order.
    #[serde(default)]
    pub main: Vec<Vec<ConnectionTarget>>,
}

/// Workflow settings that affect execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    /// IANA timezone used by `$now` / `$today`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Workflow to run when this one fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_workflow: Option<String>,
    /// Whether successful executions persist full data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_data_success_execution: Option<String>,
}

/// A complete workflow definition, fully JSON-serializable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Workflow id, if assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Workflow name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The nodes of the graph.
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    /// Directed connections, keyed by source node name.
    #[serde(default)]
    pub connections: BTreeMap<String, NodeConnections>,
    /// Execution settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<WorkflowSettings>,
    /// Free-form per-workflow static data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_data: Option<JsonValue>,
    /// Pinned node outputs; parsed and carried, never consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin_data: Option<JsonValue>,
}

impl WorkflowDefinition {
    /// Parses a definition from JSON text.
    ///
    /// # Errors
    ///
    /// Returns the underlying serde error for malformed documents.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Returns the node with the given name, if any.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Returns the outgoing main connections of a node, if any.
    #[must_use]
    pub fn destinations(&self, name: &str) -> Option<&NodeConnections> {
        self.connections.get(name)
    }

    /// Returns, per node name, the set of main input ports that have at
    /// least one incoming connection.
    #[must_use]
    pub fn incoming_ports(&self) -> HashMap<String, BTreeSet<usize>> {
        let mut incoming: HashMap<String, BTreeSet<usize>> = HashMap::new();
        for outputs in self.connections.values() {
            for port in &outputs.main {
                for target in port {
                    incoming
                        .entry(target.node.clone())
                        .or_default()
                        .insert(target.index);
                }
            }
        }
        incoming
    }

    /// Returns incoming connections for one node, ordered by
    /// `(source name, output port)`, the tie-break order used when
    /// assembling multi-input joins.
    #[must_use]
    pub fn incoming_connections(&self, name: &str) -> Vec<IncomingConnection> {
        let mut found = Vec::new();
        for (source, outputs) in &self.connections {
            for (output_index, port) in outputs.main.iter().enumerate() {
                for target in port {
                    if target.node == name {
                        found.push(IncomingConnection {
                            source: source.clone(),
                            output_index,
                            input_index: target.index,
                        });
                    }
                }
            }
        }
        found
    }

    /// Returns the first enabled node, in definition order.
    #[must_use]
    pub fn first_enabled_node(&self) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| !n.disabled)
    }

    /// Validates node-name uniqueness and the connection graph.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate node names, connections referencing
    /// unknown nodes, or cycles in the main-connection graph.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(EngineError::Bookkeeping {
                    message: format!("duplicate node name '{}'", node.name),
                });
            }
        }

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut indices = HashMap::new();
        for node in &self.nodes {
            let idx = graph.add_node(node.name.as_str());
            indices.insert(node.name.as_str(), idx);
        }

        for (source, outputs) in &self.connections {
            let Some(&source_idx) = indices.get(source.as_str()) else {
                return Err(EngineError::UnknownConnectionTarget {
                    source: source.clone(),
                    target: source.clone(),
                });
            };
            for port in &outputs.main {
                for target in port {
                    let Some(&target_idx) = indices.get(target.node.as_str()) else {
                        return Err(EngineError::UnknownConnectionTarget {
                            source: source.clone(),
                            target: target.node.clone(),
                        });
                    };
                    graph.add_edge(source_idx, target_idx, ());
                }
            }
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(EngineError::CycleDetected);
        }

        Ok(())
    }
}

/// One incoming connection of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingConnection {
    /// Source node name.
    pub source: String,
    /// Output port on the source.
    pub output_index: usize,
    /// Input port on the target.
    pub input_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_node_definition() -> WorkflowDefinition {
        serde_json::from_value(json!({
            "name": "test",
            "nodes": [
                {
                    "id": "1",
                    "name": "Input",
                    "type": "cascade.manualTrigger",
                    "typeVersion": 1,
                    "position": [0.0, 0.0],
                    "parameters": {}
                },
                {
                    "id": "2",
                    "name": "Transform",
                    "type": "cascade.set",
                    "typeVersion": 1,
                    "position": [200.0, 0.0],
                    "parameters": {}
                }
            ],
            "connections": {
                "Input": {"main": [[{"node": "Transform", "type": "main", "index": 0}]]}
            }
        }))
        .expect("definition")
    }

    #[test]
    fn parses_common_json_shape() {
        let definition = two_node_definition();
        assert_eq!(definition.nodes.len(), 2);
        let targets = &definition.destinations("Input").unwrap().main[0];
        assert_eq!(targets[0].node, "Transform");
        assert_eq!(targets[0].index, 0);
    }

    #[test]
    fn node_lookup_by_name() {
        let definition = two_node_definition();
        assert!(definition.node("Transform").is_some());
        assert!(definition.node("Missing").is_none());
    }

    #[test]
    fn incoming_ports_tracks_connected_indices() {
        let definition = two_node_definition();
        let incoming = definition.incoming_ports();
        assert_eq!(
            incoming.get("Transform"),
            Some(&[0usize].into_iter().collect())
        );
        assert!(incoming.get("Input").is_none());
    }

    #[test]
    fn validate_accepts_acyclic_graph() {
        assert!(two_node_definition().validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_target() {
        let mut definition = two_node_definition();
        definition
            .connections
            .get_mut("Input")
            .unwrap()
            .main[0]
            .push(ConnectionTarget {
                node: "Ghost".to_string(),
                kind: "main".to_string(),
                index: 0,
            });

        assert!(matches!(
            definition.validate(),
            Err(EngineError::UnknownConnectionTarget { target, .. }) if target == "Ghost"
        ));
    }

    #[test]
    fn validate_rejects_cycle() {
        let mut definition = two_node_definition();
        definition.connections.insert(
            "Transform".to_string(),
            NodeConnections {
                main: vec![vec![ConnectionTarget {
                    node: "Input".to_string(),
                    kind: "main".to_string(),
                    index: 0,
                }]],
            },
        );

        assert!(matches!(
            definition.validate(),
            Err(EngineError::CycleDetected)
        ));
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let mut definition = two_node_definition();
        definition.nodes[1].name = "Input".to_string();
        definition.connections.clear();

        assert!(definition.validate().is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let definition = two_node_definition();
        let text = serde_json::to_string(&definition).expect("serialize");
        let parsed = WorkflowDefinition::from_json(&text).expect("deserialize");
        assert_eq!(definition, parsed);
    }
}
