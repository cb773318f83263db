//! Multi-input join.
//!
//! The step task only runs this node once every connected input port has
//! reported (or its branch can no longer produce data). Modes:
//!
//! - `append` (default): concatenate port 0's items, then port 1's.
//! - `combineByPosition`: zip the ports, merging the JSON of items at the
//!   same index.

use async_trait::async_trait;
use cascade_engine::context::NodeExecutionContext;
use cascade_engine::error::NodeError;
use cascade_engine::item::{ExecutionItem, PairedItem, PairedItemRef};
use cascade_engine::registry::{NodeType, NodeTypeDescription};
use serde_json::json;

pub struct Merge {
    description: NodeTypeDescription,
}

impl Merge {
    #[must_use]
    pub fn new() -> Self {
        Self {
            description: NodeTypeDescription {
                name: "cascade.merge".to_string(),
                display_name: "Merge".to_string(),
                description: "Joins the data of multiple branches".to_string(),
                versions: vec![1],
                default_version: 1,
                groups: vec!["transform".to_string()],
                inputs: 2,
                outputs: 1,
                credentials: vec![],
            },
        }
    }
}

impl Default for Merge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeType for Merge {
    fn description(&self) -> &NodeTypeDescription {
        &self.description
    }

    async fn execute(
        &self,
        context: &mut NodeExecutionContext<'_>,
    ) -> Result<Vec<Vec<ExecutionItem>>, NodeError> {
        let mode = context
            .node_parameter_or("mode", 0, json!("append"))
            .as_str()
            .unwrap_or("append")
            .to_string();

        let ports: Vec<Vec<ExecutionItem>> = (0..context.input_port_count().max(2))
            .map(|port| context.input_data(port).to_vec())
            .collect();

        match mode.as_str() {
            "append" => {
                let mut merged = Vec::new();
                for (port, items) in ports.into_iter().enumerate() {
                    for (index, item) in items.into_iter().enumerate() {
                        let mut item = item;
                        item.paired_item = Some(PairedItem::Single(PairedItemRef {
                            item: index,
                            input: (port > 0).then_some(port),
                        }));
                        merged.push(item);
                    }
                }
                Ok(vec![merged])
            }
            "combineByPosition" => {
                let longest = ports.iter().map(Vec::len).max().unwrap_or(0);
                let mut merged = Vec::with_capacity(longest);
                for index in 0..longest {
                    let mut combined = ExecutionItem::default();
                    let mut lineage = Vec::new();
                    for (port, items) in ports.iter().enumerate() {
                        if let Some(item) = items.get(index) {
                            combined.json.extend(item.json.clone());
                            if let Some(binary) = &item.binary {
                                combined
                                    .binary
                                    .get_or_insert_with(Default::default)
                                    .extend(binary.clone());
                            }
                            lineage.push(PairedItemRef {
                                item: index,
                                input: (port > 0).then_some(port),
                            });
                        }
                    }
                    combined.paired_item = Some(PairedItem::Many(lineage));
                    merged.push(combined);
                }
                Ok(vec![merged])
            }
            other => Err(NodeError::operation(format!(
                "unknown merge mode '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestBed, node_json};

    #[tokio::test]
    async fn append_preserves_port_order() {
        let bed = TestBed::with_ports(
            node_json("cascade.merge", json!({})),
            vec![
                vec![ExecutionItem::from_json(json!({"left": 1}))],
                vec![
                    ExecutionItem::from_json(json!({"right": 1})),
                    ExecutionItem::from_json(json!({"right": 2})),
                ],
            ],
        );

        let output = Merge::new()
            .execute(&mut bed.context())
            .await
            .expect("execute");

        let merged = &output[0];
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].json.get("left"), Some(&json!(1)));
        assert_eq!(merged[2].json.get("right"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn combine_by_position_zips_json() {
        let bed = TestBed::with_ports(
            node_json("cascade.merge", json!({"mode": "combineByPosition"})),
            vec![
                vec![ExecutionItem::from_json(json!({"a": 1}))],
                vec![ExecutionItem::from_json(json!({"b": 2}))],
            ],
        );

        let output = Merge::new()
            .execute(&mut bed.context())
            .await
            .expect("execute");

        let merged = &output[0];
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].json.get("a"), Some(&json!(1)));
        assert_eq!(merged[0].json.get("b"), Some(&json!(2)));
        assert!(matches!(
            merged[0].paired_item,
            Some(PairedItem::Many(ref refs)) if refs.len() == 2
        ));
    }

    #[tokio::test]
    async fn unknown_mode_is_an_error() {
        let bed = TestBed::with_ports(
            node_json("cascade.merge", json!({"mode": "zipLongest"})),
            vec![vec![], vec![]],
        );

        assert!(Merge::new().execute(&mut bed.context()).await.is_err());
    }
}
