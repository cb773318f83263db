//! Field assignment.
//!
//! Two versions exist. Version 1 takes a flat `fields` object plus
//! `keepOnlySet`; version 2 (the default) takes an `assignments` list plus
//! `includeOtherFields`. Both resolve expressions per item.

use async_trait::async_trait;
use cascade_engine::context::NodeExecutionContext;
use cascade_engine::error::{NodeError, SerializedError};
use cascade_engine::item::ExecutionItem;
use cascade_engine::registry::{NodeType, NodeTypeDescription};
use serde_json::{Map, Value as JsonValue, json};

fn set_description(versions: Vec<u32>, default_version: u32) -> NodeTypeDescription {
    NodeTypeDescription {
        name: "cascade.set".to_string(),
        display_name: "Set".to_string(),
        description: "Sets fields on each item".to_string(),
        versions,
        default_version,
        groups: vec!["transform".to_string()],
        inputs: 1,
        outputs: 1,
        credentials: vec![],
    }
}

/// Builds one output item from the resolved field map.
fn apply_assignments(
    item: &ExecutionItem,
    index: usize,
    assignments: &Map<String, JsonValue>,
    keep_other_fields: bool,
) -> ExecutionItem {
    let mut json = if keep_other_fields {
        item.json.clone()
    } else {
        Map::new()
    };
    for (name, value) in assignments {
        json.insert(name.clone(), value.clone());
    }
    ExecutionItem {
        json,
        binary: item.binary.clone(),
        ..ExecutionItem::default()
    }
    .with_pairing(index)
}

/// Version 1: flat `fields` object + `keepOnlySet`.
pub struct SetV1 {
    description: NodeTypeDescription,
}

impl SetV1 {
    #[must_use]
    pub fn new() -> Self {
        Self {
            description: set_description(vec![1], 2),
        }
    }
}

impl Default for SetV1 {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeType for SetV1 {
    fn description(&self) -> &NodeTypeDescription {
        &self.description
    }

    async fn execute(
        &self,
        context: &mut NodeExecutionContext<'_>,
    ) -> Result<Vec<Vec<ExecutionItem>>, NodeError> {
        let items = context.input_data(0).to_vec();
        let keep_only_set = context
            .node_parameter_or("keepOnlySet", 0, json!(false))
            .as_bool()
            .unwrap_or(false);

        let mut out = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let fields = context.node_parameter("fields", index)?;
            let JsonValue::Object(fields) = fields else {
                return Err(NodeError::operation("parameter 'fields' must be an object"));
            };
            out.push(apply_assignments(item, index, &fields, !keep_only_set));
        }
        Ok(vec![out])
    }
}

/// Version 2 (default): `assignments` list + `includeOtherFields`.
pub struct SetV2 {
    description: NodeTypeDescription,
}

impl SetV2 {
    #[must_use]
    pub fn new() -> Self {
        Self {
            description: set_description(vec![2], 2),
        }
    }
}

impl Default for SetV2 {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeType for SetV2 {
    fn description(&self) -> &NodeTypeDescription {
        &self.description
    }

    async fn execute(
        &self,
        context: &mut NodeExecutionContext<'_>,
    ) -> Result<Vec<Vec<ExecutionItem>>, NodeError> {
        let items = context.input_data(0).to_vec();
        let include_other_fields = context
            .node_parameter_or("includeOtherFields", 0, json!(false))
            .as_bool()
            .unwrap_or(false);

        let mut out = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            match Self::transform_item(context, item, index, include_other_fields) {
                Ok(item) => out.push(item),
                Err(error) if context.continue_on_fail() => {
                    out.push(error_item(context, &error, index));
                }
                Err(error) => return Err(error),
            }
        }
        Ok(vec![out])
    }
}

impl SetV2 {
    fn transform_item(
        context: &NodeExecutionContext<'_>,
        item: &ExecutionItem,
        index: usize,
        include_other_fields: bool,
    ) -> Result<ExecutionItem, NodeError> {
        let assignments = context.node_parameter("assignments", index)?;
        let JsonValue::Array(assignments) = assignments else {
            return Err(NodeError::operation(
                "parameter 'assignments' must be a list",
            ));
        };

        let mut fields = Map::new();
        for assignment in &assignments {
            let name = assignment
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| NodeError::operation("every assignment needs a 'name'"))?;
            let value = assignment.get("value").cloned().unwrap_or(JsonValue::Null);
            fields.insert(name.to_string(), value);
        }
        Ok(apply_assignments(item, index, &fields, include_other_fields))
    }
}

/// An output item carrying a per-item failure (continue-on-fail).
fn error_item(
    context: &NodeExecutionContext<'_>,
    error: &NodeError,
    index: usize,
) -> ExecutionItem {
    let serialized = SerializedError::from_node_error(error, &context.node().name)
        .with_timestamp(chrono::Utc::now());
    let mut item = ExecutionItem::from_json(json!({"error": error.to_string()})).with_pairing(index);
    item.error = Some(serialized);
    item
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestBed, node_json};

    #[tokio::test]
    async fn v2_merges_fields_when_including_others() {
        let bed = TestBed::new(
            node_json(
                "cascade.set",
                json!({
                    "assignments": [{"name": "newField", "value": "hello world"}],
                    "includeOtherFields": true
                }),
            ),
            vec![ExecutionItem::from_json(json!({"existingField": "existing value"}))],
        );

        let output = SetV2::new()
            .execute(&mut bed.context())
            .await
            .expect("execute");

        let item = &output[0][0];
        assert_eq!(item.json.get("existingField"), Some(&json!("existing value")));
        assert_eq!(item.json.get("newField"), Some(&json!("hello world")));
    }

    #[tokio::test]
    async fn v2_drops_other_fields_by_default() {
        let bed = TestBed::new(
            node_json(
                "cascade.set",
                json!({"assignments": [{"name": "only", "value": 1}]}),
            ),
            vec![ExecutionItem::from_json(json!({"dropped": true}))],
        );

        let output = SetV2::new()
            .execute(&mut bed.context())
            .await
            .expect("execute");

        let item = &output[0][0];
        assert_eq!(item.json.get("dropped"), None);
        assert_eq!(item.json.get("only"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn v2_resolves_expressions_per_item() {
        let bed = TestBed::new(
            node_json(
                "cascade.set",
                json!({
                    "assignments": [{"name": "double", "value": "={{ $json.n * 2 }}"}],
                    "includeOtherFields": true
                }),
            ),
            vec![
                ExecutionItem::from_json(json!({"n": 2})),
                ExecutionItem::from_json(json!({"n": 5})),
            ],
        );

        let output = SetV2::new()
            .execute(&mut bed.context())
            .await
            .expect("execute");

        assert_eq!(output[0][0].json.get("double"), Some(&json!(4)));
        assert_eq!(output[0][1].json.get("double"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn v1_keep_only_set_drops_input_fields() {
        let mut node = node_json(
            "cascade.set",
            json!({"fields": {"kept": "yes"}, "keepOnlySet": true}),
        );
        node["typeVersion"] = json!(1);
        let bed = TestBed::new(node, vec![ExecutionItem::from_json(json!({"old": 1}))]);

        let output = SetV1::new()
            .execute(&mut bed.context())
            .await
            .expect("execute");

        let item = &output[0][0];
        assert_eq!(item.json.get("old"), None);
        assert_eq!(item.json.get("kept"), Some(&json!("yes")));
    }

    #[tokio::test]
    async fn continue_on_fail_keeps_good_items_and_marks_bad_ones() {
        let mut node = node_json(
            "cascade.set",
            json!({
                "assignments": [
                    {"name": "upper", "value": "={{ $json.name.toUpperCase() }}"}
                ]
            }),
        );
        node["continueOnFail"] = json!(true);
        let bed = TestBed::new(
            node,
            vec![
                ExecutionItem::from_json(json!({"name": "first"})),
                ExecutionItem::from_json(json!({"other": "no name field"})),
                ExecutionItem::from_json(json!({"name": "third"})),
            ],
        );

        let output = SetV2::new()
            .execute(&mut bed.context())
            .await
            .expect("execute");

        let items = &output[0];
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].json.get("upper"), Some(&json!("FIRST")));
        assert_eq!(items[2].json.get("upper"), Some(&json!("THIRD")));

        let failed = items[1].error.as_ref().expect("error attached");
        assert_eq!(
            failed.kind,
            cascade_engine::error::ErrorKind::NodeOperation
        );
        assert!(items[1].json.get("error").is_some());
    }

    #[tokio::test]
    async fn missing_assignments_is_an_operation_error() {
        let bed = TestBed::new(
            node_json("cascade.set", json!({})),
            vec![ExecutionItem::empty()],
        );

        let result = SetV2::new().execute(&mut bed.context()).await;
        assert!(result.is_err());
    }
}
