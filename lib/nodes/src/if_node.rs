//! Expression-based branching.
//!
//! Routes each item by the truthiness of the `condition` expression:
//! output 0 carries the true branch, output 1 the false branch.

use async_trait::async_trait;
use cascade_engine::context::NodeExecutionContext;
use cascade_engine::error::NodeError;
use cascade_engine::item::ExecutionItem;
use cascade_engine::registry::{NodeType, NodeTypeDescription};
use serde_json::Value as JsonValue;

pub struct If {
    description: NodeTypeDescription,
}

impl If {
    #[must_use]
    pub fn new() -> Self {
        Self {
            description: NodeTypeDescription {
                name: "cascade.if".to_string(),
                display_name: "If".to_string(),
                description: "Routes items to the true or false branch".to_string(),
                versions: vec![1],
                default_version: 1,
                groups: vec!["transform".to_string()],
                inputs: 1,
                outputs: 2,
                credentials: vec![],
            },
        }
    }
}

impl Default for If {
    fn default() -> Self {
        Self::new()
    }
}

fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}

#[async_trait]
impl NodeType for If {
    fn description(&self) -> &NodeTypeDescription {
        &self.description
    }

    async fn execute(
        &self,
        context: &mut NodeExecutionContext<'_>,
    ) -> Result<Vec<Vec<ExecutionItem>>, NodeError> {
        let items = context.input_data(0).to_vec();
        let mut true_branch = Vec::new();
        let mut false_branch = Vec::new();

        for (index, item) in items.into_iter().enumerate() {
            let condition = context.node_parameter("condition", index)?;
            if truthy(&condition) {
                true_branch.push(item.with_pairing(index));
            } else {
                false_branch.push(item.with_pairing(index));
            }
        }

        Ok(vec![true_branch, false_branch])
    }
}
