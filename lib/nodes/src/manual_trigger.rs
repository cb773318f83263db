//! Manual trigger: the entry point for client-started executions.

use async_trait::async_trait;
use cascade_engine::context::NodeExecutionContext;
use cascade_engine::error::NodeError;
use cascade_engine::item::ExecutionItem;
use cascade_engine::registry::{NodeType, NodeTypeDescription};

/// Passes the seed input through unchanged.
pub struct ManualTrigger {
    description: NodeTypeDescription,
}

impl ManualTrigger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            description: NodeTypeDescription {
                name: "cascade.manualTrigger".to_string(),
                display_name: "Manual Trigger".to_string(),
                description: "Starts the workflow when an execution is submitted".to_string(),
                versions: vec![1],
                default_version: 1,
                groups: vec!["trigger".to_string()],
                inputs: 0,
                outputs: 1,
                credentials: vec![],
            },
        }
    }
}

impl Default for ManualTrigger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeType for ManualTrigger {
    fn description(&self) -> &NodeTypeDescription {
        &self.description
    }

    async fn execute(
        &self,
        context: &mut NodeExecutionContext<'_>,
    ) -> Result<Vec<Vec<ExecutionItem>>, NodeError> {
        Ok(vec![context.input_data(0).to_vec()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestBed, node_json};
    use serde_json::json;

    #[tokio::test]
    async fn passes_seed_input_through() {
        let bed = TestBed::new(
            node_json("cascade.manualTrigger", json!({})),
            vec![ExecutionItem::from_json(json!({"seed": true}))],
        );
        let trigger = ManualTrigger::new();

        let output = trigger.execute(&mut bed.context()).await.expect("execute");

        assert_eq!(output.len(), 1);
        assert_eq!(output[0][0].json.get("seed"), Some(&json!(true)));
    }
}
