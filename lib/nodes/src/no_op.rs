//! No-operation pass-through.

use async_trait::async_trait;
use cascade_engine::context::NodeExecutionContext;
use cascade_engine::error::NodeError;
use cascade_engine::item::ExecutionItem;
use cascade_engine::registry::{NodeType, NodeTypeDescription};

/// Forwards input items unchanged. Useful as a connector placeholder.
pub struct NoOp {
    description: NodeTypeDescription,
}

impl NoOp {
    #[must_use]
    pub fn new() -> Self {
        Self {
            description: NodeTypeDescription {
                name: "cascade.noOp".to_string(),
                display_name: "No Operation".to_string(),
                description: "Passes data through unchanged".to_string(),
                versions: vec![1],
                default_version: 1,
                groups: vec!["organization".to_string()],
                inputs: 1,
                outputs: 1,
                credentials: vec![],
            },
        }
    }
}

impl Default for NoOp {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeType for NoOp {
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
