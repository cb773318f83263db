//! Durable wait.
//!
//! Requests suspension of the execution until a wall-clock instant. The
//! step task stops after this node, the orchestration arms a durable
//! timer, and the parked downstream frames run when it fires.

use async_trait::async_trait;
use cascade_engine::context::NodeExecutionContext;
use cascade_engine::error::NodeError;
use cascade_engine::item::ExecutionItem;
use cascade_engine::registry::{NodeType, NodeTypeDescription};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

pub struct Wait {
    description: NodeTypeDescription,
}

impl Wait {
    #[must_use]
    pub fn new() -> Self {
        Self {
            description: NodeTypeDescription {
                name: "cascade.wait".to_string(),
                display_name: "Wait".to_string(),
                description: "Pauses the execution until a point in time".to_string(),
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

impl Default for Wait {
    fn default() -> Self {
        Self::new()
    }
}

fn interval_target(context: &NodeExecutionContext<'_>, now: DateTime<Utc>) -> Result<DateTime<Utc>, NodeError> {
    let amount = context
        .node_parameter_or("amount", 0, json!(1))
        .as_f64()
        .unwrap_or(1.0);
    let unit = context
        .node_parameter_or("unit", 0, json!("seconds"))
        .as_str()
        .unwrap_or("seconds")
        .to_string();

    let millis = match unit.as_str() {
        "seconds" => amount * 1_000.0,
        "minutes" => amount * 60_000.0,
        "hours" => amount * 3_600_000.0,
        "days" => amount * 86_400_000.0,
        other => {
            return Err(NodeError::operation(format!(
                "unknown wait unit '{other}'"
            )));
        }
    };
    Ok(now + Duration::milliseconds(millis as i64))
}

#[async_trait]
impl NodeType for Wait {
    fn description(&self) -> &NodeTypeDescription {
        &self.description
    }

    async fn execute(
        &self,
        context: &mut NodeExecutionContext<'_>,
    ) -> Result<Vec<Vec<ExecutionItem>>, NodeError> {
        let now = Utc::now();
        let resume = context
            .node_parameter_or("resume", 0, json!("timeInterval"))
            .as_str()
            .unwrap_or("timeInterval")
            .to_string();

        let target = match resume.as_str() {
            "timeInterval" => interval_target(context, now)?,
            "specificTime" => {
                let text = context.node_parameter("dateTime", 0)?;
                let text = text.as_str().ok_or_else(|| {
                    NodeError::operation("parameter 'dateTime' must be a string")
                })?;
                DateTime::parse_from_rfc3339(text)
                    .map_err(|e| {
                        NodeError::operation(format!("invalid 'dateTime' value: {e}"))
                    })?
                    .with_timezone(&Utc)
            }
            other => {
                return Err(NodeError::operation(format!(
                    "unknown resume mode '{other}'"
                )));
            }
        };

        // An instant already in the past needs no timer.
        if target > now {
            context.set_wait_till(target);
        }

        Ok(vec![context.input_data(0).to_vec()])
    }
}
