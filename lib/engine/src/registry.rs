//! Node type registry traits.
//!
//! Node types are served by a [`NodeTypeProvider`]; the concrete provider
//! (built-in nodes, package loading) lives outside the engine. The engine
//! only needs name/version resolution and the `execute` entry point.

use crate::context::NodeExecutionContext;
use crate::error::NodeError;
use crate::item::ExecutionItem;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Static description of a node type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTypeDescription {
    /// Type name, e.g. `cascade.set`.
    pub name: String,
    /// Human-readable display name.
    pub display_name: String,
    /// One-line description.
    pub description: String,
    /// Versions this descriptor implements.
    pub versions: Vec<u32>,
    /// Version used when a workflow does not pin one.
    pub default_version: u32,
    /// Groups, e.g. `["trigger"]` or `["transform"]`.
    pub groups: Vec<String>,
    /// Number of main input ports.
    pub inputs: usize,
    /// Number of main output ports.
    pub outputs: usize,
    /// Credential type names this node can use.
    pub credentials: Vec<String>,
}

impl NodeTypeDescription {
    /// Returns true if this type starts executions (has no data inputs).
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        self.groups.iter().any(|g| g == "trigger")
    }
}

/// A node type: a description plus its side-effecting `execute`.
#[async_trait]
pub trait NodeType: Send + Sync {
    /// Returns the static description.
    fn description(&self) -> &NodeTypeDescription;

    /// Runs the node against the prepared execution context.
    ///
    /// Returns items per output port (outer index = port).
    ///
    /// # Errors
    ///
    /// Returns a [`NodeError`] when the node rejects its configuration or
    /// an external service fails.
    async fn execute(
        &self,
        context: &mut NodeExecutionContext<'_>,
    ) -> Result<Vec<Vec<ExecutionItem>>, NodeError>;
}

/// Catalog of known type names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownTypes {
    /// Registered node type names.
    pub nodes: Vec<String>,
    /// Registered credential type names.
    pub credentials: Vec<String>,
}

/// Serves node types by `(name, version)`.
pub trait NodeTypeProvider: Send + Sync {
    /// Returns the base descriptor for a type (its default version).
    fn by_name(&self, type_name: &str) -> Option<Arc<dyn NodeType>>;

    /// Resolves a type at a specific version.
    ///
    /// When `version` is `None` the default version applies; versioned
    /// bundles select the inner descriptor matching the request.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown types or unimplemented versions.
    fn by_name_and_version(
        &self,
        type_name: &str,
        version: Option<u32>,
    ) -> Result<Arc<dyn NodeType>, RegistryError>;

    /// Returns the catalog of registered type names.
    fn known_types(&self) -> KnownTypes;

    /// Returns true if a type is registered.
    fn has(&self, type_name: &str) -> bool {
        self.by_name(type_name).is_some()
    }
}

/// Errors from type resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No type registered under this name.
    UnknownNodeType { type_name: String },
    /// The type exists but not at the requested version.
    UnknownVersion { type_name: String, version: u32 },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNodeType { type_name } => {
                write!(f, "unknown node type: {type_name}")
            }
            Self::UnknownVersion { type_name, version } => {
                write!(f, "node type {type_name} has no version {version}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<RegistryError> for crate::error::EngineError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::UnknownNodeType { type_name } => Self::UnknownNodeType { type_name },
            RegistryError::UnknownVersion { type_name, version } => Self::UnknownNodeType {
                type_name: format!("{type_name}@v{version}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description(groups: &[&str]) -> NodeTypeDescription {
        NodeTypeDescription {
            name: "cascade.test".to_string(),
            display_name: "Test".to_string(),
            description: "Test node".to_string(),
            versions: vec![1],
            default_version: 1,
            groups: groups.iter().map(ToString::to_string).collect(),
            inputs: 1,
            outputs: 1,
            credentials: vec![],
        }
    }

    #[test]
    fn trigger_detection() {
        assert!(description(&["trigger"]).is_trigger());
        assert!(!description(&["transform"]).is_trigger());
    }

    #[test]
    fn registry_error_display() {
        let err = RegistryError::UnknownNodeType {
            type_name: "cascade.ghost".to_string(),
        };
        assert_eq!(err.to_string(), "unknown node type: cascade.ghost");
    }
}
