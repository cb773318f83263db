//! The built-in node type provider.

use cascade_engine::registry::{KnownTypes, NodeType, NodeTypeProvider, RegistryError};
use std::collections::HashMap;
use std::sync::Arc;

/// Serves the built-in node set.
///
/// Versioned types (like `cascade.set`) register one instance per
/// implemented version; resolution picks the instance whose version list
/// contains the request, defaulting to the type's `default_version`.
pub struct BuiltinNodeTypes {
    types: HashMap<String, Vec<Arc<dyn NodeType>>>,
}

impl BuiltinNodeTypes {
    /// Creates the provider with every built-in type registered.
    #[must_use]
    pub fn new() -> Self {
        let mut provider = Self {
            types: HashMap::new(),
        };
        provider.register(Arc::new(crate::manual_trigger::ManualTrigger::new()));
        provider.register(Arc::new(crate::set::SetV1::new()));
        provider.register(Arc::new(crate::set::SetV2::new()));
        provider.register(Arc::new(crate::http_request::HttpRequest::new()));
        provider.register(Arc::new(crate::if_node::If::new()));
        provider.register(Arc::new(crate::merge::Merge::new()));
        provider.register(Arc::new(crate::wait::Wait::new()));
        provider.register(Arc::new(crate::no_op::NoOp::new()));
        provider
    }

    /// Registers one node type instance under its descriptor name.
    pub fn register(&mut self, node_type: Arc<dyn NodeType>) {
        self.types
            .entry(node_type.description().name.clone())
            .or_default()
            .push(node_type);
    }
}

impl Default for BuiltinNodeTypes {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTypeProvider for BuiltinNodeTypes {
    fn by_name(&self, type_name: &str) -> Option<Arc<dyn NodeType>> {
        let instances = self.types.get(type_name)?;
        let default_version = instances
            .iter()
            .map(|t| t.description().default_version)
            .max()?;
        instances
            .iter()
            .find(|t| t.description().versions.contains(&default_version))
            .or(instances.first())
            .cloned()
    }

    fn by_name_and_version(
        &self,
        type_name: &str,
        version: Option<u32>,
    ) -> Result<Arc<dyn NodeType>, RegistryError> {
        let instances =
            self.types
                .get(type_name)
                .ok_or_else(|| RegistryError::UnknownNodeType {
                    type_name: type_name.to_string(),
                })?;
        let Some(version) = version else {
            return self
                .by_name(type_name)
                .ok_or_else(|| RegistryError::UnknownNodeType {
                    type_name: type_name.to_string(),
                });
        };
        instances
            .iter()
            .find(|t| t.description().versions.contains(&version))
            .cloned()
            .ok_or(RegistryError::UnknownVersion {
                type_name: type_name.to_string(),
                version,
            })
    }

    fn known_types(&self) -> KnownTypes {
        let mut nodes: Vec<String> = self.types.keys().cloned().collect();
        nodes.sort();
        KnownTypes {
            nodes,
            credentials: vec![
                "httpBasicAuth".to_string(),
                "httpHeaderAuth".to_string(),
                "httpQueryAuth".to_string(),
                "httpBearerAuth".to_string(),
                "oauth2Api".to_string(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_default_versions() {
        let provider = BuiltinNodeTypes::new();

        let set = provider.by_name("cascade.set").expect("set");
        assert_eq!(set.description().default_version, 2);

        let resolved = provider
            .by_name_and_version("cascade.set", None)
            .expect("default resolution");
        assert!(resolved.description().versions.contains(&2));
    }

    #[test]
    fn resolves_pinned_versions() {
        let provider = BuiltinNodeTypes::new();

        let v1 = provider
            .by_name_and_version("cascade.set", Some(1))
            .expect("v1");
        assert!(v1.description().versions.contains(&1));

        assert!(matches!(
            provider.by_name_and_version("cascade.set", Some(9)),
            Err(RegistryError::UnknownVersion { version: 9, .. })
        ));
    }

    #[test]
    fn unknown_type_errors() {
        let provider = BuiltinNodeTypes::new();
        assert!(!provider.has("cascade.ghost"));
        assert!(matches!(
            provider.by_name_and_version("cascade.ghost", None),
            Err(RegistryError::UnknownNodeType { .. })
        ));
    }

    #[test]
    fn catalog_lists_all_builtins() {
        let provider = BuiltinNodeTypes::new();
        let known = provider.known_types();
        assert!(known.nodes.contains(&"cascade.manualTrigger".to_string()));
        assert!(known.nodes.contains(&"cascade.wait".to_string()));
        assert!(known.credentials.contains(&"httpHeaderAuth".to_string()));
    }
}
