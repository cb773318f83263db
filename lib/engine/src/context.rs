//! Per-node execution context.
//!
//! The step task builds one [`NodeExecutionContext`] per frame and hands
//! it to the node's `execute`. The context is the node's entire runtime
//! surface: input items, expression-resolving parameter access,
//! credentials, HTTP and binary helpers, workflow metadata, and a
//! contextual logger. All reads are over the current run-state snapshot;
//! nothing here mutates it.
//!
//! The collaborator traits at the bottom are the seams to the worker
//! process ([`CredentialResolving`], [`HttpRequester`], [`BinaryStore`]);
//! their implementations live outside the engine and are threaded in from
//! bootstrap through [`Collaborators`]; there are no process-wide
//! singletons.

use crate::definition::{CredentialRef, WorkflowDefinition, WorkflowNode};
use crate::error::{EngineError, NodeError};
use crate::expression::{self, Scope};
use crate::item::{BinaryData, ExecutionItem};
use crate::state::{PortData, RunData};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// The execution mode reported to nodes.
pub const EXECUTION_MODE: &str = "integrated";

/// Collaborator handles threaded from worker bootstrap into the step task.
#[derive(Clone)]
pub struct Collaborators {
    /// Credential resolution and request authentication.
    pub credentials: Arc<dyn CredentialResolving>,
    /// Outbound HTTP.
    pub http: Arc<dyn HttpRequester>,
    /// Binary payload storage.
    pub binary: Arc<dyn BinaryStore>,
    /// Binary payloads at or below this many bytes stay inline.
    pub inline_binary_threshold: usize,
}

/// The runtime surface a node sees while executing.
pub struct NodeExecutionContext<'a> {
    node: &'a WorkflowNode,
    definition: &'a WorkflowDefinition,
    input: &'a PortData,
    run_data: &'a RunData,
    execution_id: &'a str,
    run_index: u32,
    now: DateTime<Utc>,
    collaborators: &'a Collaborators,
    wait_till: Option<DateTime<Utc>>,
    credential_cache: HashMap<String, JsonValue>,
}

impl<'a> NodeExecutionContext<'a> {
    /// Builds a context for one node run.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: &'a WorkflowNode,
        definition: &'a WorkflowDefinition,
        input: &'a PortData,
        run_data: &'a RunData,
        execution_id: &'a str,
        run_index: u32,
        now: DateTime<Utc>,
        collaborators: &'a Collaborators,
    ) -> Self {
        Self {
            node,
            definition,
            input,
            run_data,
            execution_id,
            run_index,
            now,
            collaborators,
            wait_till: None,
            credential_cache: HashMap::new(),
        }
    }

    /// Items on the given input port (empty when the port is absent).
    #[must_use]
    pub fn input_data(&self, port: usize) -> &[ExecutionItem] {
        self.input.main.get(port).map_or(&[], Vec::as_slice)
    }

    /// Number of input ports with data prepared.
    #[must_use]
    pub fn input_port_count(&self) -> usize {
        self.input.main.len()
    }

    /// The current node record.
    #[must_use]
    pub fn node(&self) -> &WorkflowNode {
        self.node
    }

    /// Workflow id, or empty when unassigned.
    #[must_use]
    pub fn workflow_id(&self) -> &str {
        self.definition.id.as_deref().unwrap_or("")
    }

    /// Workflow name, or empty when unnamed.
    #[must_use]
    pub fn workflow_name(&self) -> &str {
        self.definition.name.as_deref().unwrap_or("")
    }

    /// The execution id.
    #[must_use]
    pub fn execution_id(&self) -> &str {
        self.execution_id
    }

    /// The execution mode.
    #[must_use]
    pub fn mode(&self) -> &'static str {
        EXECUTION_MODE
    }

    /// Run index of this node run.
    #[must_use]
    pub fn run_index(&self) -> u32 {
        self.run_index
    }

    /// Whether failures should attach to output items instead of
    /// stopping the execution.
    #[must_use]
    pub fn continue_on_fail(&self) -> bool {
        self.node.continue_on_fail
    }

    /// Requests suspension until the given instant (Wait-node semantics).
    pub fn set_wait_till(&mut self, instant: DateTime<Utc>) {
        self.wait_till = Some(instant);
    }

    /// The requested suspension instant, if any.
    #[must_use]
    pub fn wait_till(&self) -> Option<DateTime<Utc>> {
        self.wait_till
    }

    /// The expression scope for one input item.
    fn scope(&self, item_index: usize) -> Scope<'_> {
        let items = self.input_data(0);
        Scope {
            current_item: items.get(item_index),
            input_items: items,
            run_data: self.run_data,
            parameters: &self.node.parameters,
            workflow_id: self.workflow_id().to_string(),
            workflow_name: self.workflow_name().to_string(),
            execution_id: self.execution_id.to_string(),
            item_index,
            run_index: self.run_index,
            now: self.now,
        }
    }

    /// Resolves a parameter for one item, evaluating `=` expressions.
    ///
    /// # Errors
    ///
    /// Returns an operation error when the parameter is missing or its
    /// expression fails.
    pub fn node_parameter(&self, name: &str, item_index: usize) -> Result<JsonValue, NodeError> {
        let raw = self.node.parameters.get(name).ok_or_else(|| {
            NodeError::operation(format!("parameter '{name}' is missing"))
        })?;
        expression::resolve_value(raw, &self.scope(item_index))
            .map_err(|e| NodeError::operation(format!("parameter '{name}': {e}")))
    }

    /// Resolves a parameter, falling back when absent or failing.
    #[must_use]
    pub fn node_parameter_or(
        &self,
        name: &str,
        item_index: usize,
        fallback: JsonValue,
    ) -> JsonValue {
        match self.node.parameters.get(name) {
            None => fallback,
            Some(raw) => expression::resolve_value(raw, &self.scope(item_index))
                .unwrap_or(fallback),
        }
    }

    /// Evaluates a free-standing expression string for one item. Accepts
    /// both `=`-prefixed and bare template text.
    ///
    /// # Errors
    ///
    /// Returns an operation error when evaluation fails.
    pub fn evaluate(&self, text: &str, item_index: usize) -> Result<JsonValue, NodeError> {
        let template = text.strip_prefix('=').unwrap_or(text);
        expression::evaluate_template(template, &self.scope(item_index))
            .map_err(|e| NodeError::operation(e.to_string()))
    }

    /// Decrypted credentials of the given type, resolved through the
    /// credential resolver and cached for the rest of this node run.
    ///
    /// # Errors
    ///
    /// Returns an operation error when the node declares no credential of
    /// this type or resolution fails.
    pub async fn credentials(&mut self, cred_type: &str) -> Result<JsonValue, NodeError> {
        if let Some(cached) = self.credential_cache.get(cred_type) {
            return Ok(cached.clone());
        }
        let cred_ref = self.node.credentials.get(cred_type).ok_or_else(|| {
            NodeError::operation(format!(
                "node '{}' declares no '{cred_type}' credential",
                self.node.name
            ))
        })?;
        let resolved = self
            .collaborators
            .credentials
            .resolve(self.node, cred_type, cred_ref, false)
            .await
            .map_err(|e| NodeError::operation(e.to_string()))?;
        self.credential_cache
            .insert(cred_type.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Performs an HTTP request.
    ///
    /// # Errors
    ///
    /// Returns an api error for transport failures.
    pub async fn http_request(&self, options: RequestOptions) -> Result<HttpResponse, NodeError> {
        self.collaborators.http.request(options).await
    }

    /// Performs an HTTP request decorated with the node's credentials of
    /// the given type.
    ///
    /// # Errors
    ///
    /// Returns an operation error for credential failures and an api
    /// error for transport failures.
    pub async fn http_request_with_credentials(
        &mut self,
        cred_type: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse, NodeError> {
        let credentials = self.credentials(cred_type).await?;
        let decorated = self
            .collaborators
            .credentials
            .authenticate(cred_type, &credentials, options, self.node)
            .await
            .map_err(|e| NodeError::operation(e.to_string()))?;
        self.collaborators.http.request(decorated).await
    }

    /// Prepares binary data: inline below the configured threshold,
    /// offloaded through the binary store above it.
    ///
    /// # Errors
    ///
    /// Returns an operation error when the store rejects the payload.
    pub async fn prepare_binary(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
        file_name: Option<&str>,
    ) -> Result<BinaryData, NodeError> {
        if bytes.len() <= self.collaborators.inline_binary_threshold {
            let mut binary = BinaryData::inline(&bytes, mime_type);
            if let Some(name) = file_name {
                binary = binary.with_file_name(name);
            }
            return Ok(binary);
        }

        let stored = self
            .collaborators
            .binary
            .store(
                &BinaryScope {
                    workflow_id: self.workflow_id().to_string(),
                    execution_id: self.execution_id.to_string(),
                },
                bytes,
                BinaryUploadMetadata {
                    file_name: file_name.map(ToString::to_string),
                    mime_type: Some(mime_type.to_string()),
                },
            )
            .await
            .map_err(|e| NodeError::operation(e.to_string()))?;

        let mut binary = BinaryData::reference(stored.id, mime_type, stored.file_size);
        if let Some(name) = file_name {
            binary = binary.with_file_name(name);
        }
        Ok(binary)
    }

    /// Materializes a binary attachment as bytes, inline or from the
    /// store.
    ///
    /// # Errors
    ///
    /// Returns an operation error for malformed inline data or store
    /// failures.
    pub async fn binary_bytes(&self, binary: &BinaryData) -> Result<Vec<u8>, NodeError> {
        if binary.is_inline() {
            return binary
                .decode_inline()
                .ok_or_else(|| NodeError::operation("malformed inline binary data"));
        }
        let id = binary
            .id
            .as_deref()
            .ok_or_else(|| NodeError::operation("binary data has neither payload nor id"))?;
        self.collaborators
            .binary
            .as_bytes(id)
            .await
            .map_err(|e| NodeError::operation(e.to_string()))
    }

    /// A logger carrying node and execution fields.
    #[must_use]
    pub fn logger(&self) -> ContextLogger<'_> {
        ContextLogger {
            node: &self.node.name,
            execution_id: self.execution_id,
        }
    }
}

/// Leveled logging sink with execution context attached to every line.
pub struct ContextLogger<'a> {
    node: &'a str,
    execution_id: &'a str,
}

impl ContextLogger<'_> {
    pub fn debug(&self, message: &str) {
        tracing::debug!(node = %self.node, execution = %self.execution_id, "{message}");
    }

    pub fn info(&self, message: &str) {
        tracing::info!(node = %self.node, execution = %self.execution_id, "{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(node = %self.node, execution = %self.execution_id, "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(node = %self.node, execution = %self.execution_id, "{message}");
    }
}

/// An outbound HTTP request, before credential decoration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// HTTP method, upper-case.
    pub method: String,
    /// Request URL.
    pub url: String,
    /// Header map.
    pub headers: BTreeMap<String, String>,
    /// Query parameters appended to the URL.
    pub query: Vec<(String, String)>,
    /// JSON body, if any.
    pub body: Option<JsonValue>,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl RequestOptions {
    /// Creates options for the given method and URL.
    #[must_use]
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_uppercase(),
            url: url.into(),
            ..Self::default()
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Sets a JSON body.
    #[must_use]
    pub fn with_body(mut self, body: JsonValue) -> Self {
        self.body = Some(body);
        self
    }
}

/// An HTTP response surfaced to nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response headers.
    pub headers: BTreeMap<String, String>,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Returns true for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The body as text (lossy).
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The body parsed as JSON, if it is JSON.
    #[must_use]
    pub fn json(&self) -> Option<JsonValue> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Credential resolution seam (implemented by the connect crate).
#[async_trait]
pub trait CredentialResolving: Send + Sync {
    /// Produces decrypted credential data for a node's credential
    /// reference. With `raw` set, stored fields return verbatim without
    /// expression resolution.
    async fn resolve(
        &self,
        node: &WorkflowNode,
        cred_type: &str,
        cred_ref: &CredentialRef,
        raw: bool,
    ) -> Result<JsonValue, EngineError>;

    /// Decorates request options per the credential type's declared
    /// authentication.
    async fn authenticate(
        &self,
        cred_type: &str,
        credentials: &JsonValue,
        options: RequestOptions,
        node: &WorkflowNode,
    ) -> Result<RequestOptions, EngineError>;
}

/// Outbound HTTP seam (implemented by the connect crate).
#[async_trait]
pub trait HttpRequester: Send + Sync {
    /// Performs the request.
    async fn request(&self, options: RequestOptions) -> Result<HttpResponse, NodeError>;
}

/// Identifies the execution a binary payload belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryScope {
    /// Owning workflow.
    pub workflow_id: String,
    /// Owning execution.
    pub execution_id: String,
}

/// Upload metadata for a stored payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryUploadMetadata {
    /// Original file name.
    pub file_name: Option<String>,
    /// MIME type.
    pub mime_type: Option<String>,
}

/// Result of storing a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBinary {
    /// Mode-namespaced id (`"filesystem:…"` / `"s3:…"`).
    pub id: String,
    /// Stored size in bytes.
    pub file_size: u64,
}

/// Metadata of a stored payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMetadata {
    /// Stored size in bytes.
    pub file_size: u64,
    /// Original file name, if recorded.
    pub file_name: Option<String>,
    /// MIME type, if recorded.
    pub mime_type: Option<String>,
}

/// Binary storage seam (implemented by the connect crate).
#[async_trait]
pub trait BinaryStore: Send + Sync {
    /// Stores a payload and returns its mode-namespaced id.
    async fn store(
        &self,
        scope: &BinaryScope,
        bytes: Vec<u8>,
        metadata: BinaryUploadMetadata,
    ) -> Result<StoredBinary, EngineError>;

    /// Reads a payload back.
    async fn as_bytes(&self, id: &str) -> Result<Vec<u8>, EngineError>;

    /// Reads a payload's metadata.
    async fn metadata(&self, id: &str) -> Result<BinaryMetadata, EngineError>;

    /// Deletes a payload.
    async fn delete(&self, id: &str) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_options_builder() {
        let options = RequestOptions::new("post", "https://api.example.com/items")
            .with_header("Accept", "application/json")
            .with_query("page", "2")
            .with_body(json!({"name": "x"}));

        assert_eq!(options.method, "POST");
        assert_eq!(
            options.headers.get("Accept").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(options.query, vec![("page".to_string(), "2".to_string())]);
        assert!(options.body.is_some());
    }

    #[test]
    fn http_response_json_parsing() {
        let response = HttpResponse {
            status: 200,
            headers: BTreeMap::new(),
            body: br#"{"ok": true}"#.to_vec(),
        };
        assert!(response.is_success());
        assert_eq!(response.json(), Some(json!({"ok": true})));

        let not_json = HttpResponse {
            status: 500,
            headers: BTreeMap::new(),
            body: b"oops".to_vec(),
        };
        assert!(!not_json.is_success());
        assert_eq!(not_json.json(), None);
        assert_eq!(not_json.text(), "oops");
    }
}
