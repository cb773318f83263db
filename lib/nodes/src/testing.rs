//! Shared fixtures for node tests.

use async_trait::async_trait;
use cascade_engine::context::{
    BinaryMetadata, BinaryScope, BinaryStore, BinaryUploadMetadata, Collaborators,
    CredentialResolving, HttpRequester, HttpResponse, NodeExecutionContext, RequestOptions,
    StoredBinary,
};
use cascade_engine::definition::{CredentialRef, WorkflowDefinition, WorkflowNode};
use cascade_engine::error::{EngineError, NodeError};
use cascade_engine::item::ExecutionItem;
use cascade_engine::state::{PortData, RunData};
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Credential resolver returning a canned object and decorating requests
/// with a marker header.
pub struct FixedCredentials(pub JsonValue);

#[async_trait]
impl CredentialResolving for FixedCredentials {
    async fn resolve(
        &self,
        _node: &WorkflowNode,
        _cred_type: &str,
        _cred_ref: &CredentialRef,
        _raw: bool,
    ) -> Result<JsonValue, EngineError> {
        Ok(self.0.clone())
    }

    async fn authenticate(
        &self,
        _cred_type: &str,
        credentials: &JsonValue,
        options: RequestOptions,
        _node: &WorkflowNode,
    ) -> Result<RequestOptions, EngineError> {
        let token = credentials
            .get("token")
            .and_then(JsonValue::as_str)
            .unwrap_or("");
        Ok(options.with_header("Authorization", format!("Bearer {token}")))
    }
}

/// HTTP fake recording requests and replaying a canned response.
pub struct CannedHttp {
    pub requests: Mutex<Vec<RequestOptions>>,
    pub response: HttpResponse,
}

impl CannedHttp {
    pub fn replying(status: u16, body: &str) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            response: HttpResponse {
                status,
                headers: BTreeMap::new(),
                body: body.as_bytes().to_vec(),
            },
        }
    }
}

#[async_trait]
impl HttpRequester for CannedHttp {
    async fn request(&self, options: RequestOptions) -> Result<HttpResponse, NodeError> {
        self.requests.lock().unwrap().push(options);
        Ok(self.response.clone())
    }
}

/// Binary store keeping payloads in memory.
#[derive(Default)]
pub struct MemoryBinary {
    pub data: Mutex<BTreeMap<String, Vec<u8>>>,
}

#[async_trait]
impl BinaryStore for MemoryBinary {
    async fn store(
        &self,
        _scope: &BinaryScope,
        bytes: Vec<u8>,
        _metadata: BinaryUploadMetadata,
    ) -> Result<StoredBinary, EngineError> {
        let mut data = self.data.lock().unwrap();
        let id = format!("memory:{}", data.len());
        let file_size = bytes.len() as u64;
        data.insert(id.clone(), bytes);
        Ok(StoredBinary { id, file_size })
    }

    async fn as_bytes(&self, id: &str) -> Result<Vec<u8>, EngineError> {
        self.data
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::Bookkeeping {
                message: format!("unknown binary id {id}"),
            })
    }

    async fn metadata(&self, id: &str) -> Result<BinaryMetadata, EngineError> {
        let size = self.as_bytes(id).await?.len() as u64;
        Ok(BinaryMetadata {
            file_size: size,
            file_name: None,
            mime_type: None,
        })
    }

    async fn delete(&self, id: &str) -> Result<(), EngineError> {
        self.data.lock().unwrap().remove(id);
        Ok(())
    }
}

/// Owns everything a [`NodeExecutionContext`] borrows.
pub struct TestBed {
    pub definition: WorkflowDefinition,
    pub input: PortData,
    pub run_data: RunData,
    pub collaborators: Collaborators,
}

impl TestBed {
    /// Builds a test bed around a single node and its port-0 input.
    pub fn new(node_json: JsonValue, items: Vec<ExecutionItem>) -> Self {
        Self::with_ports(node_json, vec![items])
    }

    /// Builds a test bed with explicit per-port input.
    pub fn with_ports(node_json: JsonValue, ports: Vec<Vec<ExecutionItem>>) -> Self {
        let node: WorkflowNode = serde_json::from_value(node_json).expect("node json");
        let definition = WorkflowDefinition {
            id: Some("wf-test".to_string()),
            name: Some("node test".to_string()),
            nodes: vec![node],
            ..WorkflowDefinition::default()
        };
        Self {
            definition,
            input: PortData { main: ports },
            run_data: RunData::new(),
            collaborators: Collaborators {
                credentials: Arc::new(FixedCredentials(serde_json::json!({}))),
                http: Arc::new(CannedHttp::replying(200, "{}")),
                binary: Arc::new(MemoryBinary::default()),
                inline_binary_threshold: 1024,
            },
        }
    }

    /// Swaps in an HTTP fake.
    pub fn with_http(mut self, http: Arc<CannedHttp>) -> Self {
        self.collaborators.http = http;
        self
    }

    /// Swaps in a credential resolver.
    pub fn with_credentials(mut self, credentials: Arc<FixedCredentials>) -> Self {
        self.collaborators.credentials = credentials;
        self
    }

    /// Builds the context for the node under test.
    pub fn context(&self) -> NodeExecutionContext<'_> {
        NodeExecutionContext::new(
            &self.definition.nodes[0],
            &self.definition,
            &self.input,
            &self.run_data,
            "exec-node-test",
            0,
            Utc::now(),
            &self.collaborators,
        )
    }
}

/// Builds the JSON for a node record.
pub fn node_json(type_name: &str, parameters: JsonValue) -> JsonValue {
    serde_json::json!({
        "id": "node-under-test",
        "name": "Node",
        "type": type_name,
        "typeVersion": 1,
        "position": [0.0, 0.0],
        "parameters": parameters
    })
}
