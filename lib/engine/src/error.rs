//! Error types for the execution engine.
//!
//! Two layers:
//! - [`NodeError`]: what a node's `execute` returns when it fails:
//!   either the node rejected its configuration/inputs (operation) or an
//!   external service returned a failure (api).
//! - [`SerializedError`]: the tagged, JSON-safe wire form recorded in run
//!   data and crossing the scheduler boundary. The `__type` tag preserves
//!   the error kind through history round-trips.
//!
//! [`EngineError`] covers engine-internal failures (unknown node types,
//! malformed definitions); these surface as `Generic` wire errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The kind tag carried through serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Any other failure (including engine-internal ones).
    Generic,
    /// A node rejected its configuration or inputs.
    NodeOperation,
    /// An external service returned a failure to a node.
    NodeApi,
}

/// An error raised by a node's `execute`.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeError {
    /// The node rejected its configuration or inputs.
    Operation {
        message: String,
        description: Option<String>,
    },
    /// An external service returned a failure.
    Api {
        message: String,
        http_code: Option<u16>,
        description: Option<String>,
    },
}

impl NodeError {
    /// Creates an operation error with just a message.
    #[must_use]
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation {
            message: message.into(),
            description: None,
        }
    }

    /// Creates an api error with just a message.
    #[must_use]
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
            http_code: None,
            description: None,
        }
    }

    /// Attaches a longer description.
    #[must_use]
    pub fn with_description(mut self, text: impl Into<String>) -> Self {
        match &mut self {
            Self::Operation { description, .. } | Self::Api { description, .. } => {
                *description = Some(text.into());
            }
        }
        self
    }

    /// Attaches an HTTP status code (api errors only; no-op otherwise).
    #[must_use]
    pub fn with_http_code(mut self, code: u16) -> Self {
        if let Self::Api { http_code, .. } = &mut self {
            *http_code = Some(code);
        }
        self
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation { message, .. } => write!(f, "{message}"),
            Self::Api {
                message, http_code, ..
            } => match http_code {
                Some(code) => write!(f, "{message} (status {code})"),
                None => write!(f, "{message}"),
            },
        }
    }
}

impl std::error::Error for NodeError {}

/// The tagged, JSON-safe error recorded in run data and history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedError {
    /// Error kind, preserved through round-trips.
    #[serde(rename = "__type")]
    pub kind: ErrorKind,
    /// Primary message.
    pub message: String,
    /// Error name (e.g. the originating type), if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Captured stack/backtrace text, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Longer human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Name of the node the error originated in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// HTTP status code for api errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_code: Option<u16>,
    /// Free-form context attached at the failure site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<JsonValue>,
    /// Severity level (e.g. "warning", "error").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// Functional area the error belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functionality: Option<String>,
    /// When the error was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Source line, when a location is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
}

impl SerializedError {
    /// Creates a generic error with just a message.
    #[must_use]
    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Generic,
            message: message.into(),
            name: None,
            stack: None,
            description: None,
            node: None,
            http_code: None,
            context: None,
            level: None,
            functionality: None,
            timestamp: None,
            line_number: None,
        }
    }

    /// Converts a node error into its wire form, attributed to `node`.
    #[must_use]
    pub fn from_node_error(error: &NodeError, node: impl Into<String>) -> Self {
        let mut serialized = match error {
            NodeError::Operation {
                message,
                description,
            } => Self {
                kind: ErrorKind::NodeOperation,
                description: description.clone(),
                ..Self::generic(message.clone())
            },
            NodeError::Api {
                message,
                http_code,
                description,
            } => Self {
                kind: ErrorKind::NodeApi,
                http_code: *http_code,
                description: description.clone(),
                ..Self::generic(message.clone())
            },
        };
        serialized.node = Some(node.into());
        serialized
    }

    /// Stamps the error with the current time.
    #[must_use]
    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    /// Attaches the originating node name.
    #[must_use]
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node.as_deref() {
            Some(node) => write!(f, "{} [node: {node}]", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for SerializedError {}

/// Engine-internal failures (not node failures).
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The requested node type is not registered.
    UnknownNodeType { type_name: String },
    /// A connection references a node that does not exist.
    UnknownConnectionTarget { source: String, target: String },
    /// The connection graph contains a cycle.
    CycleDetected,
    /// A frame referenced a node missing from the definition.
    NodeNotFound { name: String },
    /// An expression failed to parse or evaluate.
    Expression { message: String },
    /// A credential could not be resolved.
    Credential { message: String },
    /// Run-state bookkeeping violated an invariant.
    Bookkeeping { message: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNodeType { type_name } => {
                write!(f, "unknown node type: {type_name}")
            }
            Self::UnknownConnectionTarget { source, target } => {
                write!(f, "connection from '{source}' targets unknown node '{target}'")
            }
            Self::CycleDetected => write!(f, "workflow connections contain a cycle"),
            Self::NodeNotFound { name } => write!(f, "node not found: {name}"),
            Self::Expression { message } => write!(f, "expression error: {message}"),
            Self::Credential { message } => write!(f, "credential error: {message}"),
            Self::Bookkeeping { message } => {
                write!(f, "execution bookkeeping violation: {message}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<EngineError> for SerializedError {
    fn from(error: EngineError) -> Self {
        let mut serialized = Self::generic(error.to_string());
        serialized.name = Some("EngineError".to_string());
        serialized
    }
}
