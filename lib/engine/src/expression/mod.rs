//! The expression language resolved inside the step task.
//!
//! Parameter strings beginning with `=` are templates: literal text with
//! `{{ … }}` segments evaluated against the current item and the
//! accumulated run data. A template that is a single `{{ … }}` yields the
//! typed value; otherwise segments stringify and concatenate.
//!
//! The language is a small, enumerated surface: host names (`$json`,
//! `$node`, `$input`, `$workflow`, …), optional chaining, `??`, the usual
//! operators, and a fixed set of pure methods. There is no general
//! scripting engine, and evaluation never has side effects.

mod eval;
mod lexer;
mod parser;

use crate::item::ExecutionItem;
use crate::state::RunData;
use chrono::{DateTime, Utc};
use eval::EvalValue;
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Errors from expression handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    /// Tokenization failed.
    Lex { position: usize, message: String },
    /// Parsing failed.
    Parse { message: String },
    /// Evaluation failed.
    Eval { message: String },
}

impl fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lex { position, message } => {
                write!(f, "lex error at offset {position}: {message}")
            }
            Self::Parse { message } => write!(f, "parse error: {message}"),
            Self::Eval { message } => write!(f, "eval error: {message}"),
        }
    }
}

impl std::error::Error for ExpressionError {}

impl From<ExpressionError> for crate::error::EngineError {
    fn from(error: ExpressionError) -> Self {
        Self::Expression {
            message: error.to_string(),
        }
    }
}

/// The host surface an expression evaluates against.
#[derive(Debug, Clone)]
pub struct Scope<'a> {
    /// The current item (`$json`, `$binary`); absent for item-less nodes.
    pub current_item: Option<&'a ExecutionItem>,
    /// All items on input port 0 (`$input`).
    pub input_items: &'a [ExecutionItem],
    /// Accumulated run data (`$node["Name"]`).
    pub run_data: &'a RunData,
    /// The current node's raw parameters (`$parameter`).
    pub parameters: &'a Map<String, JsonValue>,
    /// Workflow identity (`$workflow`).
    pub workflow_id: String,
    /// Workflow name (`$workflow.name`).
    pub workflow_name: String,
    /// Execution id (`$executionId`).
    pub execution_id: String,
    /// Index of the current item (`$itemIndex`).
    pub item_index: usize,
    /// Run index of the current node run (`$runIndex`).
    pub run_index: u32,
    /// The instant `$now` reports.
    pub now: DateTime<Utc>,
}

impl Scope<'_> {
    fn current_item(&self) -> Option<&ExecutionItem> {
        self.current_item
    }

    /// Resolves `$node["name"]`: the latest run of a named node, picking
    /// the item matching the current index (clamped to the last item).
    fn node_item(&self, name: &str) -> EvalValue {
        let Some(items) = self
            .run_data
            .get(name)
            .and_then(|runs| runs.last())
            .and_then(|task| task.first_output())
        else {
            return EvalValue::Undefined;
        };
        let index = self.item_index.min(items.len().saturating_sub(1));
        items
            .get(index)
            .map_or(EvalValue::Undefined, |item| {
                EvalValue::Json(serde_json::to_value(item).unwrap_or(JsonValue::Null))
            })
    }
}

/// Returns true when a parameter string is an expression (leading `=`).
#[must_use]
pub fn is_expression(text: &str) -> bool {
    text.starts_with('=')
}

/// Evaluates a template (the text after the leading `=`).
///
/// # Errors
///
/// Returns an error for malformed `{{ … }}` segments.
pub fn evaluate_template(template: &str, scope: &Scope<'_>) -> Result<JsonValue, ExpressionError> {
    let segments = split_template(template)?;

    // A lone mustache yields the typed value.
    if let [Segment::Mustache(source)] = segments.as_slice() {
        return Ok(evaluate_source(source, scope)?.into_json());
    }

    let mut out = String::new();
    for segment in &segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Mustache(source) => {
                out.push_str(&evaluate_source(source, scope)?.coerce_string());
            }
        }
    }
    Ok(JsonValue::String(out))
}

/// Resolves a parameter value in depth: expression strings evaluate,
/// arrays and objects recurse, everything else passes through.
///
/// # Errors
///
/// Returns the first expression error encountered.
pub fn resolve_value(value: &JsonValue, scope: &Scope<'_>) -> Result<JsonValue, ExpressionError> {
    match value {
        JsonValue::String(text) => {
            if let Some(template) = text.strip_prefix('=') {
                evaluate_template(template, scope)
            } else {
                Ok(value.clone())
            }
        }
        JsonValue::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve_value(item, scope)?);
            }
            Ok(JsonValue::Array(resolved))
        }
        JsonValue::Object(map) => {
            let mut resolved = Map::new();
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, scope)?);
            }
            Ok(JsonValue::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn evaluate_source(source: &str, scope: &Scope<'_>) -> Result<EvalValue, ExpressionError> {
    let tokens = lexer::tokenize(source)?;
    let expr = parser::parse(&tokens)?;
    eval::eval(&expr, scope)
}

enum Segment {
    Text(String),
    Mustache(String),
}

fn split_template(template: &str) -> Result<Vec<Segment>, ExpressionError> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Text(rest[..open].to_string()));
        }
        let after_open = &rest[open + 2..];
        let close = after_open.find("}}").ok_or(ExpressionError::Parse {
            message: "unterminated '{{' in template".to_string(),
        })?;
        segments.push(Segment::Mustache(after_open[..close].trim().to_string()));
        rest = &after_open[close + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
    Ok(segments)
}
