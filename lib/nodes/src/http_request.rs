//! Outbound HTTP requests.
//!
//! Builds one request per input item from expression-capable parameters,
//! optionally decorated by the node's declared credential type, and emits
//! the parsed response. With `fullResponse` the item carries status,
//! headers, and body; otherwise just the body. Per-item failures honor
//! continue-on-fail.

use async_trait::async_trait;
use cascade_engine::context::{NodeExecutionContext, RequestOptions};
use cascade_engine::error::{NodeError, SerializedError};
use cascade_engine::item::ExecutionItem;
use cascade_engine::registry::{NodeType, NodeTypeDescription};
use chrono::Utc;
use serde_json::{Map, Value as JsonValue, json};
use tracing::debug;

pub struct HttpRequest {
    description: NodeTypeDescription,
}

impl HttpRequest {
    #[must_use]
    pub fn new() -> Self {
        Self {
            description: NodeTypeDescription {
                name: "cascade.httpRequest".to_string(),
                display_name: "HTTP Request".to_string(),
                description: "Performs an HTTP request per item".to_string(),
                versions: vec![1],
                default_version: 1,
                groups: vec!["transform".to_string()],
                inputs: 1,
                outputs: 1,
                credentials: vec![
                    "httpBasicAuth".to_string(),
                    "httpHeaderAuth".to_string(),
                    "httpQueryAuth".to_string(),
                    "httpBearerAuth".to_string(),
                    "oauth2Api".to_string(),
                ],
            },
        }
    }

    fn build_options(
        context: &NodeExecutionContext<'_>,
        index: usize,
    ) -> Result<RequestOptions, NodeError> {
        let url = context.node_parameter("url", index)?;
        let url = url
            .as_str()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| NodeError::operation("parameter 'url' must be a non-empty string"))?;
        let method = context
            .node_parameter_or("method", index, json!("GET"))
            .as_str()
            .unwrap_or("GET")
            .to_string();

        let mut options = RequestOptions::new(method, url);

        if let JsonValue::Object(headers) =
            context.node_parameter_or("headers", index, json!({}))
        {
            for (name, value) in headers {
                options = options.with_header(name, json_to_string(&value));
            }
        }
        if let JsonValue::Object(query) =
            context.node_parameter_or("queryParameters", index, json!({}))
        {
            for (name, value) in query {
                options = options.with_query(name, json_to_string(&value));
            }
        }
        let body = context.node_parameter_or("body", index, JsonValue::Null);
        if !body.is_null() {
            options = options.with_body(body);
        }
        if let Some(timeout) = context
            .node_parameter_or("timeout", index, JsonValue::Null)
            .as_u64()
        {
            options.timeout_ms = Some(timeout);
        }

        Ok(options)
    }

    async fn run_one(
        context: &mut NodeExecutionContext<'_>,
        index: usize,
    ) -> Result<ExecutionItem, NodeError> {
        let options = Self::build_options(context, index)?;
        debug!(method = %options.method, url = %options.url, item = index, "performing request");

        let authentication = context
            .node_parameter_or("authentication", index, json!("none"))
            .as_str()
            .unwrap_or("none")
            .to_string();

        let response = if authentication == "none" {
            context.http_request(options).await?
        } else {
            let cred_type = context
                .node_parameter_or("nodeCredentialType", index, JsonValue::Null)
                .as_str()
                .map(ToString::to_string)
                .or_else(|| context.node().credentials.keys().next().cloned())
                .ok_or_else(|| {
                    NodeError::operation(
                        "authentication requested but the node declares no credentials",
                    )
                })?;
            context
                .http_request_with_credentials(&cred_type, options)
                .await?
        };

        let body = response
            .json()
            .unwrap_or_else(|| json!({"data": response.text()}));

        if !response.is_success() {
            let ignore_errors = context
                .node_parameter_or("ignoreResponseErrors", index, json!(false))
                .as_bool()
                .unwrap_or(false);
            if !ignore_errors {
                return Err(NodeError::api(format!(
                    "request failed with status {}",
                    response.status
                ))
                .with_http_code(response.status)
                .with_description(response.text()));
            }
        }

        let full_response = context
            .node_parameter_or("fullResponse", index, json!(false))
            .as_bool()
            .unwrap_or(false);

        let item_json = if full_response {
            let headers: Map<String, JsonValue> = response
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
                .collect();
            json!({
                "statusCode": response.status,
                "headers": headers,
                "body": body,
            })
        } else {
            body
        };

        Ok(ExecutionItem::from_json(item_json).with_pairing(index))
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

fn json_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl NodeType for HttpRequest {
    fn description(&self) -> &NodeTypeDescription {
        &self.description
    }

    async fn execute(
        &self,
        context: &mut NodeExecutionContext<'_>,
    ) -> Result<Vec<Vec<ExecutionItem>>, NodeError> {
        let item_count = context.input_data(0).len();
        let mut out = Vec::with_capacity(item_count);

        for index in 0..item_count {
            match Self::run_one(context, index).await {
                Ok(item) => out.push(item),
                Err(error) if context.continue_on_fail() => {
                    let serialized =
                        SerializedError::from_node_error(&error, &context.node().name)
                            .with_timestamp(Utc::now());
                    let mut item = ExecutionItem::from_json(
                        json!({"error": error.to_string()}),
                    )
                    .with_pairing(index);
                    item.error = Some(serialized);
                    out.push(item);
                }
                Err(error) => return Err(error),
            }
        }

        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CannedHttp, FixedCredentials, TestBed, node_json};
    use std::sync::Arc;

    #[tokio::test]
    async fn performs_one_request_per_item() {
        let http = Arc::new(CannedHttp::replying(200, r#"{"ok": true}"#));
        let bed = TestBed::new(
            node_json(
                "cascade.httpRequest",
                json!({"url": "=https://api.example.com/users/{{ $json.id }}"}),
            ),
            vec![
                ExecutionItem::from_json(json!({"id": 1})),
                ExecutionItem::from_json(json!({"id": 2})),
            ],
        )
        .with_http(http.clone());

        let output = HttpRequest::new()
            .execute(&mut bed.context())
            .await
            .expect("execute");

        assert_eq!(output[0].len(), 2);
        assert_eq!(output[0][0].json.get("ok"), Some(&json!(true)));

        let requests = http.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].url, "https://api.example.com/users/1");
        assert_eq!(requests[1].url, "https://api.example.com/users/2");
    }

    #[tokio::test]
    async fn decorates_request_with_credentials() {
        let http = Arc::new(CannedHttp::replying(200, "{}"));
        let mut node = node_json(
            "cascade.httpRequest",
            json!({
                "url": "https://api.example.com/private",
                "authentication": "predefinedCredentialType",
                "nodeCredentialType": "httpBearerAuth"
            }),
        );
        node["credentials"] = json!({"httpBearerAuth": {"id": "cred-1", "name": "api token"}});
        let bed = TestBed::new(node, vec![ExecutionItem::empty()])
            .with_http(http.clone())
            .with_credentials(Arc::new(FixedCredentials(json!({"token": "s3cret"}))));

        HttpRequest::new()
            .execute(&mut bed.context())
            .await
            .expect("execute");

        let requests = http.requests.lock().unwrap();
        assert_eq!(
            requests[0].headers.get("Authorization").map(String::as_str),
            Some("Bearer s3cret")
        );
    }

    #[tokio::test]
    async fn failure_status_is_an_api_error() {
        let http = Arc::new(CannedHttp::replying(503, "unavailable"));
        let bed = TestBed::new(
            node_json("cascade.httpRequest", json!({"url": "https://api.example.com"})),
            vec![ExecutionItem::empty()],
        )
        .with_http(http);

        let error = HttpRequest::new()
            .execute(&mut bed.context())
            .await
            .expect_err("should fail");

        assert!(matches!(
            error,
            NodeError::Api {
                http_code: Some(503),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn continue_on_fail_yields_error_items() {
        let http = Arc::new(CannedHttp::replying(500, "boom"));
        let mut node = node_json(
            "cascade.httpRequest",
            json!({"url": "https://api.example.com"}),
        );
        node["continueOnFail"] = json!(true);
        let bed = TestBed::new(node, vec![ExecutionItem::empty(), ExecutionItem::empty()])
            .with_http(http);

        let output = HttpRequest::new()
            .execute(&mut bed.context())
            .await
            .expect("execute");

        assert_eq!(output[0].len(), 2);
        for item in &output[0] {
            assert!(item.error.is_some());
            assert!(item.json.get("error").is_some());
        }
    }

    #[tokio::test]
    async fn full_response_carries_status_and_body() {
        let http = Arc::new(CannedHttp::replying(201, r#"{"created": true}"#));
        let bed = TestBed::new(
            node_json(
                "cascade.httpRequest",
                json!({"url": "https://api.example.com", "method": "POST", "fullResponse": true}),
            ),
            vec![ExecutionItem::empty()],
        )
        .with_http(http.clone());

        let output = HttpRequest::new()
            .execute(&mut bed.context())
            .await
            .expect("execute");

        let item = &output[0][0];
        assert_eq!(item.json.get("statusCode"), Some(&json!(201)));
        assert_eq!(item.json["body"]["created"], json!(true));
        assert_eq!(http.requests.lock().unwrap()[0].method, "POST");
    }
}
