//! Reqwest-backed HTTP requester.

use async_trait::async_trait;
use cascade_engine::context::{HttpRequester, HttpResponse, RequestOptions};
use cascade_engine::error::NodeError;
use std::collections::BTreeMap;
use std::time::Duration;

/// Default per-request timeout when none is configured.
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Performs outbound HTTP with a shared reqwest client.
pub struct ReqwestRequester {
    client: reqwest::Client,
}

impl ReqwestRequester {
    /// Creates a requester with a fresh client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestRequester {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpRequester for ReqwestRequester {
    async fn request(&self, options: RequestOptions) -> Result<HttpResponse, NodeError> {
        let method = reqwest::Method::from_bytes(options.method.as_bytes())
            .map_err(|_| NodeError::operation(format!("invalid HTTP method '{}'", options.method)))?;

        let mut request = self
            .client
            .request(method, &options.url)
            .timeout(Duration::from_millis(
                options.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            ));

        for (name, value) in &options.headers {
            request = request.header(name, value);
        }
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            let mut error = NodeError::api(format!("request to {} failed: {e}", options.url));
            if let Some(status) = e.status() {
                error = error.with_http_code(status.as_u16());
            }
            error
        })?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| NodeError::api(format!("reading response body failed: {e}")))?
            .to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
