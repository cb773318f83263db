//! Credential resolution and request authentication.
//!
//! Implements the engine's [`CredentialResolving`] seam over the file
//! store. Supported credential types: header, query, basic, bearer, and
//! OAuth2 client-credential/refresh flows. OAuth token refresh is
//! single-flight per credential id: concurrent requests for the same
//! expiring credential collapse onto one refresh, and the replacement is
//! persisted back through the store.

use crate::store::{CredentialStoreError, FileCredentialStore};
use async_trait::async_trait;
use base64::Engine as _;
use cascade_engine::context::{CredentialResolving, HttpRequester, RequestOptions};
use cascade_engine::definition::{CredentialRef, WorkflowNode};
use cascade_engine::error::EngineError;
use cascade_engine::expression;
use cascade_engine::item::ExecutionItem;
use cascade_engine::state::RunData;
use chrono::Utc;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Seconds of slack before expiry at which a token counts as expired.
const TOKEN_EXPIRY_SLACK_SECONDS: i64 = 60;

/// Resolves node credential references against the file store.
pub struct CredentialResolver {
    store: Arc<FileCredentialStore>,
    http: Arc<dyn HttpRequester>,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialResolver {
    /// Creates a resolver over a store, using `http` for token refresh.
    #[must_use]
    pub fn new(store: Arc<FileCredentialStore>, http: Arc<dyn HttpRequester>) -> Self {
        Self {
            store,
            http,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Transitive parent credential-type names.
    ///
    /// OAuth2-derived types inherit the generic `oauth2Api` handling.
    #[must_use]
    pub fn parent_types(&self, name: &str) -> Vec<String> {
        match name {
            "googleOAuth2Api" | "microsoftOAuth2Api" | "slackOAuth2Api" => {
                vec!["oauth2Api".to_string()]
            }
            _ => vec![],
        }
    }

    fn is_oauth2(&self, cred_type: &str) -> bool {
        cred_type == "oauth2Api"
            || self
                .parent_types(cred_type)
                .iter()
                .any(|parent| parent == "oauth2Api")
    }

    async fn lookup(
        &self,
        cred_type: &str,
        cred_ref: &CredentialRef,
    ) -> Result<(String, JsonValue), CredentialStoreError> {
        if let Some(id) = &cred_ref.id {
            let credential = self.store.get_by_id_and_type(id, cred_type).await?;
            return Ok((id.clone(), credential.data));
        }
        self.store
            .find_by_name_and_type(&cred_ref.name, cred_type)
            .await
            .map(|(id, credential)| (id, credential.data))
            .ok_or_else(|| CredentialStoreError::NotFound {
                id: cred_ref.name.clone(),
            })
    }

    /// Evaluates `=`-prefixed strings embedded in stored credential
    /// fields. Static scope: credentials resolve before any item exists.
    fn resolve_expressions(data: JsonValue) -> Result<JsonValue, EngineError> {
        let item = ExecutionItem::empty();
        let run_data = RunData::new();
        let parameters = Map::new();
        let scope = expression::Scope {
            current_item: Some(&item),
            input_items: std::slice::from_ref(&item),
            run_data: &run_data,
            parameters: &parameters,
            workflow_id: String::new(),
            workflow_name: String::new(),
            execution_id: String::new(),
            item_index: 0,
            run_index: 0,
            now: Utc::now(),
        };
        expression::resolve_value(&data, &scope).map_err(|e| EngineError::Credential {
            message: format!("credential expression failed: {e}"),
        })
    }

    /// Refreshes an OAuth2 token when missing or expiring, serializing
    /// refreshes per credential id.
    async fn pre_authenticate(
        &self,
        credential_id: &str,
        data: JsonValue,
    ) -> Result<JsonValue, EngineError> {
        if !token_needs_refresh(&data) {
            return Ok(data);
        }

        let lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks
                .entry(credential_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Another task may have refreshed while this one waited.
        let current = self
            .store
            .get(credential_id)
            .await
            .map_err(credential_error)?
            .data;
        if !token_needs_refresh(&current) {
            debug!(credential = %credential_id, "token already refreshed by a concurrent task");
            return Ok(current);
        }

        info!(credential = %credential_id, "refreshing oauth2 access token");
        let refreshed = self.request_token(&current).await?;

        let mut merged = current.clone();
        if let (JsonValue::Object(merged), JsonValue::Object(refreshed)) =
            (&mut merged, &refreshed)
        {
            for (key, value) in refreshed {
                merged.insert(key.clone(), value.clone());
            }
        }
        self.store
            .update(credential_id, merged.clone())
            .await
            .map_err(credential_error)?;
        Ok(merged)
    }

    /// Exchanges a refresh token (or client credentials) for a new access
    /// token.
    async fn request_token(&self, data: &JsonValue) -> Result<JsonValue, EngineError> {
        let token_url = data
            .get("accessTokenUrl")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| EngineError::Credential {
                message: "oauth2 credential is missing 'accessTokenUrl'".to_string(),
            })?;

        let mut body = Map::new();
        if let Some(refresh_token) = data.get("refreshToken").and_then(JsonValue::as_str) {
            body.insert("grant_type".to_string(), json!("refresh_token"));
            body.insert("refresh_token".to_string(), json!(refresh_token));
        } else {
            body.insert("grant_type".to_string(), json!("client_credentials"));
        }
        for key in ["clientId", "clientSecret", "scope"] {
            if let Some(value) = data.get(key).and_then(JsonValue::as_str) {
                let wire_key = match key {
                    "clientId" => "client_id",
                    "clientSecret" => "client_secret",
                    _ => "scope",
                };
                body.insert(wire_key.to_string(), json!(value));
            }
        }

        let response = self
            .http
            .request(
                RequestOptions::new("POST", token_url).with_body(JsonValue::Object(body)),
            )
            .await
            .map_err(|e| EngineError::Credential {
                message: format!("token refresh request failed: {e}"),
            })?;

        if !response.is_success() {
            return Err(EngineError::Credential {
                message: format!(
                    "token endpoint returned status {}: {}",
                    response.status,
                    response.text()
                ),
            });
        }

        let payload = response.json().ok_or_else(|| EngineError::Credential {
            message: "token endpoint returned non-JSON payload".to_string(),
        })?;
        let access_token = payload
            .get("access_token")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| EngineError::Credential {
                message: "token endpoint response lacks 'access_token'".to_string(),
            })?;

        let mut refreshed = Map::new();
        refreshed.insert("accessToken".to_string(), json!(access_token));
        if let Some(expires_in) = payload.get("expires_in").and_then(JsonValue::as_i64) {
            let expires_at = Utc::now() + chrono::Duration::seconds(expires_in);
            refreshed.insert("expiresAt".to_string(), json!(expires_at.to_rfc3339()));
        }
        if let Some(refresh_token) = payload.get("refresh_token").and_then(JsonValue::as_str) {
            refreshed.insert("refreshToken".to_string(), json!(refresh_token));
        }
        Ok(JsonValue::Object(refreshed))
    }
}

fn credential_error(error: CredentialStoreError) -> EngineError {
    EngineError::Credential {
        message: error.to_string(),
    }
}

/// True when an OAuth2 payload has no usable access token.
fn token_needs_refresh(data: &JsonValue) -> bool {
    let Some(token) = data.get("accessToken").and_then(JsonValue::as_str) else {
        return true;
    };
    if token.is_empty() {
        return true;
    }
    match data
        .get("expiresAt")
        .and_then(JsonValue::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
    {
        Some(expires_at) => {
            expires_at.with_timezone(&Utc)
                < Utc::now() + chrono::Duration::seconds(TOKEN_EXPIRY_SLACK_SECONDS)
        }
        None => false,
    }
}

#[async_trait]
impl CredentialResolving for CredentialResolver {
    async fn resolve(
        &self,
        _node: &WorkflowNode,
        cred_type: &str,
        cred_ref: &CredentialRef,
        raw: bool,
    ) -> Result<JsonValue, EngineError> {
        let (id, data) = self
            .lookup(cred_type, cred_ref)
            .await
            .map_err(credential_error)?;

        let data = if self.is_oauth2(cred_type) {
            self.pre_authenticate(&id, data).await?
        } else {
            data
        };

        if raw {
            Ok(data)
        } else {
            Self::resolve_expressions(data)
        }
    }

    async fn authenticate(
        &self,
        cred_type: &str,
        credentials: &JsonValue,
        options: RequestOptions,
        _node: &WorkflowNode,
    ) -> Result<RequestOptions, EngineError> {
        let text = |key: &str| -> String {
            credentials
                .get(key)
                .and_then(JsonValue::as_str)
                .unwrap_or("")
                .to_string()
        };

        let effective_type = if self.is_oauth2(cred_type) {
            "oauth2Api"
        } else {
            cred_type
        };

        match effective_type {
            "httpHeaderAuth" => Ok(options.with_header(text("name"), text("value"))),
            "httpQueryAuth" => Ok(options.with_query(text("name"), text("value"))),
            "httpBasicAuth" => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", text("user"), text("password")));
                Ok(options.with_header("Authorization", format!("Basic {encoded}")))
            }
            "httpBearerAuth" => {
                Ok(options.with_header("Authorization", format!("Bearer {}", text("token"))))
            }
            "oauth2Api" => Ok(options.with_header(
                "Authorization",
                format!("Bearer {}", text("accessToken")),
            )),
            other => Err(EngineError::Credential {
                message: format!("no authentication rule for credential type '{other}'"),
            }),
        }
    }
}
