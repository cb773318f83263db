//! Binary-data stores.
//!
//! Two modes implement the engine's [`BinaryStore`] seam:
//!
//! - **filesystem**: payloads under a configured base path, with a JSON
//!   metadata sidecar per object.
//! - **s3**: payloads in a bucket, metadata carried as object metadata
//!   (`filename` URL-encoded, `mimetype` verbatim).
//!
//! Both use the key layout
//! `workflows/{workflow_id}/executions/{execution_id}/binary_data/{ulid}`
//! and namespace returned ids by mode (`filesystem:…` / `s3:…`).

use async_trait::async_trait;
use cascade_engine::context::{
    BinaryMetadata, BinaryScope, BinaryStore, BinaryUploadMetadata, StoredBinary,
};
use cascade_engine::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use ulid::Ulid;

fn object_key(scope: &BinaryScope) -> String {
    format!(
        "workflows/{}/executions/{}/binary_data/{}",
        scope.workflow_id,
        scope.execution_id,
        Ulid::new()
    )
}

fn io_error(message: impl std::fmt::Display) -> EngineError {
    EngineError::Bookkeeping {
        message: format!("binary store: {message}"),
    }
}

/// Percent-encodes a metadata value so it survives header-safe transports.
fn url_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn url_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%'
            && let Some(high) = bytes.get(index + 1).and_then(|b| (*b as char).to_digit(16))
            && let Some(low) = bytes.get(index + 2).and_then(|b| (*b as char).to_digit(16))
        {
            out.push((high * 16 + low) as u8);
            index += 3;
        } else {
            out.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// Filesystem mode
// ---------------------------------------------------------------------------

/// Sidecar metadata persisted next to each payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SidecarMetadata {
    file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mime_type: Option<String>,
}

/// Filesystem-backed binary store rooted at a base path.
pub struct FilesystemBinaryStore {
    base_path: PathBuf,
}

impl FilesystemBinaryStore {
    /// Creates a store rooted at `base_path` (created lazily on write).
    #[must_use]
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn resolve(&self, id: &str) -> Result<PathBuf, EngineError> {
        let key = id
            .strip_prefix("filesystem:")
            .ok_or_else(|| io_error(format!("id '{id}' does not belong to filesystem mode")))?;
        if key.contains("..") {
            return Err(io_error("path traversal in binary id"));
        }
        Ok(self.base_path.join(key))
    }

    fn sidecar_path(path: &std::path::Path) -> PathBuf {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(".metadata.json");
        PathBuf::from(sidecar)
    }
}

#[async_trait]
impl BinaryStore for FilesystemBinaryStore {
    async fn store(
        &self,
        scope: &BinaryScope,
        bytes: Vec<u8>,
        metadata: BinaryUploadMetadata,
    ) -> Result<StoredBinary, EngineError> {
        let key = object_key(scope);
        let path = self.base_path.join(&key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let file_size = bytes.len() as u64;
        tokio::fs::write(&path, &bytes).await.map_err(io_error)?;

        let sidecar = SidecarMetadata {
            file_size,
            file_name: metadata.file_name,
            mime_type: metadata.mime_type,
        };
        let sidecar_bytes = serde_json::to_vec(&sidecar).map_err(io_error)?;
        tokio::fs::write(Self::sidecar_path(&path), sidecar_bytes)
            .await
            .map_err(io_error)?;

        debug!(key = %key, file_size, "stored binary payload on filesystem");
        Ok(StoredBinary {
            id: format!("filesystem:{key}"),
            file_size,
        })
    }

    async fn as_bytes(&self, id: &str) -> Result<Vec<u8>, EngineError> {
        let path = self.resolve(id)?;
        tokio::fs::read(&path).await.map_err(io_error)
    }

    async fn metadata(&self, id: &str) -> Result<BinaryMetadata, EngineError> {
        let path = self.resolve(id)?;
        let bytes = tokio::fs::read(Self::sidecar_path(&path))
            .await
            .map_err(io_error)?;
        let sidecar: SidecarMetadata = serde_json::from_slice(&bytes).map_err(io_error)?;
        Ok(BinaryMetadata {
            file_size: sidecar.file_size,
            file_name: sidecar.file_name,
            mime_type: sidecar.mime_type,
        })
    }

    async fn delete(&self, id: &str) -> Result<(), EngineError> {
        let path = self.resolve(id)?;
        tokio::fs::remove_file(&path).await.map_err(io_error)?;
        // The sidecar may already be gone; that is fine.
        let _ = tokio::fs::remove_file(Self::sidecar_path(&path)).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// S3 mode
// ---------------------------------------------------------------------------

/// S3 connection settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct S3Config {
    /// Target bucket.
    pub bucket: String,
    /// Bucket region.
    pub region: String,
    /// Custom endpoint host (e.g. a MinIO instance).
    #[serde(default)]
    pub host: Option<String>,
    /// `http` or `https` for custom endpoints.
    #[serde(default)]
    pub protocol: Option<String>,
    /// Static access key; omit to use the provider chain.
    #[serde(default)]
    pub access_key_id: Option<String>,
    /// Static secret key.
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Use the default provider chain even when static keys are absent.
    #[serde(default)]
    pub auth_auto_detect: Option<bool>,
}

/// S3-backed binary store.
pub struct S3BinaryStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BinaryStore {
    /// Builds a store from connection settings.
    pub async fn connect(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(host) = &config.host {
            let protocol = config.protocol.as_deref().unwrap_or("https");
            loader = loader.endpoint_url(format!("{protocol}://{host}"));
        }
        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "cascade-config",
            ));
        }

        let sdk_config = loader.load().await;
        Self {
            client: aws_sdk_s3::Client::new(&sdk_config),
            bucket: config.bucket.clone(),
        }
    }

    fn key_of<'a>(&self, id: &'a str) -> Result<&'a str, EngineError> {
        id.strip_prefix("s3:")
            .ok_or_else(|| io_error(format!("id '{id}' does not belong to s3 mode")))
    }
}

#[async_trait]
impl BinaryStore for S3BinaryStore {
    async fn store(
        &self,
        scope: &BinaryScope,
        bytes: Vec<u8>,
        metadata: BinaryUploadMetadata,
    ) -> Result<StoredBinary, EngineError> {
        let key = object_key(scope);
        let file_size = bytes.len() as u64;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(bytes.into());
        if let Some(file_name) = &metadata.file_name {
            request = request.metadata("filename", url_encode(file_name));
        }
        if let Some(mime_type) = &metadata.mime_type {
            request = request.metadata("mimetype", mime_type);
            request = request.content_type(mime_type);
        }

        request
            .send()
            .await
            .map_err(|e| io_error(format!("s3 put failed: {e}")))?;

        debug!(key = %key, file_size, "stored binary payload in s3");
        Ok(StoredBinary {
            id: format!("s3:{key}"),
            file_size,
        })
    }

    async fn as_bytes(&self, id: &str) -> Result<Vec<u8>, EngineError> {
        let key = self.key_of(id)?;
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| io_error(format!("s3 get failed: {e}")))?;
        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| io_error(format!("s3 body read failed: {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn metadata(&self, id: &str) -> Result<BinaryMetadata, EngineError> {
        let key = self.key_of(id)?;
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| io_error(format!("s3 head failed: {e}")))?;

        let object_metadata = head.metadata();
        Ok(BinaryMetadata {
            file_size: head.content_length().unwrap_or(0).max(0) as u64,
            file_name: object_metadata
                .and_then(|m| m.get("filename"))
                .map(|encoded| url_decode(encoded)),
            mime_type: object_metadata
                .and_then(|m| m.get("mimetype"))
                .cloned(),
        })
    }

    async fn delete(&self, id: &str) -> Result<(), EngineError> {
        let key = self.key_of(id)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| io_error(format!("s3 delete failed: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Binary-data configuration, as it appears in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct BinaryDataConfig {
    /// `"filesystem"` (default) or `"s3"`.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Payloads at or below this many bytes stay inline in run data.
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold_bytes: usize,
    /// Filesystem settings.
    #[serde(default)]
    pub filesystem: FilesystemConfig,
    /// S3 settings; required when mode is `"s3"`.
    #[serde(default)]
    pub s3: Option<S3Config>,
}

fn default_mode() -> String {
    "filesystem".to_string()
}

fn default_inline_threshold() -> usize {
    256 * 1024
}

impl Default for BinaryDataConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            inline_threshold_bytes: default_inline_threshold(),
            filesystem: FilesystemConfig::default(),
            s3: None,
        }
    }
}

/// Filesystem-mode settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FilesystemConfig {
    /// Root directory for payloads.
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
}

fn default_base_path() -> PathBuf {
    PathBuf::from("./binary-data")
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
        }
    }
}

impl BinaryDataConfig {
    /// Builds the configured store.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown modes or missing S3 settings.
    pub async fn build(&self) -> Result<Arc<dyn BinaryStore>, EngineError> {
        match self.mode.as_str() {
            "filesystem" => Ok(Arc::new(FilesystemBinaryStore::new(
                self.filesystem.base_path.clone(),
            ))),
            "s3" => {
                let s3 = self.s3.as_ref().ok_or_else(|| EngineError::Bookkeeping {
                    message: "binary_data.mode is 's3' but the s3 section is missing".to_string(),
                })?;
                Ok(Arc::new(S3BinaryStore::connect(s3).await))
            }
            other => Err(EngineError::Bookkeeping {
                message: format!("unknown binary_data.mode '{other}'"),
            }),
        }
    }
}
