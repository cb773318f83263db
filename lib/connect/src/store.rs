//! File-backed credential store.
//!
//! One JSON object per installation: keys are credential ids, values
//! `{name, type, data}` with opaque `data`. Writes replace the whole file
//! atomically (temp file + rename) and create the parent directory on
//! first use.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// One stored credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCredential {
    /// Human-readable name.
    pub name: String,
    /// Credential type name, e.g. `httpHeaderAuth`.
    #[serde(rename = "type")]
    pub credential_type: String,
    /// Opaque credential payload.
    pub data: JsonValue,
}

/// Errors from credential store operations.
#[derive(Debug)]
pub enum CredentialStoreError {
    /// The store file could not be read or written.
    Io { path: PathBuf, source: std::io::Error },
    /// The store file is not valid JSON.
    Malformed { path: PathBuf, message: String },
    /// No credential with the given id.
    NotFound { id: String },
    /// The credential exists but has a different type.
    TypeMismatch {
        id: String,
        expected: String,
        actual: String,
    },
}

impl fmt::Display for CredentialStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "credential store io error at {}: {source}", path.display())
            }
            Self::Malformed { path, message } => {
                write!(f, "credential store at {} is malformed: {message}", path.display())
            }
            Self::NotFound { id } => write!(f, "credential not found: {id}"),
            Self::TypeMismatch {
                id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "credential {id} has type '{actual}', expected '{expected}'"
                )
            }
        }
    }
}

impl std::error::Error for CredentialStoreError {}

/// The JSON-file credential store.
pub struct FileCredentialStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, StoredCredential>>,
}

impl FileCredentialStore {
    /// Opens a store at the given path, loading existing entries.
    ///
    /// A missing file yields an empty store; the file is created on the
    /// first write.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or
    /// parsed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CredentialStoreError> {
        let path = path.into();
        let entries = Self::load_file(&path).await?;
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    async fn load_file(
        path: &Path,
    ) -> Result<BTreeMap<String, StoredCredential>, CredentialStoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| CredentialStoreError::Malformed {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(CredentialStoreError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Reloads entries from disk, replacing the in-memory view.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    pub async fn reload(&self) -> Result<(), CredentialStoreError> {
        let entries = Self::load_file(&self.path).await?;
        *self.entries.write().await = entries;
        Ok(())
    }

    /// Returns a credential by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the id is unknown.
    pub async fn get(&self, id: &str) -> Result<StoredCredential, CredentialStoreError> {
        self.entries
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CredentialStoreError::NotFound { id: id.to_string() })
    }

    /// Returns a credential by id, verifying its type.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `TypeMismatch`.
    pub async fn get_by_id_and_type(
        &self,
        id: &str,
        credential_type: &str,
    ) -> Result<StoredCredential, CredentialStoreError> {
        let credential = self.get(id).await?;
        if credential.credential_type != credential_type {
            return Err(CredentialStoreError::TypeMismatch {
                id: id.to_string(),
                expected: credential_type.to_string(),
                actual: credential.credential_type,
            });
        }
        Ok(credential)
    }

    /// Finds a credential by name and type (fallback when a workflow
    /// references credentials without ids).
    pub async fn find_by_name_and_type(
        &self,
        name: &str,
        credential_type: &str,
    ) -> Option<(String, StoredCredential)> {
        self.entries
            .read()
            .await
            .iter()
            .find(|(_, c)| c.name == name && c.credential_type == credential_type)
            .map(|(id, c)| (id.clone(), c.clone()))
    }

    /// Replaces a credential's data and persists the whole file.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids or an io error from persisting.
    pub async fn update(&self, id: &str, data: JsonValue) -> Result<(), CredentialStoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| CredentialStoreError::NotFound { id: id.to_string() })?;
        entry.data = data;
        Self::persist(&self.path, &entries).await
    }

    /// Inserts or replaces a whole credential and persists.
    ///
    /// # Errors
    ///
    /// Returns an io error from persisting.
    pub async fn put(
        &self,
        id: impl Into<String>,
        credential: StoredCredential,
    ) -> Result<(), CredentialStoreError> {
        let mut entries = self.entries.write().await;
        entries.insert(id.into(), credential);
        Self::persist(&self.path, &entries).await
    }

    /// Atomic whole-file write: temp file in the same directory, then
    /// rename over the target.
    async fn persist(
        path: &Path,
        entries: &BTreeMap<String, StoredCredential>,
    ) -> Result<(), CredentialStoreError> {
        let io_err = |source| CredentialStoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let bytes = serde_json::to_vec_pretty(entries).map_err(|e| {
            CredentialStoreError::Malformed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;

        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&temp_path, path).await.map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn credential(name: &str, credential_type: &str) -> StoredCredential {
        StoredCredential {
            name: name.to_string(),
            credential_type: credential_type.to_string(),
            data: json!({"value": "secret"}),
        }
    }

    #[tokio::test]
    async fn missing_file_yields_empty_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCredentialStore::open(dir.path().join("credentials.json"))
            .await
            .expect("open");

        assert!(matches!(
            store.get("cred-1").await,
            Err(CredentialStoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("credentials.json");
        let store = FileCredentialStore::open(&path).await.expect("open");

        store
            .put("cred-1", credential("api token", "httpHeaderAuth"))
            .await
            .expect("put");

        let loaded = store.get("cred-1").await.expect("get");
        assert_eq!(loaded.name, "api token");

        // A fresh store sees the persisted file.
        let reopened = FileCredentialStore::open(&path).await.expect("reopen");
        assert_eq!(reopened.get("cred-1").await.expect("get").name, "api token");
    }

    #[tokio::test]
    async fn type_check_enforced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCredentialStore::open(dir.path().join("credentials.json"))
            .await
            .expect("open");
        store
            .put("cred-1", credential("api token", "httpHeaderAuth"))
            .await
            .expect("put");

        assert!(store
            .get_by_id_and_type("cred-1", "httpHeaderAuth")
            .await
            .is_ok());
        assert!(matches!(
            store.get_by_id_and_type("cred-1", "oauth2Api").await,
            Err(CredentialStoreError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn update_persists_new_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("credentials.json");
        let store = FileCredentialStore::open(&path).await.expect("open");
        store
            .put("cred-1", credential("token", "oauth2Api"))
            .await
            .expect("put");

        store
            .update("cred-1", json!({"accessToken": "fresh"}))
            .await
            .expect("update");

        let reopened = FileCredentialStore::open(&path).await.expect("reopen");
        assert_eq!(
            reopened.get("cred-1").await.expect("get").data["accessToken"],
            json!("fresh")
        );
    }

    #[tokio::test]
    async fn find_by_name_and_type() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCredentialStore::open(dir.path().join("credentials.json"))
            .await
            .expect("open");
        store
            .put("cred-9", credential("prod key", "httpQueryAuth"))
            .await
            .expect("put");

        let found = store.find_by_name_and_type("prod key", "httpQueryAuth").await;
        assert_eq!(found.map(|(id, _)| id), Some("cred-9".to_string()));
        assert!(store.find_by_name_and_type("prod key", "oauth2Api").await.is_none());
    }
}
