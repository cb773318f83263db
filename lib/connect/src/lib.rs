//! External collaborators for the cascade workflow engine.
//!
//! Everything the step task touches outside the process lives here:
//!
//! - **Credential store**: a JSON file mapping credential ids to
//!   `{name, type, data}`, written atomically.
//! - **Credential resolver**: decryption-boundary adapter implementing the
//!   engine's [`CredentialResolving`] seam, including request
//!   authentication and single-flight OAuth token refresh.
//! - **Binary stores**: filesystem- and S3-backed implementations of the
//!   engine's [`BinaryStore`] seam.
//! - **HTTP**: the reqwest-backed [`HttpRequester`].
//!
//! [`CredentialResolving`]: cascade_engine::context::CredentialResolving
//! [`BinaryStore`]: cascade_engine::context::BinaryStore
//! [`HttpRequester`]: cascade_engine::context::HttpRequester

pub mod binary;
pub mod credentials;
pub mod http;
pub mod store;

pub use binary::{BinaryDataConfig, FilesystemBinaryStore, S3BinaryStore, S3Config};
pub use credentials::CredentialResolver;
pub use http::ReqwestRequester;
pub use store::{FileCredentialStore, StoredCredential};
