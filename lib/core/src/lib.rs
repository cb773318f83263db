//! Core identifier types for the cascade workflow engine.
//!
//! Workflow and credential ids live inside the JSON documents that carry
//! them and stay plain strings; the execution id is the one identifier
//! minted by this system itself, so it gets a real type.

pub mod id;

pub use id::{ExecutionId, ParseIdError};
