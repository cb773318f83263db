//! The execution identifier.
//!
//! Executions are identified by a ULID wrapped in a newtype, displayed
//! with an `exec_` prefix. ULIDs sort by creation time, which keeps
//! per-execution history subjects and log output naturally ordered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Unique identifier for a single durable execution of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Ulid);

impl ExecutionId {
    /// Creates an id with a freshly generated ULID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Wraps an existing ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec_{}", self.0)
    }
}

/// Error returned when parsing an [`ExecutionId`] from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse execution id: {}", self.reason)
    }
}

impl std::error::Error for ParseIdError {}

impl FromStr for ExecutionId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept both the prefixed display form and a raw ULID.
        let ulid_str = s.strip_prefix("exec_").unwrap_or(s);
        Ulid::from_str(ulid_str).map(Self).map_err(|e| ParseIdError {
            reason: e.to_string(),
        })
    }
}

impl From<Ulid> for ExecutionId {
    fn from(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl From<ExecutionId> for Ulid {
    fn from(id: ExecutionId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_the_exec_prefix() {
        let id = ExecutionId::new();
        assert!(id.to_string().starts_with("exec_"));
    }

    #[test]
    fn display_form_parses_back() {
        let id = ExecutionId::new();
        let parsed: ExecutionId = id.to_string().parse().expect("should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn raw_ulid_parses() {
        let ulid = Ulid::new();
        let id: ExecutionId = ulid.to_string().parse().expect("should parse");
        assert_eq!(id.as_ulid(), ulid);
    }

    #[test]
    fn garbage_is_rejected() {
        let result: Result<ExecutionId, _> = "not_a_ulid".parse();
        assert!(result.is_err());
    }

    #[test]
    fn usable_as_a_map_key() {
        use std::collections::HashSet;

        let first = ExecutionId::new();
        let second = ExecutionId::new();

        let mut set = HashSet::new();
        set.insert(first);
        set.insert(second);
        set.insert(first); // duplicate

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn serde_is_transparent() {
        let id = ExecutionId::new();
        let json = serde_json::to_string(&id).expect("serialize");
        // Encoded as the bare ULID string, not a struct.
        assert_eq!(json, format!("\"{}\"", id.as_ulid()));
        let parsed: ExecutionId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, parsed);
    }
}
