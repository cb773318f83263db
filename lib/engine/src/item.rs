//! Execution items: the elementary data flowing between nodes.
//!
//! Every node consumes and produces lists of [`ExecutionItem`]s per port.
//! An item carries a JSON object, optional named binary attachments, an
//! optional lineage pointer back to the input item it was derived from,
//! and an optional error when a continue-on-fail node attached one.

use crate::error::SerializedError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

/// A single datum flowing through the workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionItem {
    /// The JSON payload of this item.
    pub json: Map<String, JsonValue>,
    /// Named binary attachments, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<BTreeMap<String, BinaryData>>,
    /// Lineage back to the input item(s) this item was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_item: Option<PairedItem>,
    /// Error attached by a continue-on-fail node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

impl ExecutionItem {
    /// Creates an item from a JSON value.
    ///
    /// Non-object values are wrapped under a `"data"` key so that the item
    /// payload is always an object.
    #[must_use]
    pub fn from_json(value: JsonValue) -> Self {
        let json = match value {
            JsonValue::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        Self {
            json,
            ..Self::default()
        }
    }

    /// Creates an empty item (`{json: {}}`), the default seed input.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the item with lineage pointing at `item` on input port 0.
    #[must_use]
    pub fn with_pairing(mut self, item: usize) -> Self {
        self.paired_item = Some(PairedItem::Single(PairedItemRef { item, input: None }));
        self
    }

    /// Returns the item's JSON payload as a `Value`.
    #[must_use]
    pub fn json_value(&self) -> JsonValue {
        JsonValue::Object(self.json.clone())
    }
}

/// Lineage pointer from an output item to the input item(s) it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PairedItem {
    /// Derived from a single input item.
    Single(PairedItemRef),
    /// Derived from multiple input items (e.g. an aggregation).
    Many(Vec<PairedItemRef>),
}

/// A reference to one input item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedItemRef {
    /// Index of the input item.
    pub item: usize,
    /// Input port the item arrived on, when not port 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<usize>,
}

/// A binary attachment: either inline base64 data or a reference into the
/// binary store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryData {
    /// Base64-encoded payload when stored inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Binary-store reference when offloaded (`"filesystem:…"` / `"s3:…"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// MIME type of the payload.
    pub mime_type: String,
    /// Original file name, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Payload size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl BinaryData {
    /// Creates inline binary data from raw bytes.
    #[must_use]
    pub fn inline(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        use base64::Engine as _;
        Self {
            data: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            id: None,
            mime_type: mime_type.into(),
            file_name: None,
            file_size: Some(bytes.len() as u64),
        }
    }

    /// Creates a reference to an offloaded payload.
    #[must_use]
    pub fn reference(
        id: impl Into<String>,
        mime_type: impl Into<String>,
        file_size: u64,
    ) -> Self {
        Self {
            data: None,
            id: Some(id.into()),
            mime_type: mime_type.into(),
            file_name: None,
            file_size: Some(file_size),
        }
    }

    /// Sets the original file name.
    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Returns true if the payload is stored inline.
    #[must_use]
    pub fn is_inline(&self) -> bool {
        self.data.is_some()
    }

    /// Decodes the inline payload.
    ///
    /// Returns `None` when the payload is offloaded or the base64 is
    /// malformed.
    #[must_use]
    pub fn decode_inline(&self) -> Option<Vec<u8>> {
        use base64::Engine as _;
        let data = self.data.as_deref()?;
        base64::engine::general_purpose::STANDARD.decode(data).ok()
    }

    /// Size of the decoded inline payload, in bytes.
    #[must_use]
    pub fn inline_size(&self) -> usize {
        // 4 base64 chars encode 3 bytes; padding is close enough here.
        self.data.as_deref().map_or(0, |d| d.len() / 4 * 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_object() {
        let item = ExecutionItem::from_json(json!({"a": 1}));
        assert_eq!(item.json.get("a"), Some(&json!(1)));
    }

    #[test]
    fn from_json_scalar_wraps_under_data() {
        let item = ExecutionItem::from_json(json!("hello"));
        assert_eq!(item.json.get("data"), Some(&json!("hello")));
    }

    #[test]
    fn empty_item_serializes_to_empty_json() {
        let item = ExecutionItem::empty();
        let encoded = serde_json::to_value(&item).expect("serialize");
        assert_eq!(encoded, json!({"json": {}}));
    }

    #[test]
    fn binary_inline_roundtrip() {
        let payload = b"some binary payload";
        let binary = BinaryData::inline(payload, "application/octet-stream");

        assert!(binary.is_inline());
        assert_eq!(binary.file_size, Some(payload.len() as u64));
        assert_eq!(binary.decode_inline().as_deref(), Some(payload.as_slice()));
    }

    #[test]
    fn binary_reference_is_not_inline() {
        let binary = BinaryData::reference("filesystem:abc", "image/png", 1024);
        assert!(!binary.is_inline());
        assert_eq!(binary.decode_inline(), None);
        assert_eq!(binary.id.as_deref(), Some("filesystem:abc"));
    }

    #[test]
    fn paired_item_untagged_serde() {
        let single = PairedItem::Single(PairedItemRef {
            item: 2,
            input: None,
        });
        let json = serde_json::to_value(&single).expect("serialize");
        assert_eq!(json, json!({"item": 2}));

        let parsed: PairedItem = serde_json::from_value(json!([{"item": 0}, {"item": 1}]))
            .expect("deserialize");
        assert!(matches!(parsed, PairedItem::Many(refs) if refs.len() == 2));
    }

    #[test]
    fn item_serde_roundtrip() {
        let mut item = ExecutionItem::from_json(json!({"field": "value"})).with_pairing(3);
        item.binary = Some(
            [(
                "attachment".to_string(),
                BinaryData::inline(b"abc", "text/plain"),
            )]
            .into_iter()
            .collect(),
        );

        let json = serde_json::to_string(&item).expect("serialize");
        let parsed: ExecutionItem = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(item, parsed);
    }
}
