use chrono::{DateTime, Utc};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::error::{invalid_data, InvalidDataReason, NimbusResult};

/// Immutable snapshot of one document as last reported by the server.
///
/// A document with no `value` is a tombstone: the server uses it to announce
/// a deletion inside a subscription stream. `sort_value` and `sort_keys` are
/// opaque server-issued tokens; the client only ever compares them bytewise
/// when maintaining the ordered dataset of a subscription.
#[derive(Clone, Debug)]
pub struct Document {
    pub id: String,
    pub collection_id: String,
    pub value: Option<JsonMap<String, JsonValue>>,
    pub etag: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub sort_value: Option<String>,
    pub sort_keys: Vec<String>,
}

impl Document {
    /// A deleted or not-yet-acknowledged document carries no body.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn value(&self) -> Option<&JsonMap<String, JsonValue>> {
        self.value.as_ref()
    }

    /// Decodes the wire shape `{id, etag, crt, crt-ts, mod-ts, skey, body}`.
    pub fn from_wire(collection_id: &str, raw: &JsonValue) -> NimbusResult<Self> {
        let object = raw.as_object().ok_or_else(|| {
            invalid_data(
                InvalidDataReason::SerializationFailure,
                "document frame is not a JSON object",
            )
        })?;

        let id = object
            .get("id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                invalid_data(
                    InvalidDataReason::SerializationFailure,
                    "document frame is missing 'id'",
                )
            })?
            .to_owned();

        let value = match object.get("body") {
            Some(JsonValue::Object(body)) => Some(body.clone()),
            Some(JsonValue::Null) | None => None,
            Some(other) => {
                return Err(invalid_data(
                    InvalidDataReason::SerializationFailure,
                    format!("document body must be an object, got {other}"),
                ))
            }
        };

        Ok(Self {
            id,
            collection_id: collection_id.to_owned(),
            value,
            etag: object
                .get("etag")
                .and_then(JsonValue::as_str)
                .map(str::to_owned),
            created_at: object.get("crt-ts").and_then(parse_timestamp),
            modified_at: object.get("mod-ts").and_then(parse_timestamp),
            sort_value: object.get("crt").map(opaque_token),
            sort_keys: object
                .get("skey")
                .and_then(JsonValue::as_array)
                .map(|keys| keys.iter().map(opaque_token).collect())
                .unwrap_or_default(),
        })
    }

    /// Encodes the wire shape; the inverse of [`Document::from_wire`].
    pub fn to_wire(&self) -> JsonValue {
        let mut object = JsonMap::new();
        object.insert("id".into(), json!(self.id));
        if let Some(etag) = &self.etag {
            object.insert("etag".into(), json!(etag));
        }
        if let Some(sort_value) = &self.sort_value {
            object.insert("crt".into(), json!(sort_value));
        }
        if let Some(created_at) = &self.created_at {
            object.insert("crt-ts".into(), json!(to_epoch_seconds(created_at)));
        }
        if let Some(modified_at) = &self.modified_at {
            object.insert("mod-ts".into(), json!(to_epoch_seconds(modified_at)));
        }
        if !self.sort_keys.is_empty() {
            object.insert("skey".into(), json!(self.sort_keys));
        }
        if let Some(value) = &self.value {
            object.insert("body".into(), JsonValue::Object(value.clone()));
        }
        JsonValue::Object(object)
    }
}

/// Document equality ignores timestamps and sort metadata: two snapshots are
/// the same document state when id, collection, etag and body agree.
impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.collection_id == other.collection_id
            && self.etag == other.etag
            && self.value == other.value
    }
}

impl Eq for Document {}

fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    let seconds = value.as_f64()?;
    DateTime::from_timestamp_millis((seconds * 1_000.0).round() as i64)
}

fn to_epoch_seconds(timestamp: &DateTime<Utc>) -> f64 {
    timestamp.timestamp_millis() as f64 / 1_000.0
}

// Sort tokens are opaque; non-string tokens are kept in their JSON
// rendering so comparisons stay deterministic.
fn opaque_token(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_doc() -> JsonValue {
        json!({
            "id": "doc-1",
            "etag": "e-77",
            "crt": "0005",
            "crt-ts": 1_700_000_000.25,
            "mod-ts": 1_700_000_100.5,
            "skey": ["2024", "b"],
            "body": {"text": "hello", "meta": {"stars": 3}}
        })
    }

    #[test]
    fn wire_round_trip_preserves_payload() {
        let document = Document::from_wire("messages", &wire_doc()).unwrap();
        assert_eq!(document.id, "doc-1");
        assert_eq!(document.collection_id, "messages");
        assert_eq!(document.etag.as_deref(), Some("e-77"));
        assert_eq!(document.sort_keys, vec!["2024", "b"]);
        assert!(!document.is_tombstone());

        let encoded = document.to_wire();
        let decoded = Document::from_wire("messages", &encoded).unwrap();
        assert_eq!(document, decoded);
        assert_eq!(document.sort_keys, decoded.sort_keys);
        assert_eq!(document.created_at, decoded.created_at);
    }

    #[test]
    fn missing_body_is_a_tombstone() {
        let document =
            Document::from_wire("messages", &json!({"id": "gone", "etag": "e1"})).unwrap();
        assert!(document.is_tombstone());
        assert_eq!(document.etag.as_deref(), Some("e1"));
    }

    #[test]
    fn equality_tracks_etag_and_body_only() {
        let a = Document::from_wire("messages", &wire_doc()).unwrap();
        let mut b = a.clone();
        b.sort_keys = vec!["different".into()];
        b.modified_at = None;
        assert_eq!(a, b);

        let mut c = a.clone();
        c.etag = Some("e-78".into());
        assert_ne!(a, c);
    }

    #[test]
    fn non_object_body_is_rejected() {
        let err = Document::from_wire("messages", &json!({"id": "x", "body": 42})).unwrap_err();
        assert_eq!(err.code_str(), "nimbusdb/invalid-data");
    }

    #[test]
    fn deeply_nested_bodies_round_trip() {
        let raw = json!({
            "id": "deep",
            "body": {"a": {"b": {"c": {"d": {"e": [1, {"f": null}, "g"]}}}}}
        });
        let document = Document::from_wire("messages", &raw).unwrap();
        let decoded = Document::from_wire("messages", &document.to_wire()).unwrap();
        assert_eq!(document, decoded);
    }
}
