//! Wire codec: serializes client frames and parses server frames.
//!
//! Every frame is a single-key JSON object whose key tags the variant; the
//! payload always carries `evt-id`. A server `batch` envelope is unpacked
//! here, and consecutive subscription-update frames for the same
//! subscription are collapsed into one [`SubscriptionBatch`] so the session
//! applies a single merged diff per delivery.

use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::error::{
    invalid_data, InvalidDataReason, NimbusErrorCode, NimbusResult,
};
use crate::model::Document;
use crate::query::Query;
use crate::util::validate::{validate_document_value, validate_identifier};

/// Body plus addressing of a document being written.
#[derive(Clone, Debug, PartialEq)]
pub struct WritePayload {
    pub id: String,
    pub etag: Option<String>,
    pub body: JsonMap<String, JsonValue>,
}

/// Outbound request payloads. The event-id is supplied at serialization
/// time by the session, which owns id assignment.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientFrame {
    Connect { connection_id: String },
    Reconnect { connection_id: String },
    Disconnect,
    Nop,
    Auth { token: String },
    Deauth,
    Mutate { collection_id: String, payload: WritePayload },
    Merge { collection_id: String, payload: WritePayload },
    Delete {
        collection_id: String,
        document_id: String,
        etag: Option<String>,
    },
    Subscribe { subscription_id: String, query: Query },
    Unsubscribe { subscription_id: String },
    Fetch { fetch_id: String, query: Query },
    /// Client-side acknowledgement of a server-sent subscription event;
    /// `evt-id` echoes the acknowledged event rather than a fresh id.
    Ack,
}

impl ClientFrame {
    pub fn tag(&self) -> &'static str {
        match self {
            ClientFrame::Connect { .. } => "con",
            ClientFrame::Reconnect { .. } => "rec",
            ClientFrame::Disconnect => "dis",
            ClientFrame::Nop => "nop",
            ClientFrame::Auth { .. } => "auth",
            ClientFrame::Deauth => "deauth",
            ClientFrame::Mutate { .. } => "mut",
            ClientFrame::Merge { .. } => "mer",
            ClientFrame::Delete { .. } => "del",
            ClientFrame::Subscribe { .. } => "sub",
            ClientFrame::Unsubscribe { .. } => "uns",
            ClientFrame::Fetch { .. } => "ftc",
            ClientFrame::Ack => "ack",
        }
    }
}

/// Serializes one outbound frame to its wire text. All identifier, key-path
/// and document validation happens here; failures never reach the transport.
pub fn serialize_client_frame(frame: &ClientFrame, event_id: &str) -> NimbusResult<String> {
    let mut payload = JsonMap::new();
    payload.insert("evt-id".into(), json!(event_id));

    match frame {
        ClientFrame::Connect { connection_id } | ClientFrame::Reconnect { connection_id } => {
            validate_identifier(connection_id)?;
            payload.insert("con-id".into(), json!(connection_id));
        }
        ClientFrame::Disconnect | ClientFrame::Nop | ClientFrame::Deauth | ClientFrame::Ack => {}
        ClientFrame::Auth { token } => {
            payload.insert("token".into(), json!(token));
        }
        ClientFrame::Mutate {
            collection_id,
            payload: write,
        }
        | ClientFrame::Merge {
            collection_id,
            payload: write,
        } => {
            validate_identifier(collection_id)?;
            validate_identifier(&write.id)?;
            validate_document_value(&write.body)?;
            payload.insert("col-id".into(), json!(collection_id));
            payload.insert("doc".into(), write_document_json(write));
        }
        ClientFrame::Delete {
            collection_id,
            document_id,
            etag,
        } => {
            validate_identifier(collection_id)?;
            validate_identifier(document_id)?;
            payload.insert("col-id".into(), json!(collection_id));
            let mut doc = JsonMap::new();
            doc.insert("id".into(), json!(document_id));
            if let Some(etag) = etag {
                doc.insert("etag".into(), json!(etag));
            }
            payload.insert("doc".into(), JsonValue::Object(doc));
        }
        ClientFrame::Subscribe {
            subscription_id,
            query,
        } => {
            validate_identifier(subscription_id)?;
            validate_identifier(&query.collection_id)?;
            query.validate()?;
            payload.insert("sub-id".into(), json!(subscription_id));
            payload.insert("col-id".into(), json!(query.collection_id));
            query.write_wire_fields(&mut payload);
        }
        ClientFrame::Unsubscribe { subscription_id } => {
            validate_identifier(subscription_id)?;
            payload.insert("sub-id".into(), json!(subscription_id));
        }
        ClientFrame::Fetch { fetch_id, query } => {
            validate_identifier(fetch_id)?;
            validate_identifier(&query.collection_id)?;
            query.validate()?;
            payload.insert("ftc-id".into(), json!(fetch_id));
            payload.insert("col-id".into(), json!(query.collection_id));
            query.write_wire_fields(&mut payload);
        }
    }

    let envelope = json!({ frame.tag(): JsonValue::Object(payload) });
    serde_json::to_string(&envelope).map_err(|err| {
        invalid_data(
            InvalidDataReason::SerializationFailure,
            format!("failed to encode {} frame: {err}", frame.tag()),
        )
    })
}

fn write_document_json(write: &WritePayload) -> JsonValue {
    let mut doc = JsonMap::new();
    doc.insert("id".into(), json!(write.id));
    if let Some(etag) = &write.etag {
        doc.insert("etag".into(), json!(etag));
    }
    doc.insert("body".into(), JsonValue::Object(write.body.clone()));
    JsonValue::Object(doc)
}

/// One merged subscription delivery: an optional full snapshot plus ordered
/// per-document deltas (removals arrive as tombstones). `event_ids` holds
/// every collapsed frame id for bulk acknowledgement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubscriptionBatch {
    pub subscription_id: String,
    pub collection_id: String,
    pub collection: Option<Vec<Document>>,
    pub updates: Vec<Document>,
    pub event_ids: Vec<String>,
}

impl SubscriptionBatch {
    /// Merge rule: a snapshot supersedes everything buffered so far; deltas
    /// append in arrival order; event-ids always accumulate.
    fn absorb(&mut self, other: SubscriptionBatch) {
        if other.collection.is_some() {
            self.collection = other.collection;
            self.updates = other.updates;
        } else {
            self.updates.extend(other.updates);
        }
        self.event_ids.extend(other.event_ids);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    Ack {
        event_id: String,
    },
    Error {
        event_id: Option<String>,
        code: NimbusErrorCode,
        message: Option<String>,
    },
    Subscription(SubscriptionBatch),
    SubscriptionCancel {
        subscription_id: String,
        collection_id: String,
    },
    FetchResponse {
        fetch_id: String,
        collection_id: String,
        documents: Vec<Document>,
    },
}

/// Parses one inbound text frame into session-ready messages. A `batch`
/// envelope yields several; consecutive subscription frames for the same
/// subscription collapse into one.
pub fn parse_server_frame(text: &str) -> NimbusResult<Vec<ServerMessage>> {
    let value: JsonValue = serde_json::from_str(text).map_err(|err| {
        invalid_data(
            InvalidDataReason::SerializationFailure,
            format!("failed to decode server frame: {err}"),
        )
    })?;

    let (tag, payload) = untag(&value)?;
    if tag == "batch" {
        let frames = payload.as_array().ok_or_else(|| {
            invalid_data(
                InvalidDataReason::SerializationFailure,
                "batch payload must be an array",
            )
        })?;
        let mut messages = Vec::new();
        let mut buffered: Option<SubscriptionBatch> = None;
        for frame in frames {
            let (inner_tag, inner_payload) = untag(frame)?;
            match parse_single(inner_tag, inner_payload)? {
                ServerMessage::Subscription(batch) => match buffered.take() {
                    Some(mut current)
                        if current.subscription_id == batch.subscription_id =>
                    {
                        current.absorb(batch);
                        buffered = Some(current);
                    }
                    Some(done) => {
                        messages.push(ServerMessage::Subscription(done));
                        buffered = Some(batch);
                    }
                    None => buffered = Some(batch),
                },
                other => {
                    if let Some(done) = buffered.take() {
                        messages.push(ServerMessage::Subscription(done));
                    }
                    messages.push(other);
                }
            }
        }
        if let Some(done) = buffered.take() {
            messages.push(ServerMessage::Subscription(done));
        }
        Ok(messages)
    } else {
        Ok(vec![parse_single(tag, payload)?])
    }
}

fn untag(value: &JsonValue) -> NimbusResult<(&str, &JsonValue)> {
    let object = value.as_object().filter(|object| object.len() == 1);
    object
        .and_then(|object| object.iter().next())
        .map(|(tag, payload)| (tag.as_str(), payload))
        .ok_or_else(|| {
            invalid_data(
                InvalidDataReason::SerializationFailure,
                "server frame must be a single-key object",
            )
        })
}

fn parse_single(tag: &str, payload: &JsonValue) -> NimbusResult<ServerMessage> {
    let object = payload.as_object().ok_or_else(|| {
        invalid_data(
            InvalidDataReason::SerializationFailure,
            format!("'{tag}' payload is not a JSON object"),
        )
    })?;

    match tag {
        "ack" => Ok(ServerMessage::Ack {
            event_id: require_str(object, "evt-id", tag)?,
        }),
        "err" => {
            let code = object
                .get("err-type")
                .and_then(JsonValue::as_str)
                .map(NimbusErrorCode::from_wire)
                .unwrap_or(NimbusErrorCode::Default);
            Ok(ServerMessage::Error {
                event_id: optional_str(object, "evt-id"),
                code,
                message: optional_str(object, "err-msg"),
            })
        }
        "val" => {
            let collection_id = require_str(object, "col-id", tag)?;
            let documents = object
                .get("docs")
                .and_then(JsonValue::as_array)
                .map(|docs| {
                    docs.iter()
                        .map(|doc| Document::from_wire(&collection_id, doc))
                        .collect::<NimbusResult<Vec<_>>>()
                })
                .transpose()?
                .unwrap_or_default();
            Ok(ServerMessage::Subscription(SubscriptionBatch {
                subscription_id: require_str(object, "sub-id", tag)?,
                collection_id,
                collection: Some(documents),
                updates: Vec::new(),
                event_ids: event_ids(object),
            }))
        }
        "upd" | "rm" => {
            let collection_id = require_str(object, "col-id", tag)?;
            let raw = object.get("doc").ok_or_else(|| {
                invalid_data(
                    InvalidDataReason::SerializationFailure,
                    format!("'{tag}' payload is missing 'doc'"),
                )
            })?;
            let mut document = Document::from_wire(&collection_id, raw)?;
            if tag == "rm" {
                // Removal frames may still carry a body; the delta applied
                // locally is always a tombstone.
                document.value = None;
            }
            Ok(ServerMessage::Subscription(SubscriptionBatch {
                subscription_id: require_str(object, "sub-id", tag)?,
                collection_id,
                collection: None,
                updates: vec![document],
                event_ids: event_ids(object),
            }))
        }
        "ca" => Ok(ServerMessage::SubscriptionCancel {
            subscription_id: require_str(object, "sub-id", tag)?,
            collection_id: require_str(object, "col-id", tag)?,
        }),
        "res" => {
            let collection_id = require_str(object, "col-id", tag)?;
            let documents = object
                .get("docs")
                .and_then(JsonValue::as_array)
                .map(|docs| {
                    docs.iter()
                        .map(|doc| Document::from_wire(&collection_id, doc))
                        .collect::<NimbusResult<Vec<_>>>()
                })
                .transpose()?
                .unwrap_or_default();
            Ok(ServerMessage::FetchResponse {
                fetch_id: require_str(object, "ftc-id", tag)?,
                collection_id,
                documents,
            })
        }
        other => Err(invalid_data(
            InvalidDataReason::SerializationFailure,
            format!("unknown server frame tag '{other}'"),
        )),
    }
}

fn require_str(
    object: &JsonMap<String, JsonValue>,
    field: &str,
    tag: &str,
) -> NimbusResult<String> {
    object
        .get(field)
        .and_then(JsonValue::as_str)
        .map(str::to_owned)
        .ok_or_else(|| {
            invalid_data(
                InvalidDataReason::SerializationFailure,
                format!("'{tag}' payload is missing '{field}'"),
            )
        })
}

fn optional_str(object: &JsonMap<String, JsonValue>, field: &str) -> Option<String> {
    object
        .get(field)
        .and_then(JsonValue::as_str)
        .map(str::to_owned)
}

fn event_ids(object: &JsonMap<String, JsonValue>) -> Vec<String> {
    optional_str(object, "evt-id").into_iter().collect()
}
