//! Wire events and the one place where their payloads are interpreted.
//!
//! Servers have shipped several shapes for the same logical field over time
//! (`sessionID` vs `sessionId`, status as a string vs a nested object, parts
//! inside or beside the message). [`decode`] folds all of them into a
//! [`SyncEvent`]; nothing downstream looks at raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{MessageId, PartId, RequestId, SessionId};
use crate::model::{
    MessageInfo, MessageRecord, ModelRef, PartKind, PartRecord, PendingRequest, RequestKind, Role,
    SessionInfo, SessionMetadata, SessionStatus, StatusKind,
};

/// Event as delivered by the push transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
}

impl WireEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }
}

pub mod types {
    pub const SERVER_CONNECTED: &str = "server.connected";
    pub const INSTANCE_DISPOSED: &str = "server.instance.disposed";
    pub const GLOBAL_DISPOSED: &str = "global.disposed";
    pub const TOOLS_CHANGED: &str = "mcp.tools.changed";
    pub const LSP_UPDATED: &str = "lsp.updated";
    pub const SESSION_STATUS: &str = "session.status";
    pub const SESSION_IDLE: &str = "session.idle";
    pub const DERIVED_STATUS: &str = "openchamber:session-status";
    pub const PART_UPDATED: &str = "message.part.updated";
    pub const MESSAGE_UPDATED: &str = "message.updated";
    pub const SESSION_CREATED: &str = "session.created";
    pub const SESSION_UPDATED: &str = "session.updated";
    pub const SESSION_DELETED: &str = "session.deleted";
    pub const SESSION_ABORT: &str = "session.abort";
    pub const SESSION_ABORTED: &str = "session.aborted";
    pub const SESSION_ERROR: &str = "session.error";
    pub const PERMISSION_ASKED: &str = "permission.asked";
    pub const PERMISSION_UPDATED: &str = "permission.updated";
    pub const PERMISSION_REPLIED: &str = "permission.replied";
    pub const QUESTION_ASKED: &str = "question.asked";
    pub const QUESTION_REPLIED: &str = "question.replied";
    pub const QUESTION_REJECTED: &str = "question.rejected";
    pub const NOTIFICATION: &str = "openchamber:notification";
    pub const TODO_UPDATED: &str = "todo.updated";
}

const SESSION_KEYS: &[&str] = &["sessionID", "sessionId", "session_id"];
const MESSAGE_KEYS: &[&str] = &["messageID", "messageId", "message_id"];
const REQUEST_KEYS: &[&str] = &["requestID", "requestId", "permissionID", "permissionId", "id"];

/// Error name the server uses when a run was cancelled by the user.
pub const ABORTED_ERROR_NAME: &str = "MessageAbortedError";

#[derive(Clone, Debug, PartialEq)]
pub struct PartUpdate {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub role: Option<Role>,
    pub part: PartRecord,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessageUpdate {
    pub info: MessageInfo,
    /// `None` when the payload carried no parts field at all.
    pub parts: Option<Vec<PartRecord>>,
}

impl MessageUpdate {
    pub fn has_parts(&self) -> bool {
        self.parts.as_ref().is_some_and(|p| !p.is_empty())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotificationRequest {
    pub title: Option<String>,
    pub body: Option<String>,
    pub tag: Option<String>,
    pub require_hidden: bool,
}

/// Normalised inbound event.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    ServerConnected,
    InstanceDisposed,
    CapabilityChanged {
        capability: String,
        directory: Option<String>,
    },
    SessionStatus {
        session_id: SessionId,
        status: SessionStatus,
    },
    DerivedStatus {
        session_id: SessionId,
        status: SessionStatus,
        needs_attention: bool,
    },
    PartUpdated(PartUpdate),
    MessageUpdated(MessageUpdate),
    SessionUpserted(SessionInfo),
    SessionDeleted {
        session_id: SessionId,
    },
    SessionAborted {
        session_id: SessionId,
        message_id: Option<MessageId>,
    },
    SessionError {
        session_id: Option<SessionId>,
        name: Option<String>,
        message: Option<String>,
    },
    RequestAsked(PendingRequest),
    RequestResolved {
        kind: RequestKind,
        session_id: Option<SessionId>,
        request_id: RequestId,
    },
    Notification(NotificationRequest),
    TodoUpdated {
        session_id: SessionId,
        todos: Vec<Value>,
    },
    /// Recognised type whose payload could not be resolved.
    Malformed {
        event_type: String,
        reason: &'static str,
    },
    Unknown {
        event_type: String,
    },
}

/// Decode a wire event into its normalised form.
pub fn decode(event: &WireEvent) -> SyncEvent {
    let props = &event.properties;
    let malformed = |reason| SyncEvent::Malformed {
        event_type: event.event_type.clone(),
        reason,
    };

    match event.event_type.as_str() {
        types::SERVER_CONNECTED => SyncEvent::ServerConnected,
        types::INSTANCE_DISPOSED | types::GLOBAL_DISPOSED => SyncEvent::InstanceDisposed,
        types::TOOLS_CHANGED => SyncEvent::CapabilityChanged {
            capability: "tools".into(),
            directory: str_at(props, &["directory"]).map(str::to_owned),
        },
        types::LSP_UPDATED => SyncEvent::CapabilityChanged {
            capability: "lsp".into(),
            directory: str_at(props, &["directory"]).map(str::to_owned),
        },
        types::SESSION_STATUS => {
            let Some(session_id) = session_id_at(props) else {
                return malformed("missing session id");
            };
            match decode_status(props) {
                Some(status) => SyncEvent::SessionStatus { session_id, status },
                None => malformed("unrecognised status"),
            }
        }
        types::SESSION_IDLE => match session_id_at(props) {
            Some(session_id) => SyncEvent::SessionStatus {
                session_id,
                status: SessionStatus::idle(),
            },
            None => malformed("missing session id"),
        },
        types::DERIVED_STATUS => {
            let Some(session_id) = session_id_at(props) else {
                return malformed("missing session id");
            };
            let Some(status) = decode_status(props) else {
                return malformed("unrecognised status");
            };
            let needs_attention = bool_at(props, &["needsAttention", "needs_attention"]);
            SyncEvent::DerivedStatus {
                session_id,
                status,
                needs_attention,
            }
        }
        types::PART_UPDATED => decode_part_update(props).unwrap_or_else(malformed),
        types::MESSAGE_UPDATED => decode_message_update(props).unwrap_or_else(malformed),
        types::SESSION_CREATED | types::SESSION_UPDATED => match session_object(props)
            .and_then(decode_session_info)
        {
            Some(info) => SyncEvent::SessionUpserted(info),
            None => malformed("missing session object"),
        },
        types::SESSION_DELETED => {
            let id = session_object(props)
                .and_then(|s| str_at(s, &["id"]))
                .map(SessionId::from)
                .or_else(|| session_id_at(props));
            match id {
                Some(session_id) => SyncEvent::SessionDeleted { session_id },
                None => malformed("missing session id"),
            }
        }
        types::SESSION_ABORT | types::SESSION_ABORTED => match session_id_at(props) {
            Some(session_id) => SyncEvent::SessionAborted {
                session_id,
                message_id: str_at(props, MESSAGE_KEYS).map(MessageId::from),
            },
            None => malformed("missing session id"),
        },
        types::SESSION_ERROR => {
            let error = props.get("error").unwrap_or(&Value::Null);
            SyncEvent::SessionError {
                session_id: session_id_at(props),
                name: str_at(error, &["name"]).map(str::to_owned),
                message: error
                    .get("data")
                    .and_then(|d| str_at(d, &["message"]))
                    .or_else(|| str_at(error, &["message"]))
                    .map(str::to_owned),
            }
        }
        types::PERMISSION_ASKED | types::PERMISSION_UPDATED => {
            decode_request(props, RequestKind::Permission).unwrap_or_else(malformed)
        }
        types::QUESTION_ASKED => {
            decode_request(props, RequestKind::Question).unwrap_or_else(malformed)
        }
        types::PERMISSION_REPLIED => {
            decode_resolution(props, RequestKind::Permission).unwrap_or_else(malformed)
        }
        types::QUESTION_REPLIED | types::QUESTION_REJECTED => {
            decode_resolution(props, RequestKind::Question).unwrap_or_else(malformed)
        }
        types::NOTIFICATION => SyncEvent::Notification(NotificationRequest {
            title: str_at(props, &["title"]).map(str::to_owned),
            body: str_at(props, &["body", "message"]).map(str::to_owned),
            tag: str_at(props, &["tag"]).map(str::to_owned),
            require_hidden: bool_at(props, &["requireHidden", "require_hidden"]),
        }),
        types::TODO_UPDATED => match session_id_at(props) {
            Some(session_id) => SyncEvent::TodoUpdated {
                session_id,
                todos: props
                    .get("todos")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            },
            None => malformed("missing session id"),
        },
        other => SyncEvent::Unknown {
            event_type: other.to_owned(),
        },
    }
}

/// Title/summary carried by a session-shaped sub-object of the payload.
///
/// Abort and error events never count as evidence of fresh metadata.
pub fn session_metadata(event: &WireEvent) -> Option<(SessionId, SessionMetadata)> {
    if matches!(
        event.event_type.as_str(),
        types::SESSION_ABORT | types::SESSION_ABORTED | types::SESSION_ERROR
    ) {
        return None;
    }
    let props = &event.properties;
    let candidate = ["info", "session"]
        .iter()
        .filter_map(|k| props.get(*k))
        .find(|v| is_session_shaped(v))?;
    let id = str_at(candidate, &["id"])?;
    let metadata = SessionMetadata {
        title: str_at(candidate, &["title"]).map(str::to_owned),
        summary: candidate.get("summary").filter(|s| !s.is_null()).cloned(),
    };
    (!metadata.is_empty()).then(|| (SessionId::from(id), metadata))
}

fn is_session_shaped(v: &Value) -> bool {
    v.is_object()
        && v.get("id").is_some_and(Value::is_string)
        && v.get("role").is_none()
        && (v.get("title").is_some() || v.get("summary").is_some())
}

// --- permissive field access ---

fn str_at<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

fn i64_at(v: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| v.get(*k).and_then(Value::as_i64))
}

fn bool_at(v: &Value, keys: &[&str]) -> bool {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(Value::as_bool))
        .unwrap_or(false)
}

fn time_at(v: &Value, key: &str) -> Option<i64> {
    v.get("time").and_then(|t| i64_at(t, &[key]))
}

fn session_id_at(v: &Value) -> Option<SessionId> {
    str_at(v, SESSION_KEYS).map(SessionId::from)
}

/// Parse a status given as a bare string or an object with a `type`-like key.
pub fn parse_status(v: &Value) -> Option<SessionStatus> {
    match v {
        Value::String(s) => StatusKind::parse(s).map(SessionStatus::of),
        Value::Object(map) => {
            let kind = ["type", "status", "state", "kind"]
                .iter()
                .filter_map(|k| map.get(*k))
                .find_map(|inner| match inner {
                    Value::String(s) => StatusKind::parse(s),
                    Value::Object(_) => parse_status(inner).map(|s| s.kind),
                    _ => None,
                })?;
            Some(SessionStatus {
                kind,
                attempt: v
                    .get("attempt")
                    .and_then(Value::as_u64)
                    .and_then(|a| u32::try_from(a).ok()),
                message: str_at(v, &["message"]).map(str::to_owned),
                next: i64_at(v, &["next"]),
            })
        }
        _ => None,
    }
}

fn decode_status(props: &Value) -> Option<SessionStatus> {
    ["status", "state"]
        .iter()
        .filter_map(|k| props.get(*k))
        .find_map(parse_status)
}

/// Decode a single part object. Parts without an id are rejected.
pub fn decode_part(v: &Value) -> Option<PartRecord> {
    let id = str_at(v, &["id"])?;
    let state = match v.get("state") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(obj @ Value::Object(_)) => str_at(obj, &["status"]).map(str::to_owned),
        _ => None,
    };
    Some(PartRecord {
        id: PartId::from(id),
        kind: PartKind::parse(str_at(v, &["type"]).unwrap_or_default()),
        text: v.get("text").and_then(Value::as_str).map(str::to_owned),
        state,
        time_end: time_at(v, "end"),
        synthetic: bool_at(v, &["synthetic"]),
    })
}

fn decode_parts(v: &Value) -> Vec<PartRecord> {
    v.as_array()
        .map(|items| items.iter().filter_map(decode_part).collect())
        .unwrap_or_default()
}

fn decode_part_update(props: &Value) -> Result<SyncEvent, &'static str> {
    let raw = props
        .get("part")
        .filter(|p| p.is_object())
        .ok_or("missing part")?;
    let info = props.get("info").filter(|i| i.is_object());

    let session_id = str_at(raw, SESSION_KEYS)
        .or_else(|| str_at(props, SESSION_KEYS))
        .or_else(|| info.and_then(|i| str_at(i, SESSION_KEYS)))
        .ok_or("unresolved session id")?;
    let message_id = str_at(raw, MESSAGE_KEYS)
        .or_else(|| str_at(props, MESSAGE_KEYS))
        .or_else(|| info.and_then(|i| str_at(i, &["id"])))
        .ok_or("unresolved message id")?;
    let role = str_at(props, &["role"])
        .or_else(|| str_at(raw, &["role"]))
        .or_else(|| info.and_then(|i| str_at(i, &["role"])))
        .map(Role::parse);
    let part = decode_part(raw).ok_or("part without id")?;

    Ok(SyncEvent::PartUpdated(PartUpdate {
        session_id: SessionId::from(session_id),
        message_id: MessageId::from(message_id),
        role,
        part,
    }))
}

fn decode_model(raw: &Value) -> Option<ModelRef> {
    let source = raw.get("model").filter(|m| m.is_object()).unwrap_or(raw);
    let provider_id = str_at(source, &["providerID", "providerId"])?;
    let model_id = str_at(source, &["modelID", "modelId"])?;
    Some(ModelRef {
        provider_id: provider_id.to_owned(),
        model_id: model_id.to_owned(),
    })
}

fn decode_message_update(props: &Value) -> Result<SyncEvent, &'static str> {
    let raw = ["info", "message"]
        .iter()
        .filter_map(|k| props.get(*k))
        .find(|v| v.is_object())
        .ok_or("missing message object")?;

    let id = str_at(raw, &["id"])
        .or_else(|| str_at(props, MESSAGE_KEYS))
        .ok_or("unresolved message id")?;
    let session_id = str_at(raw, SESSION_KEYS)
        .or_else(|| str_at(props, SESSION_KEYS))
        .ok_or("unresolved session id")?;

    let mut info = MessageInfo::new(
        MessageId::from(id),
        SessionId::from(session_id),
        Role::parse(str_at(raw, &["role"]).unwrap_or_default()),
    );
    info.created = time_at(raw, "created");
    info.completed = time_at(raw, "completed");
    info.finish = str_at(raw, &["finish", "finishReason"]).map(str::to_owned);
    info.status = match raw.get("status") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(obj @ Value::Object(_)) => str_at(obj, &["type", "status"]).map(str::to_owned),
        _ => None,
    };
    info.agent = str_at(raw, &["agent"]).map(str::to_owned);
    info.mode = str_at(raw, &["mode"]).map(str::to_owned);
    info.model = decode_model(raw);
    info.summary = raw.get("summary").and_then(Value::as_bool).unwrap_or(false);

    let parts = raw
        .get("parts")
        .or_else(|| props.get("parts"))
        .filter(|p| p.is_array())
        .map(decode_parts);

    Ok(SyncEvent::MessageUpdated(MessageUpdate { info, parts }))
}

/// Decode a history entry shaped `{ info, parts }`.
pub fn decode_message_record(raw: &Value) -> Option<MessageRecord> {
    match decode_message_update(raw) {
        Ok(SyncEvent::MessageUpdated(update)) => Some(MessageRecord::with_parts(
            update.info,
            update.parts.unwrap_or_default(),
        )),
        _ => None,
    }
}

fn session_object(props: &Value) -> Option<&Value> {
    ["info", "session"]
        .iter()
        .filter_map(|k| props.get(*k))
        .find(|v| v.is_object())
        .or_else(|| props.get("id").is_some().then_some(props))
}

pub fn decode_session_info(raw: &Value) -> Option<SessionInfo> {
    let mut info = SessionInfo::new(SessionId::from(str_at(raw, &["id"])?));
    info.title = str_at(raw, &["title"]).map(str::to_owned);
    info.summary = raw.get("summary").filter(|s| !s.is_null()).cloned();
    info.directory = str_at(raw, &["directory"]).map(str::to_owned);
    info.parent_id = str_at(raw, &["parentID", "parentId"]).map(SessionId::from);
    info.created = time_at(raw, "created");
    info.updated = time_at(raw, "updated");
    info.compacting = time_at(raw, "compacting");
    Some(info)
}

fn request_object(props: &Value) -> &Value {
    ["request", "permission", "question"]
        .iter()
        .filter_map(|k| props.get(*k))
        .find(|v| v.is_object())
        .unwrap_or(props)
}

fn decode_request(props: &Value, kind: RequestKind) -> Result<SyncEvent, &'static str> {
    let raw = request_object(props);
    let id = str_at(raw, &["id"])
        .or_else(|| str_at(props, REQUEST_KEYS))
        .ok_or("missing request id")?;
    let session_id = str_at(raw, SESSION_KEYS)
        .or_else(|| str_at(props, SESSION_KEYS))
        .ok_or("missing session id")?;
    let title = str_at(raw, &["title", "permission", "type"])
        .map(str::to_owned)
        .or_else(|| {
            raw.get("questions")
                .and_then(Value::as_array)
                .and_then(|qs| qs.first())
                .and_then(|q| str_at(q, &["question", "header"]))
                .map(str::to_owned)
        });
    Ok(SyncEvent::RequestAsked(PendingRequest {
        id: RequestId::from(id),
        session_id: SessionId::from(session_id),
        kind,
        title,
        payload: raw.clone(),
    }))
}

fn decode_resolution(props: &Value, kind: RequestKind) -> Result<SyncEvent, &'static str> {
    let request_id = str_at(props, REQUEST_KEYS).ok_or("missing request id")?;
    Ok(SyncEvent::RequestResolved {
        kind,
        session_id: session_id_at(props),
        request_id: RequestId::from(request_id),
    })
}
