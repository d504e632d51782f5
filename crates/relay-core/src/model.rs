use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::ids::{MessageId, PartId, RequestId, SessionId};

/// Status strings that mark a message as finished.
pub const COMPLETED_STATUSES: &[&str] = &["completed", "complete"];

/// Terminal finish marker written by the server once a message is final.
pub const FINISH_STOP: &str = "stop";

/// Wall clock in epoch milliseconds, the unit the server uses for timestamps.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// --- Connection ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Paused,
    Offline,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Paused => "paused",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide view of the realtime stream.
#[derive(Clone, Debug)]
pub struct StreamConnectionState {
    pub status: ConnectionStatus,
    pub hint: Option<String>,
    pub reconnect_attempts: u32,
    pub last_event_at: Option<Instant>,
}

impl Default for StreamConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            hint: None,
            reconnect_attempts: 0,
            last_event_at: None,
        }
    }
}

// --- Session status ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Idle,
    Busy,
    Retry,
}

impl StatusKind {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Busy | Self::Retry)
    }

    /// Lenient parse: accepts the historical spellings servers have used.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" | "ready" | "done" => Some(Self::Idle),
            "busy" | "running" | "working" | "streaming" => Some(Self::Busy),
            "retry" | "retrying" => Some(Self::Retry),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    #[serde(rename = "type")]
    pub kind: StatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<i64>,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self::of(StatusKind::Idle)
    }

    pub fn busy() -> Self {
        Self::of(StatusKind::Busy)
    }

    pub fn of(kind: StatusKind) -> Self {
        Self {
            kind,
            attempt: None,
            message: None,
            next: None,
        }
    }
}

/// Stored status for one session. `confirmed_at` is stamped on the
/// transition into idle and kept across repeated idle updates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStatusRecord {
    pub status: SessionStatus,
    pub confirmed_at: Option<Instant>,
}

impl SessionStatusRecord {
    pub fn kind(&self) -> StatusKind {
        self.status.kind
    }
}

// --- Messages ---

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    #[serde(other)]
    Other,
}

impl Role {
    pub fn parse(s: &str) -> Self {
        match s {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            _ => Self::Other,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartKind {
    Text,
    Tool,
    Reasoning,
    File,
    StepStart,
    StepFinish,
    #[serde(other)]
    Other,
}

impl PartKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "text" => Self::Text,
            "tool" => Self::Tool,
            "reasoning" => Self::Reasoning,
            "file" => Self::File,
            "step-start" => Self::StepStart,
            "step-finish" => Self::StepFinish,
            _ => Self::Other,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartRecord {
    pub id: PartId,
    #[serde(rename = "type")]
    pub kind: PartKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Tool lifecycle state (`pending`, `running`, `completed`, `error`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_end: Option<i64>,
    #[serde(default)]
    pub synthetic: bool,
}

impl PartRecord {
    /// Literal content length counted by the shrink guard.
    pub fn text_len(&self) -> usize {
        match self.kind {
            PartKind::Text => self.text.as_deref().map_or(0, |t| t.chars().count()),
            _ => 0,
        }
    }

    /// Whether this part is evidence of an assistant that is still producing output.
    pub fn looks_streaming(&self) -> bool {
        match self.kind {
            PartKind::Tool => matches!(self.state.as_deref(), Some("running" | "pending")),
            PartKind::Reasoning => self.time_end.is_none(),
            PartKind::Text => {
                self.time_end.is_none() && self.text.as_deref().is_some_and(|t| !t.is_empty())
            }
            PartKind::StepStart => true,
            _ => false,
        }
    }
}

/// Sum of text-part lengths.
pub fn text_len(parts: &[PartRecord]) -> usize {
    parts.iter().map(PartRecord::text_len).sum()
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
}

/// Message metadata without its parts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    /// Set on the assistant message produced by a compaction/summarisation run.
    #[serde(default)]
    pub summary: bool,
}

impl MessageInfo {
    pub fn new(id: MessageId, session_id: SessionId, role: Role) -> Self {
        Self {
            id,
            session_id,
            role,
            created: None,
            completed: None,
            finish: None,
            status: None,
            agent: None,
            mode: None,
            model: None,
            summary: false,
        }
    }

    pub fn has_stop(&self) -> bool {
        self.finish.as_deref() == Some(FINISH_STOP)
    }

    pub fn has_completed_status(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| COMPLETED_STATUSES.contains(&s))
    }

    /// Any of the three completion signals.
    pub fn signals_completion(&self) -> bool {
        self.completed.is_some() || self.has_completed_status() || self.has_stop()
    }

    /// Selected agent, falling back to the legacy `mode` field.
    pub fn selected_agent(&self) -> Option<&str> {
        self.agent
            .as_deref()
            .or(self.mode.as_deref())
            .filter(|a| !a.is_empty())
    }
}

/// A message as held by the store. Parts collections are replaced on every
/// change, never mutated in place, so `Arc` identity tracks content identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRecord {
    pub info: MessageInfo,
    pub parts: Arc<Vec<PartRecord>>,
}

impl MessageRecord {
    pub fn new(info: MessageInfo) -> Self {
        Self {
            info,
            parts: Arc::new(Vec::new()),
        }
    }

    pub fn with_parts(info: MessageInfo, parts: Vec<PartRecord>) -> Self {
        Self {
            info,
            parts: Arc::new(parts),
        }
    }
}

// --- Sessions ---

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
}

impl SessionMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.summary.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i64>,
    /// Start of an in-progress compaction, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacting: Option<i64>,
}

impl SessionInfo {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            title: None,
            summary: None,
            directory: None,
            parent_id: None,
            created: None,
            updated: None,
            compacting: None,
        }
    }
}

/// Agent/model selection carried by a user message, with the ordering keys
/// used to reject out-of-order replays.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSelection {
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
}

// --- Requests & notifications ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Permission,
    Question,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permission => "permission",
            Self::Question => "question",
        }
    }
}

/// A pending permission or question the user has to answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: RequestId,
    pub session_id: SessionId,
    pub kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(kind: PartKind) -> PartRecord {
        PartRecord {
            id: PartId::from_raw("prt_1"),
            kind,
            text: None,
            state: None,
            time_end: None,
            synthetic: false,
        }
    }

    #[test]
    fn status_kind_parses_historical_names() {
        assert_eq!(StatusKind::parse("BUSY"), Some(StatusKind::Busy));
        assert_eq!(StatusKind::parse("working"), Some(StatusKind::Busy));
        assert_eq!(StatusKind::parse("retrying"), Some(StatusKind::Retry));
        assert_eq!(StatusKind::parse("idle"), Some(StatusKind::Idle));
        assert_eq!(StatusKind::parse("sleeping"), None);
    }

    #[test]
    fn text_len_counts_only_text_parts() {
        let mut text = part(PartKind::Text);
        text.text = Some("hello".into());
        let mut reasoning = part(PartKind::Reasoning);
        reasoning.text = Some("thinking hard".into());
        assert_eq!(text_len(&[text, reasoning]), 5);
    }

    #[test]
    fn streaming_heuristics() {
        let mut tool = part(PartKind::Tool);
        tool.state = Some("running".into());
        assert!(tool.looks_streaming());
        tool.state = Some("completed".into());
        assert!(!tool.looks_streaming());

        let mut text = part(PartKind::Text);
        assert!(!text.looks_streaming(), "empty text is not evidence");
        text.text = Some("partial".into());
        assert!(text.looks_streaming());
        text.time_end = Some(10);
        assert!(!text.looks_streaming());

        assert!(part(PartKind::Reasoning).looks_streaming());
        assert!(part(PartKind::StepStart).looks_streaming());
        assert!(!part(PartKind::StepFinish).looks_streaming());
    }

    #[test]
    fn completion_signals() {
        let mut info = MessageInfo::new("msg_1".into(), "ses_1".into(), Role::Assistant);
        assert!(!info.signals_completion());
        info.status = Some("completed".into());
        assert!(info.signals_completion());
        info.status = None;
        info.finish = Some("stop".into());
        assert!(info.has_stop());
        info.finish = Some("tool-calls".into());
        assert!(!info.signals_completion());
        info.completed = Some(5);
        assert!(info.signals_completion());
    }

    #[test]
    fn selected_agent_falls_back_to_mode() {
        let mut info = MessageInfo::new("msg_1".into(), "ses_1".into(), Role::User);
        info.mode = Some("plan".into());
        assert_eq!(info.selected_agent(), Some("plan"));
        info.agent = Some("build".into());
        assert_eq!(info.selected_agent(), Some("build"));
    }

    #[test]
    fn part_kind_serde_uses_kebab_case() {
        let json = serde_json::to_string(&PartKind::StepStart).unwrap();
        assert_eq!(json, "\"step-start\"");
        let parsed: PartKind = serde_json::from_str("\"patch\"").unwrap();
        assert_eq!(parsed, PartKind::Other);
    }
}
