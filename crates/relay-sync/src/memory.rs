//! In-process [`SyncStore`] implementation.
//!
//! Used by the replay tool and the test suite. A single `RwLock` guards the
//! whole state, so each trait call is one atomic update.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use relay_core::ids::{MessageId, RequestId, SessionId};
use relay_core::model::{
    AgentSelection, MessageInfo, MessageRecord, ModelRef, PartRecord, PendingRequest, RequestKind,
    SessionInfo, SessionMetadata, SessionStatus, SessionStatusRecord,
};

use crate::store::SyncStore;

#[derive(Default)]
struct MemoryState {
    active: Option<SessionId>,
    sessions: BTreeMap<SessionId, SessionInfo>,
    statuses: HashMap<SessionId, SessionStatusRecord>,
    attention: HashSet<SessionId>,
    trimmed: HashMap<SessionId, MessageId>,
    messages: HashMap<SessionId, BTreeMap<MessageId, MessageRecord>>,
    cooldowns: HashMap<SessionId, Instant>,
    last_user_message: HashMap<SessionId, i64>,
    selections: HashMap<SessionId, AgentSelection>,
    session_agents: HashMap<SessionId, String>,
    session_models: HashMap<SessionId, ModelRef>,
    live: Option<(String, Option<ModelRef>)>,
    known_agents: HashSet<String>,
    requests: HashMap<(RequestKind, RequestId), PendingRequest>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

/// Serializable view of one session.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<SessionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    pub needs_attention: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<AgentSelection>,
    pub pending_requests: Vec<PendingRequest>,
    pub messages: Vec<MessageRecord>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_session: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_agent: Option<String>,
    pub sessions: Vec<SessionSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active_session(&self, id: Option<SessionId>) {
        self.state.write().active = id;
    }

    pub fn set_known_agents<I, S>(&self, agents: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.write().known_agents = agents.into_iter().map(Into::into).collect();
    }

    pub fn set_streaming_cooldown(&self, session: &SessionId, until: Option<Instant>) {
        let mut state = self.state.write();
        match until {
            Some(t) => {
                state.cooldowns.insert(session.clone(), t);
            }
            None => {
                state.cooldowns.remove(session);
            }
        }
    }

    pub fn session_agent(&self, session: &SessionId) -> Option<String> {
        self.state.read().session_agents.get(session).cloned()
    }

    pub fn session_model(&self, session: &SessionId) -> Option<ModelRef> {
        self.state.read().session_models.get(session).cloned()
    }

    pub fn live_selection(&self) -> Option<(String, Option<ModelRef>)> {
        self.state.read().live.clone()
    }

    pub fn last_user_message_at(&self, session: &SessionId) -> Option<i64> {
        self.state.read().last_user_message.get(session).copied()
    }

    pub fn request_count(&self) -> usize {
        self.state.read().requests.len()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read();
        let ids: BTreeSet<&SessionId> = state
            .sessions
            .keys()
            .chain(state.statuses.keys())
            .chain(state.messages.keys())
            .collect();

        let sessions = ids
            .into_iter()
            .map(|id| {
                let mut pending_requests: Vec<PendingRequest> = state
                    .requests
                    .values()
                    .filter(|r| &r.session_id == id)
                    .cloned()
                    .collect();
                pending_requests.sort_by(|a, b| a.id.cmp(&b.id));
                SessionSnapshot {
                    id: id.clone(),
                    info: state.sessions.get(id).cloned(),
                    status: state.statuses.get(id).map(|r| r.status.clone()),
                    needs_attention: state.attention.contains(id),
                    agent: state.session_agents.get(id).cloned(),
                    model: state.session_models.get(id).cloned(),
                    selection: state.selections.get(id).cloned(),
                    pending_requests,
                    messages: state
                        .messages
                        .get(id)
                        .map(|m| m.values().cloned().collect())
                        .unwrap_or_default(),
                }
            })
            .collect();

        StoreSnapshot {
            active_session: state.active.clone(),
            live_agent: state.live.as_ref().map(|(agent, _)| agent.clone()),
            sessions,
        }
    }
}

impl SyncStore for MemoryStore {
    fn active_session(&self) -> Option<SessionId> {
        self.state.read().active.clone()
    }

    fn session(&self, id: &SessionId) -> Option<SessionInfo> {
        self.state.read().sessions.get(id).cloned()
    }

    fn upsert_session(&self, mut info: SessionInfo) {
        let mut state = self.state.write();
        if info.directory.is_none() {
            info.directory = state
                .sessions
                .get(&info.id)
                .and_then(|s| s.directory.clone());
        }
        state.sessions.insert(info.id.clone(), info);
    }

    fn remove_session(&self, id: &SessionId) {
        let mut state = self.state.write();
        state.sessions.remove(id);
        state.statuses.remove(id);
        state.attention.remove(id);
        state.messages.remove(id);
        state.trimmed.remove(id);
        state.selections.remove(id);
        state.requests.retain(|_, r| &r.session_id != id);
        if state.active.as_ref() == Some(id) {
            state.active = None;
        }
    }

    fn replace_sessions(&self, sessions: Vec<SessionInfo>) {
        let mut state = self.state.write();
        let previous = std::mem::take(&mut state.sessions);
        for mut info in sessions {
            if info.directory.is_none() {
                info.directory = previous.get(&info.id).and_then(|s| s.directory.clone());
            }
            state.sessions.insert(info.id.clone(), info);
        }
    }

    fn update_session_metadata(&self, id: &SessionId, metadata: SessionMetadata) {
        let mut state = self.state.write();
        let session = state
            .sessions
            .entry(id.clone())
            .or_insert_with(|| SessionInfo::new(id.clone()));
        if let Some(title) = metadata.title {
            session.title = Some(title);
        }
        if let Some(summary) = metadata.summary {
            session.summary = Some(summary);
        }
    }

    fn set_compacting(&self, id: &SessionId, since: Option<i64>) {
        if let Some(session) = self.state.write().sessions.get_mut(id) {
            session.compacting = since;
        }
    }

    fn session_status(&self, id: &SessionId) -> Option<SessionStatusRecord> {
        self.state.read().statuses.get(id).cloned()
    }

    fn set_session_status(&self, id: &SessionId, record: SessionStatusRecord) {
        self.state.write().statuses.insert(id.clone(), record);
    }

    fn set_status_with_attention(
        &self,
        id: &SessionId,
        record: SessionStatusRecord,
        needs_attention: bool,
    ) {
        let mut state = self.state.write();
        state.statuses.insert(id.clone(), record);
        if needs_attention {
            state.attention.insert(id.clone());
        } else {
            state.attention.remove(id);
        }
    }

    fn needs_attention(&self, id: &SessionId) -> bool {
        self.state.read().attention.contains(id)
    }

    fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .state
            .read()
            .statuses
            .iter()
            .filter(|(_, r)| r.kind().is_active())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn trimmed_head(&self, id: &SessionId) -> Option<MessageId> {
        self.state.read().trimmed.get(id).cloned()
    }

    fn set_trimmed_head(&self, id: &SessionId, marker: MessageId) {
        let mut state = self.state.write();
        if let Some(messages) = state.messages.get_mut(id) {
            messages.retain(|mid, _| mid.is_newer_than(&marker));
        }
        state.trimmed.insert(id.clone(), marker);
    }

    fn message(&self, session: &SessionId, message: &MessageId) -> Option<MessageRecord> {
        self.state
            .read()
            .messages
            .get(session)
            .and_then(|m| m.get(message))
            .cloned()
    }

    fn messages(&self, session: &SessionId) -> Vec<MessageRecord> {
        self.state
            .read()
            .messages
            .get(session)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    fn upsert_message_info(&self, info: MessageInfo) {
        let mut state = self.state.write();
        let messages = state.messages.entry(info.session_id.clone()).or_default();
        match messages.get_mut(&info.id) {
            Some(record) => record.info = info,
            None => {
                messages.insert(info.id.clone(), MessageRecord::new(info));
            }
        }
    }

    fn merge_part(&self, session: &SessionId, message: &MessageId, part: PartRecord) {
        let mut state = self.state.write();
        let Some(record) = state
            .messages
            .get_mut(session)
            .and_then(|m| m.get_mut(message))
        else {
            return;
        };
        let mut parts: Vec<PartRecord> = record.parts.as_ref().clone();
        match parts.iter_mut().find(|p| p.id == part.id) {
            Some(existing) => *existing = part,
            None => parts.push(part),
        }
        record.parts = Arc::new(parts);
    }

    fn mark_message_complete(&self, session: &SessionId, message: &MessageId, completed_at: i64) {
        let mut state = self.state.write();
        if let Some(record) = state
            .messages
            .get_mut(session)
            .and_then(|m| m.get_mut(message))
        {
            if record.info.completed.is_none() {
                record.info.completed = Some(completed_at);
            }
        }
    }

    fn replace_messages(&self, session: &SessionId, messages: Vec<MessageRecord>) {
        let map = messages
            .into_iter()
            .map(|m| (m.info.id.clone(), m))
            .collect();
        self.state.write().messages.insert(session.clone(), map);
    }

    fn streaming_cooldown_until(&self, session: &SessionId) -> Option<Instant> {
        self.state.read().cooldowns.get(session).copied()
    }

    fn set_last_user_message_at(&self, session: &SessionId, at: i64) {
        let mut state = self.state.write();
        let slot = state.last_user_message.entry(session.clone()).or_insert(at);
        *slot = (*slot).max(at);
    }

    fn agent_selection(&self, session: &SessionId) -> Option<AgentSelection> {
        self.state.read().selections.get(session).cloned()
    }

    fn set_agent_selection(&self, session: &SessionId, selection: AgentSelection) {
        self.state
            .write()
            .selections
            .insert(session.clone(), selection);
    }

    fn is_known_agent(&self, agent: &str) -> bool {
        self.state.read().known_agents.contains(agent)
    }

    fn set_session_agent(&self, session: &SessionId, agent: &str) {
        self.state
            .write()
            .session_agents
            .insert(session.clone(), agent.to_string());
    }

    fn set_session_model(&self, session: &SessionId, model: &ModelRef) {
        self.state
            .write()
            .session_models
            .insert(session.clone(), model.clone());
    }

    fn set_live_selection(&self, agent: &str, model: Option<&ModelRef>) {
        self.state.write().live = Some((agent.to_string(), model.cloned()));
    }

    fn add_request(&self, request: PendingRequest) {
        self.state
            .write()
            .requests
            .insert((request.kind, request.id.clone()), request);
    }

    fn remove_request(&self, kind: RequestKind, id: &RequestId) {
        self.state.write().requests.remove(&(kind, id.clone()));
    }

    fn has_request(&self, kind: RequestKind, id: &RequestId) -> bool {
        self.state.read().requests.contains_key(&(kind, id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ids::PartId;
    use relay_core::model::{PartKind, Role};

    fn sid() -> SessionId {
        SessionId::from_raw("ses_1")
    }

    fn text_part(id: &str, text: &str) -> PartRecord {
        PartRecord {
            id: PartId::from_raw(id),
            kind: PartKind::Text,
            text: Some(text.into()),
            state: None,
            time_end: None,
            synthetic: false,
        }
    }

    #[test]
    fn merge_part_replaces_parts_collection() {
        let store = MemoryStore::new();
        let mid = MessageId::from_raw("msg_a");
        store.upsert_message_info(MessageInfo::new(mid.clone(), sid(), Role::Assistant));
        store.merge_part(&sid(), &mid, text_part("prt_1", "he"));
        let before = store.message(&sid(), &mid).unwrap().parts;

        store.merge_part(&sid(), &mid, text_part("prt_1", "hello"));
        let after = store.message(&sid(), &mid).unwrap().parts;

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before[0].text.as_deref(), Some("he"));
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].text.as_deref(), Some("hello"));
    }

    #[test]
    fn merge_part_ignores_unknown_message() {
        let store = MemoryStore::new();
        store.merge_part(&sid(), &MessageId::from_raw("msg_x"), text_part("prt_1", "x"));
        assert!(store.messages(&sid()).is_empty());
    }

    #[test]
    fn completion_stamp_is_first_wins() {
        let store = MemoryStore::new();
        let mid = MessageId::from_raw("msg_a");
        store.upsert_message_info(MessageInfo::new(mid.clone(), sid(), Role::Assistant));
        store.mark_message_complete(&sid(), &mid, 100);
        store.mark_message_complete(&sid(), &mid, 200);
        assert_eq!(store.message(&sid(), &mid).unwrap().info.completed, Some(100));
    }

    #[test]
    fn upsert_session_keeps_directory() {
        let store = MemoryStore::new();
        let mut info = SessionInfo::new(sid());
        info.directory = Some("/work".into());
        store.upsert_session(info);

        let mut update = SessionInfo::new(sid());
        update.title = Some("renamed".into());
        store.upsert_session(update);

        let stored = store.session(&sid()).unwrap();
        assert_eq!(stored.directory.as_deref(), Some("/work"));
        assert_eq!(stored.title.as_deref(), Some("renamed"));
    }

    #[test]
    fn trimmed_head_prunes_older_messages() {
        let store = MemoryStore::new();
        for id in ["msg_000000000001", "msg_000000000005", "msg_000000000009"] {
            store.upsert_message_info(MessageInfo::new(
                MessageId::from_raw(id),
                sid(),
                Role::Assistant,
            ));
        }
        store.set_trimmed_head(&sid(), MessageId::from_raw("msg_000000000005"));
        let ids: Vec<String> = store
            .messages(&sid())
            .into_iter()
            .map(|m| m.info.id.to_string())
            .collect();
        assert_eq!(ids, vec!["msg_000000000009"]);
    }

    #[test]
    fn last_user_message_time_only_moves_forward() {
        let store = MemoryStore::new();
        store.set_last_user_message_at(&sid(), 200);
        store.set_last_user_message_at(&sid(), 100);
        assert_eq!(store.last_user_message_at(&sid()), Some(200));
        store.set_last_user_message_at(&sid(), 300);
        assert_eq!(store.last_user_message_at(&sid()), Some(300));
    }

    #[test]
    fn snapshot_serializes_sessions() {
        let store = MemoryStore::new();
        store.set_active_session(Some(sid()));
        store.set_session_status(
            &sid(),
            SessionStatusRecord {
                status: SessionStatus::busy(),
                confirmed_at: None,
            },
        );
        let json = serde_json::to_value(store.snapshot()).unwrap();
        assert_eq!(json["activeSession"], "ses_1");
        assert_eq!(json["sessions"][0]["status"]["type"], "busy");
        assert_eq!(store.active_sessions(), vec![sid()]);
    }
}
