use tokio::time::Instant;

use relay_core::ids::{MessageId, RequestId, SessionId};
use relay_core::model::{
    AgentSelection, MessageInfo, MessageRecord, ModelRef, PartRecord, PendingRequest, RequestKind,
    SessionInfo, SessionMetadata, SessionStatusRecord,
};

/// The reactive client-side store the reconciliation core writes into.
///
/// Every call is synchronous and applies atomically. Implementations must
/// replace a message's parts collection with a fresh `Arc` whenever it
/// changes so identity-keyed caches stay valid.
pub trait SyncStore: Send + Sync {
    // --- Sessions ---

    fn active_session(&self) -> Option<SessionId>;
    fn session(&self, id: &SessionId) -> Option<SessionInfo>;
    /// Insert or replace a session. An absent `directory` on the incoming
    /// value keeps the stored one.
    fn upsert_session(&self, info: SessionInfo);
    fn remove_session(&self, id: &SessionId);
    /// Replace the whole session list with an authoritative snapshot.
    fn replace_sessions(&self, sessions: Vec<SessionInfo>);
    fn update_session_metadata(&self, id: &SessionId, metadata: SessionMetadata);
    fn set_compacting(&self, id: &SessionId, since: Option<i64>);

    // --- Status ---

    fn session_status(&self, id: &SessionId) -> Option<SessionStatusRecord>;
    fn set_session_status(&self, id: &SessionId, record: SessionStatusRecord);
    /// Status write that also sets the attention flag in the same update.
    fn set_status_with_attention(
        &self,
        id: &SessionId,
        record: SessionStatusRecord,
        needs_attention: bool,
    );
    fn needs_attention(&self, id: &SessionId) -> bool;
    /// Sessions currently busy or retrying.
    fn active_sessions(&self) -> Vec<SessionId>;

    // --- Messages ---

    fn trimmed_head(&self, id: &SessionId) -> Option<MessageId>;
    fn set_trimmed_head(&self, id: &SessionId, marker: MessageId);
    /// True when `message` sits at or behind the session's trimmed head.
    fn is_trimmed(&self, session: &SessionId, message: &MessageId) -> bool {
        self.trimmed_head(session)
            .is_some_and(|marker| !message.is_newer_than(&marker))
    }
    fn message(&self, session: &SessionId, message: &MessageId) -> Option<MessageRecord>;
    fn messages(&self, session: &SessionId) -> Vec<MessageRecord>;
    /// Insert or replace message metadata, keeping any stored parts.
    fn upsert_message_info(&self, info: MessageInfo);
    /// Insert or replace one part by id. Creates nothing if the message is unknown.
    fn merge_part(&self, session: &SessionId, message: &MessageId, part: PartRecord);
    /// Stamp a completion time. The first stamp wins.
    fn mark_message_complete(&self, session: &SessionId, message: &MessageId, completed_at: i64);
    /// Replace a session's history with an authoritative snapshot. Callers
    /// filter out records behind the trimmed head first.
    fn replace_messages(&self, session: &SessionId, messages: Vec<MessageRecord>);
    /// End of the post-streaming window in which a resync would clobber
    /// freshly streamed content.
    fn streaming_cooldown_until(&self, session: &SessionId) -> Option<Instant>;
    /// Record a user message time. The stored value never moves backwards.
    fn set_last_user_message_at(&self, session: &SessionId, at: i64);

    // --- Agent selection ---

    fn agent_selection(&self, session: &SessionId) -> Option<AgentSelection>;
    fn set_agent_selection(&self, session: &SessionId, selection: AgentSelection);
    fn is_known_agent(&self, agent: &str) -> bool;
    fn set_session_agent(&self, session: &SessionId, agent: &str);
    fn set_session_model(&self, session: &SessionId, model: &ModelRef);
    /// Reflect a selection in the live picker for the active session.
    fn set_live_selection(&self, agent: &str, model: Option<&ModelRef>);

    // --- Requests ---

    fn add_request(&self, request: PendingRequest);
    fn remove_request(&self, kind: RequestKind, id: &RequestId);
    fn has_request(&self, kind: RequestKind, id: &RequestId) -> bool;
}
