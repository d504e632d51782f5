//! Inbound event state machine.
//!
//! Every event passes through [`EventDispatcher::handle`], which touches the
//! staleness clock, applies any session-shaped metadata the payload carries,
//! then applies the event to the store. Stale or malformed input is dropped,
//! never surfaced as an error.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use relay_core::events::{
    self, MessageUpdate, NotificationRequest, PartUpdate, SyncEvent, WireEvent, ABORTED_ERROR_NAME,
};
use relay_core::ids::{MessageId, RequestId, SessionId};
use relay_core::model::{
    now_ms, text_len, AgentSelection, MessageInfo, Notification, PartKind, PartRecord,
    PendingRequest, Role, SessionMetadata, SessionStatus, SessionStatusRecord, StatusKind,
};

use crate::context::SyncContext;
use crate::lookup::MessageLookup;
use crate::text_len::TextLengthCache;

/// Agents whose all-synthetic user messages mark a mode switch.
const MODE_SWITCH_AGENTS: &[&str] = &["plan", "build"];

/// Synthetic user-part text worth keeping in the transcript (matched
/// case-insensitively as a substring).
const KEPT_SYNTHETIC_NOTICES: &[&str] = &["plan mode", "switched to build"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    Trimmed,
    Synthetic,
    Noise,
    Shrink,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Trimmed => "trimmed",
            Self::Synthetic => "synthetic",
            Self::Noise => "noise",
            Self::Shrink => "shrink",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Dropped(DropReason),
    /// Recognised but intentionally not acted on (unknown type, suppressed notification).
    Ignored,
}

pub struct EventDispatcher {
    ctx: Arc<SyncContext>,
    text_len: Mutex<TextLengthCache>,
    lookup: Mutex<MessageLookup>,
    metadata_refreshed: DashMap<SessionId, Instant>,
    hydrations: DashSet<(SessionId, MessageId)>,
    prompted: DashSet<RequestId>,
}

impl EventDispatcher {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            text_len: Mutex::new(TextLengthCache::new()),
            lookup: Mutex::new(MessageLookup::new()),
            metadata_refreshed: DashMap::new(),
            hydrations: DashSet::new(),
            prompted: DashSet::new(),
        }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    #[instrument(skip_all, fields(event_type = %event.event_type))]
    pub fn handle(&self, event: &WireEvent) -> Outcome {
        self.ctx.status.touch();
        self.ctx
            .counters
            .inc("events_received", &[("type", event.event_type.as_str())]);

        if let Some((session, metadata)) = events::session_metadata(event) {
            self.ctx.store.update_session_metadata(&session, metadata);
        }

        let outcome = self.dispatch(events::decode(event));
        if let Outcome::Dropped(reason) = outcome {
            self.ctx
                .counters
                .inc("events_dropped", &[("reason", reason.as_str())]);
        }
        outcome
    }

    fn dispatch(&self, event: SyncEvent) -> Outcome {
        match event {
            SyncEvent::ServerConnected => {
                self.check_connectivity();
                Outcome::Applied
            }
            SyncEvent::InstanceDisposed => {
                drop(self.ctx.resync.bootstrap("instance disposed"));
                Outcome::Applied
            }
            SyncEvent::CapabilityChanged {
                capability,
                directory,
            } => {
                self.refresh_capability(capability, directory);
                Outcome::Applied
            }
            SyncEvent::SessionStatus { session_id, status } => {
                self.update_session_status(&session_id, status);
                self.refresh_metadata(&session_id);
                Outcome::Applied
            }
            SyncEvent::DerivedStatus {
                session_id,
                status,
                needs_attention,
            } => {
                let (previous, record) = self.next_status_record(&session_id, status);
                let kind = record.kind();
                self.ctx
                    .store
                    .set_status_with_attention(&session_id, record, needs_attention);
                self.ctx.stall.on_status_change(&session_id, previous, kind);
                self.refresh_metadata(&session_id);
                Outcome::Applied
            }
            SyncEvent::PartUpdated(update) => self.apply_part(update),
            SyncEvent::MessageUpdated(update) => self.apply_message(update),
            SyncEvent::SessionUpserted(info) => {
                if let Some(since) = info.compacting {
                    self.ctx.store.set_compacting(&info.id, Some(since));
                }
                self.ctx.store.upsert_session(info);
                Outcome::Applied
            }
            SyncEvent::SessionDeleted { session_id } => {
                self.ctx.store.remove_session(&session_id);
                self.ctx.stall.forget(&session_id);
                self.lookup.lock().forget_session(&session_id);
                self.metadata_refreshed.remove(&session_id);
                self.hydrations.retain(|(sid, _)| sid != &session_id);
                Outcome::Applied
            }
            SyncEvent::SessionAborted {
                session_id,
                message_id,
            } => {
                self.abort(&session_id, message_id.as_ref());
                Outcome::Applied
            }
            SyncEvent::SessionError {
                session_id,
                name,
                message,
            } => {
                if name.as_deref() == Some(ABORTED_ERROR_NAME) {
                    if let Some(session_id) = &session_id {
                        self.abort(session_id, None);
                        return Outcome::Applied;
                    }
                }
                warn!(
                    session_id = session_id.as_ref().map_or("", |s| s.as_str()),
                    name = name.as_deref().unwrap_or(""),
                    message = message.as_deref().unwrap_or(""),
                    "session error"
                );
                Outcome::Ignored
            }
            SyncEvent::RequestAsked(request) => {
                let elsewhere = !self.ctx.is_active_session(&request.session_id);
                self.ctx.store.add_request(request.clone());
                if elsewhere {
                    self.schedule_attention_prompt(request);
                }
                Outcome::Applied
            }
            SyncEvent::RequestResolved {
                kind, request_id, ..
            } => {
                self.ctx.store.remove_request(kind, &request_id);
                self.prompted.remove(&request_id);
                Outcome::Applied
            }
            SyncEvent::Notification(request) => self.notify(request),
            SyncEvent::TodoUpdated { session_id, todos } => {
                self.ctx.surface.todos_updated(&session_id, &todos);
                Outcome::Applied
            }
            SyncEvent::Malformed { event_type, reason } => {
                warn!(event_type = %event_type, reason, "dropping malformed event");
                Outcome::Dropped(DropReason::Malformed)
            }
            SyncEvent::Unknown { event_type } => {
                trace!(event_type = %event_type, "ignoring unknown event");
                Outcome::Ignored
            }
        }
    }

    // --- Status ---

    /// Write a session status, keeping the idle confirmation time across
    /// repeated idle updates, and feed the transition to the stall detector.
    pub fn update_session_status(&self, session: &SessionId, status: SessionStatus) {
        let (previous, record) = self.next_status_record(session, status);
        let kind = record.kind();
        self.ctx.store.set_session_status(session, record);
        self.ctx.stall.on_status_change(session, previous, kind);
    }

    fn next_status_record(
        &self,
        session: &SessionId,
        status: SessionStatus,
    ) -> (Option<StatusKind>, SessionStatusRecord) {
        let previous = self.ctx.store.session_status(session);
        let confirmed_at = match status.kind {
            StatusKind::Idle => previous
                .as_ref()
                .filter(|p| p.kind() == StatusKind::Idle)
                .and_then(|p| p.confirmed_at)
                .or_else(|| Some(Instant::now())),
            _ => None,
        };
        (
            previous.map(|p| p.kind()),
            SessionStatusRecord {
                status,
                confirmed_at,
            },
        )
    }

    fn infer_busy(&self, session: &SessionId) {
        let current = self.ctx.store.session_status(session);
        if let Some(record) = &current {
            if record.kind().is_active() {
                return;
            }
            if let Some(confirmed) = record.confirmed_at {
                if confirmed.elapsed() < self.ctx.config.idle_confirm_grace {
                    debug!(session_id = %session, "busy inference suppressed after idle confirmation");
                    self.ctx.counters.inc("busy_inference_suppressed", &[]);
                    return;
                }
            }
        }
        debug!(session_id = %session, "inferring busy from streaming part");
        self.update_session_status(session, SessionStatus::busy());
    }

    fn abort(&self, session: &SessionId, message: Option<&MessageId>) {
        self.update_session_status(session, SessionStatus::idle());
        if let Some(message) = message {
            self.ctx
                .store
                .mark_message_complete(session, message, now_ms());
        }
    }

    // --- Parts ---

    fn is_trimmed(&self, session: &SessionId, message: &MessageId) -> bool {
        self.ctx.store.is_trimmed(session, message)
    }

    fn apply_part(&self, update: PartUpdate) -> Outcome {
        let PartUpdate {
            session_id,
            message_id,
            role,
            part,
        } = update;

        self.ctx.stall.note_activity(&session_id);
        if self.is_trimmed(&session_id, &message_id) {
            debug!(session_id = %session_id, message_id = %message_id, "part behind trimmed head");
            return Outcome::Dropped(DropReason::Trimmed);
        }

        let role = role.filter(|r| *r != Role::Other).or_else(|| {
            self.lookup
                .lock()
                .role(self.ctx.store.as_ref(), &session_id, &message_id)
        });

        if part.synthetic && role == Some(Role::User) {
            return Outcome::Dropped(DropReason::Synthetic);
        }
        if role == Some(Role::Assistant) && part.looks_streaming() {
            self.infer_busy(&session_id);
        }

        if self.ctx.store.message(&session_id, &message_id).is_none() {
            let info = MessageInfo::new(
                message_id.clone(),
                session_id.clone(),
                role.clone().unwrap_or(Role::Assistant),
            );
            self.lookup.lock().remember(&info);
            self.ctx.store.upsert_message_info(info);
        }
        self.ctx.store.merge_part(&session_id, &message_id, part);
        Outcome::Applied
    }

    // --- Messages ---

    fn apply_message(&self, update: MessageUpdate) -> Outcome {
        let MessageUpdate { mut info, parts } = update;
        let session = info.session_id.clone();

        if self.is_trimmed(&session, &info.id) {
            debug!(session_id = %session, message_id = %info.id, "message behind trimmed head");
            return Outcome::Dropped(DropReason::Trimmed);
        }
        self.ctx.stall.note_activity(&session);

        if info.role == Role::Other {
            if let Some(known) =
                self.lookup
                    .lock()
                    .role(self.ctx.store.as_ref(), &session, &info.id)
            {
                info.role = known;
            }
        }
        self.lookup.lock().remember(&info);

        match info.role {
            Role::User => self.apply_user_message(info, parts),
            _ => self.apply_agent_message(info, parts),
        }
    }

    fn apply_user_message(&self, info: MessageInfo, parts: Option<Vec<PartRecord>>) -> Outcome {
        let session = info.session_id.clone();
        let id = info.id.clone();
        let existing = self.ctx.store.message(&session, &id);

        self.ctx
            .store
            .set_last_user_message_at(&session, info.created.unwrap_or_else(now_ms));
        self.apply_agent_selection(&info, parts.as_deref().unwrap_or(&[]));

        let merged = merge_info(existing.as_ref().map(|e| &e.info), info);
        self.ctx.store.upsert_message_info(merged);

        match parts.filter(|p| !p.is_empty()) {
            Some(parts) => {
                for part in parts.into_iter().filter(keep_user_part) {
                    self.ctx.store.merge_part(&session, &id, part);
                }
            }
            None if existing.is_none() => self.hydrate(&session, &id),
            None => {}
        }
        Outcome::Applied
    }

    fn apply_agent_selection(&self, info: &MessageInfo, parts: &[PartRecord]) {
        let Some(agent) = info.selected_agent() else {
            return;
        };
        let session = &info.session_id;
        let store = &self.ctx.store;

        let mode_switch = MODE_SWITCH_AGENTS.contains(&agent)
            && !parts.is_empty()
            && parts.iter().all(|p| p.synthetic);
        let apply = mode_switch
            || match store.agent_selection(session) {
                None => true,
                Some(prev) if prev.message_id == info.id => true,
                Some(prev) => match (info.created, prev.created) {
                    (Some(incoming), Some(recorded)) => incoming >= recorded,
                    _ => info.id.is_newer_than(&prev.message_id),
                },
            };
        if !apply {
            debug!(session_id = %session, message_id = %info.id, agent, "ignoring stale agent selection");
            return;
        }

        store.set_agent_selection(
            session,
            AgentSelection {
                agent: agent.to_string(),
                model: info.model.clone(),
                message_id: info.id.clone(),
                created: info.created,
            },
        );
        if store.is_known_agent(agent) {
            store.set_session_agent(session, agent);
            if let Some(model) = &info.model {
                store.set_session_model(session, model);
            }
            if self.ctx.is_active_session(session) {
                store.set_live_selection(agent, info.model.as_ref());
            }
        }
    }

    fn apply_agent_message(&self, info: MessageInfo, parts: Option<Vec<PartRecord>>) -> Outcome {
        let session = info.session_id.clone();
        let id = info.id.clone();
        let existing = self.ctx.store.message(&session, &id);
        let existing_len = existing
            .as_ref()
            .map_or(0, |e| self.text_len.lock().length_of(&e.parts));
        let existing_stop = existing.as_ref().is_some_and(|e| e.info.has_stop());

        let parts = parts.filter(|p| !p.is_empty());
        if parts.is_none() && !info.signals_completion() {
            trace!(session_id = %session, message_id = %id, "dropping empty message update");
            return Outcome::Dropped(DropReason::Noise);
        }
        if let Some(parts) = &parts {
            let incoming_len = text_len(parts);
            if !info.has_stop()
                && incoming_len + self.ctx.config.shrink_tolerance < existing_len
            {
                debug!(
                    session_id = %session,
                    message_id = %id,
                    incoming_len,
                    existing_len,
                    "dropping shrinking snapshot"
                );
                return Outcome::Dropped(DropReason::Shrink);
            }
        }

        let finalize = (info.signals_completion() || existing_stop) && {
            let role = if info.role == Role::Other {
                existing.as_ref().map(|e| e.info.role.clone())
            } else {
                Some(info.role.clone())
            };
            role == Some(Role::Assistant)
        };
        let carried_completion = info.completed;
        let summary = info.summary;

        let merged = merge_info(existing.as_ref().map(|e| &e.info), info);
        self.ctx.store.upsert_message_info(merged);
        for part in parts.into_iter().flatten() {
            self.ctx.store.merge_part(&session, &id, part);
        }

        if finalize {
            self.finalize(&session, &id, carried_completion, summary);
        }
        Outcome::Applied
    }

    fn finalize(
        &self,
        session: &SessionId,
        message: &MessageId,
        completed: Option<i64>,
        summary: bool,
    ) {
        self.ctx
            .store
            .mark_message_complete(session, message, completed.unwrap_or_else(now_ms));
        self.update_session_status(session, SessionStatus::idle());
        if self.ctx.is_active_session(session) && self.is_latest_assistant(session, message) {
            self.refresh_metadata(session);
        }
        if summary {
            self.ctx.store.set_compacting(session, None);
        }
    }

    fn is_latest_assistant(&self, session: &SessionId, message: &MessageId) -> bool {
        let latest = self
            .ctx
            .store
            .messages(session)
            .into_iter()
            .filter(|m| m.info.role == Role::Assistant)
            .map(|m| m.info.id)
            .reduce(|a, b| if b.is_newer_than(&a) { b } else { a });
        latest.as_ref() == Some(message)
    }

    /// One-shot history fetch for a user message that arrived without parts.
    fn hydrate(&self, session: &SessionId, message: &MessageId) {
        if !self.hydrations.insert((session.clone(), message.clone())) {
            return;
        }
        let ctx = Arc::clone(&self.ctx);
        let session = session.clone();
        let message = message.clone();
        tokio::spawn(async move {
            let limit = ctx.config.hydration_limit;
            match ctx.backend.fetch_messages(&session, limit).await {
                Ok(_) if ctx.store.is_trimmed(&session, &message) => {
                    debug!(session_id = %session, message_id = %message, "hydration target trimmed");
                }
                Ok(history) => {
                    let Some(record) = history.into_iter().find(|m| m.info.id == message) else {
                        debug!(session_id = %session, message_id = %message, "hydration found no record");
                        return;
                    };
                    let existing = ctx.store.message(&session, &message);
                    let merged = merge_info(existing.as_ref().map(|e| &e.info), record.info);
                    ctx.store.upsert_message_info(merged);
                    for part in record.parts.iter().filter(|p| keep_user_part(p)) {
                        ctx.store.merge_part(&session, &message, part.clone());
                    }
                    debug!(session_id = %session, message_id = %message, "hydrated user message");
                }
                Err(e) => {
                    warn!(session_id = %session, message_id = %message, error = %e, "hydration failed");
                }
            }
        });
    }

    // --- Side requests ---

    /// Rate-limited fetch of a session's title and summary.
    pub fn refresh_metadata(&self, session: &SessionId) {
        let now = Instant::now();
        match self.metadata_refreshed.entry(session.clone()) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) < self.ctx.config.metadata_refresh_interval {
                    return;
                }
                last.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }

        let ctx = Arc::clone(&self.ctx);
        let session = session.clone();
        tokio::spawn(async move {
            match ctx.backend.fetch_session(&session).await {
                Ok(info) => ctx.store.update_session_metadata(
                    &session,
                    SessionMetadata {
                        title: info.title,
                        summary: info.summary,
                    },
                ),
                Err(e) => debug!(session_id = %session, error = %e, "metadata refresh failed"),
            }
        });
    }

    /// Stream-independent reachability check, reported to the surface.
    pub fn check_connectivity(&self) {
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let reachable = ctx.backend.probe().await;
            ctx.surface.connectivity(reachable);
        });
    }

    fn refresh_capability(&self, capability: String, directory: Option<String>) {
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            if let Err(e) = ctx
                .backend
                .refresh_capability(&capability, directory.as_deref())
                .await
            {
                debug!(capability = %capability, error = %e, "capability refresh failed");
            }
        });
    }

    fn schedule_attention_prompt(&self, request: PendingRequest) {
        if !self.prompted.insert(request.id.clone()) {
            return;
        }
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if ctx.store.has_request(request.kind, &request.id) {
                ctx.surface.attention_prompt(&request);
            }
        });
    }

    fn notify(&self, request: NotificationRequest) -> Outcome {
        if request.require_hidden && self.ctx.environment().visible {
            return Outcome::Ignored;
        }
        if self.ctx.surface.native_notifications_active() {
            return Outcome::Ignored;
        }
        if !self.ctx.config.notifications_enabled || !self.ctx.surface.notifications_enabled() {
            return Outcome::Ignored;
        }
        let title = request
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| self.ctx.config.notification_title.clone());
        self.ctx.surface.notify(Notification {
            title,
            body: request.body.filter(|b| !b.trim().is_empty()),
            tag: request.tag,
        });
        Outcome::Applied
    }
}

fn keep_user_part(part: &PartRecord) -> bool {
    !part.synthetic || is_kept_notice(part)
}

fn is_kept_notice(part: &PartRecord) -> bool {
    if part.kind != PartKind::Text {
        return false;
    }
    let Some(text) = part.text.as_deref() else {
        return false;
    };
    let lower = text.to_lowercase();
    KEPT_SYNTHETIC_NOTICES.iter().any(|n| lower.contains(n))
}

/// Field-wise merge of incoming metadata over what is stored. A stored
/// completion time and stop marker are terminal and survive replays.
fn merge_info(existing: Option<&MessageInfo>, incoming: MessageInfo) -> MessageInfo {
    let Some(prev) = existing else {
        return incoming;
    };
    MessageInfo {
        role: if incoming.role == Role::Other {
            prev.role.clone()
        } else {
            incoming.role
        },
        created: incoming.created.or(prev.created),
        completed: prev.completed.or(incoming.completed),
        finish: if prev.has_stop() {
            prev.finish.clone()
        } else {
            incoming.finish.or_else(|| prev.finish.clone())
        },
        status: incoming.status.or_else(|| prev.status.clone()),
        agent: incoming.agent.or_else(|| prev.agent.clone()),
        mode: incoming.mode.or_else(|| prev.mode.clone()),
        model: incoming.model.or_else(|| prev.model.clone()),
        summary: incoming.summary || prev.summary,
        id: incoming.id,
        session_id: incoming.session_id,
    }
}
