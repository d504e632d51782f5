use std::collections::HashMap;

use relay_core::ids::{MessageId, SessionId};
use relay_core::model::{MessageInfo, Role};

use crate::store::SyncStore;

const MAX_ENTRIES: usize = 2_048;

/// Role lookup for (session, message) pairs, read through to the store on a miss.
///
/// Part events usually omit the author, and scanning a session's history
/// for every streamed chunk is what this avoids.
#[derive(Default)]
pub struct MessageLookup {
    roles: HashMap<(SessionId, MessageId), Role>,
}

impl MessageLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(
        &mut self,
        store: &dyn SyncStore,
        session: &SessionId,
        message: &MessageId,
    ) -> Option<Role> {
        let key = (session.clone(), message.clone());
        if let Some(role) = self.roles.get(&key) {
            return Some(role.clone());
        }
        let role = store.message(session, message)?.info.role;
        if role == Role::Other {
            return None;
        }
        self.insert(key, role.clone());
        Some(role)
    }

    pub fn remember(&mut self, info: &MessageInfo) {
        if info.role != Role::Other {
            self.insert((info.session_id.clone(), info.id.clone()), info.role.clone());
        }
    }

    pub fn forget_session(&mut self, session: &SessionId) {
        self.roles.retain(|(sid, _), _| sid != session);
    }

    fn insert(&mut self, key: (SessionId, MessageId), role: Role) {
        if self.roles.len() >= MAX_ENTRIES {
            self.roles.clear();
        }
        self.roles.insert(key, role);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[test]
    fn reads_through_and_caches() {
        let store = MemoryStore::new();
        let sid = SessionId::from_raw("ses_1");
        let mid = MessageId::from_raw("msg_1");
        let mut lookup = MessageLookup::new();
        assert_eq!(lookup.role(&store, &sid, &mid), None);

        store.upsert_message_info(MessageInfo::new(mid.clone(), sid.clone(), Role::User));
        assert_eq!(lookup.role(&store, &sid, &mid), Some(Role::User));

        store.remove_session(&sid);
        assert_eq!(lookup.role(&store, &sid, &mid), Some(Role::User), "cached");
        lookup.forget_session(&sid);
        assert_eq!(lookup.role(&store, &sid, &mid), None);
    }

    #[test]
    fn remember_skips_unknown_roles() {
        let store = MemoryStore::new();
        let mut lookup = MessageLookup::new();
        let info = MessageInfo::new("msg_1".into(), "ses_1".into(), Role::Other);
        lookup.remember(&info);
        assert_eq!(lookup.role(&store, &info.session_id, &info.id), None);
    }
}
