//! Session registry -- C7.
//!
//! Holds, per connection, `{userId, currentChannel?, currentDoc?}` plus the
//! two reverse indexes (`channelId -> sessions`, `docId -> sessions`). All
//! mutations update the session's fields and the affected index atomically
//! with respect to any broadcaster lookup, since both live behind the same
//! `parking_lot::RwLock`.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Opaque handle for one connected socket.
pub type SessionId = Uuid;

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: Uuid,
    pub current_channel: Option<Uuid>,
    pub current_doc: Option<Uuid>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, Session>,
    channel_connections: HashMap<Uuid, HashSet<SessionId>>,
    doc_connections: HashMap<Uuid, HashSet<SessionId>>,
}

/// Process-wide registry of connected sessions. Cheap to clone -- an `Arc`
/// around a single lock -- for shared in-memory state.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: SessionId, user_id: Uuid) {
        self.inner.write().sessions.insert(
            id,
            Session {
                user_id,
                current_channel: None,
                current_doc: None,
            },
        );
    }

    /// Remove a session entirely, detaching it from any room it was in.
    pub fn unregister(&self, id: SessionId) {
        let mut inner = self.inner.write();
        if let Some(session) = inner.sessions.remove(&id) {
            if let Some(channel) = session.current_channel {
                remove_from_index(&mut inner.channel_connections, channel, id);
            }
            if let Some(doc) = session.current_doc {
                remove_from_index(&mut inner.doc_connections, doc, id);
            }
        }
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.inner.read().sessions.get(&id).cloned()
    }

    /// Attach a session to a channel room, detaching it from any prior
    /// channel first (a session belongs to at most one channel room).
    pub fn attach_channel(&self, id: SessionId, channel: Uuid) {
        let mut inner = self.inner.write();
        let prior = inner.sessions.get(&id).and_then(|s| s.current_channel);
        if let Some(prior) = prior {
            if prior == channel {
                return;
            }
            remove_from_index(&mut inner.channel_connections, prior, id);
        }
        inner
            .channel_connections
            .entry(channel)
            .or_default()
            .insert(id);
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.current_channel = Some(channel);
        }
    }

    /// Detach from the channel room. Per the session invariant
    /// `currentDoc ⇒ currentChannel`, also detaches any current doc.
    pub fn detach_channel(&self, id: SessionId) {
        let mut inner = self.inner.write();
        let session = match inner.sessions.get(&id) {
            Some(s) => s.clone(),
            None => return,
        };
        if let Some(doc) = session.current_doc {
            remove_from_index(&mut inner.doc_connections, doc, id);
        }
        if let Some(channel) = session.current_channel {
            remove_from_index(&mut inner.channel_connections, channel, id);
        }
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.current_channel = None;
            session.current_doc = None;
        }
    }

    pub fn attach_doc(&self, id: SessionId, doc: Uuid) {
        let mut inner = self.inner.write();
        let prior = inner.sessions.get(&id).and_then(|s| s.current_doc);
        if let Some(prior) = prior {
            if prior == doc {
                return;
            }
            remove_from_index(&mut inner.doc_connections, prior, id);
        }
        inner.doc_connections.entry(doc).or_default().insert(id);
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.current_doc = Some(doc);
        }
    }

    pub fn detach_doc(&self, id: SessionId) {
        let mut inner = self.inner.write();
        let prior = inner.sessions.get(&id).and_then(|s| s.current_doc);
        if let Some(prior) = prior {
            remove_from_index(&mut inner.doc_connections, prior, id);
        }
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.current_doc = None;
        }
    }

    pub fn channel_session_ids(&self, channel: Uuid) -> Vec<SessionId> {
        self.inner
            .read()
            .channel_connections
            .get(&channel)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn doc_session_ids(&self, doc: Uuid) -> Vec<SessionId> {
        self.inner
            .read()
            .doc_connections
            .get(&doc)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Distinct users in the channel room, with each user's `currentDoc`
    /// exposed as a low-resolution presence cue.
    pub fn channel_users(&self, channel: Uuid) -> Vec<(Uuid, Option<Uuid>)> {
        let inner = self.inner.read();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        if let Some(ids) = inner.channel_connections.get(&channel) {
            for id in ids {
                if let Some(session) = inner.sessions.get(id) {
                    if seen.insert(session.user_id) {
                        out.push((session.user_id, session.current_doc));
                    }
                }
            }
        }
        out
    }

    pub fn doc_users(&self, doc: Uuid) -> Vec<Uuid> {
        let inner = self.inner.read();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        if let Some(ids) = inner.doc_connections.get(&doc) {
            for id in ids {
                if let Some(session) = inner.sessions.get(id) {
                    if seen.insert(session.user_id) {
                        out.push(session.user_id);
                    }
                }
            }
        }
        out
    }

    pub fn doc_user_count(&self, doc: Uuid) -> usize {
        self.inner
            .read()
            .doc_connections
            .get(&doc)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// Every document with at least one active viewer, for the shutdown
    /// write-through sweep.
    pub fn live_doc_ids(&self) -> Vec<Uuid> {
        self.inner.read().doc_connections.keys().copied().collect()
    }
}

fn remove_from_index(index: &mut HashMap<Uuid, HashSet<SessionId>>, key: Uuid, id: SessionId) {
    if let Some(set) = index.get_mut(&key) {
        set.remove(&id);
        if set.is_empty() {
            index.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_and_detach_channel_keeps_index_consistent() {
        let reg = SessionRegistry::new();
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let channel = Uuid::new_v4();
        reg.register(session_id, user_id);
        reg.attach_channel(session_id, channel);

        assert_eq!(reg.channel_session_ids(channel), vec![session_id]);
        assert_eq!(reg.session(session_id).unwrap().current_channel, Some(channel));

        reg.detach_channel(session_id);
        assert!(reg.channel_session_ids(channel).is_empty());
        assert_eq!(reg.session(session_id).unwrap().current_channel, None);
    }

    #[test]
    fn detaching_channel_also_detaches_doc() {
        let reg = SessionRegistry::new();
        let session_id = Uuid::new_v4();
        let channel = Uuid::new_v4();
        let doc = Uuid::new_v4();
        reg.register(session_id, Uuid::new_v4());
        reg.attach_channel(session_id, channel);
        reg.attach_doc(session_id, doc);

        reg.detach_channel(session_id);
        assert_eq!(reg.doc_user_count(doc), 0);
        assert_eq!(reg.session(session_id).unwrap().current_doc, None);
    }

    #[test]
    fn doc_users_deduplicates_by_user_even_with_multiple_sessions() {
        let reg = SessionRegistry::new();
        let user = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        reg.register(s1, user);
        reg.register(s2, user);
        reg.attach_doc(s1, doc);
        reg.attach_doc(s2, doc);

        assert_eq!(reg.doc_user_count(doc), 2);
        assert_eq!(reg.doc_users(doc), vec![user]);
    }

    #[test]
    fn unregister_removes_session_from_all_indexes() {
        let reg = SessionRegistry::new();
        let session_id = Uuid::new_v4();
        let channel = Uuid::new_v4();
        let doc = Uuid::new_v4();
        reg.register(session_id, Uuid::new_v4());
        reg.attach_channel(session_id, channel);
        reg.attach_doc(session_id, doc);

        reg.unregister(session_id);
        assert!(reg.channel_session_ids(channel).is_empty());
        assert!(reg.doc_session_ids(doc).is_empty());
        assert!(reg.session(session_id).is_none());
    }

    #[test]
    fn switching_doc_detaches_from_the_prior_one() {
        let reg = SessionRegistry::new();
        let session_id = Uuid::new_v4();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        reg.register(session_id, Uuid::new_v4());
        reg.attach_doc(session_id, doc_a);
        reg.attach_doc(session_id, doc_b);

        assert!(reg.doc_session_ids(doc_a).is_empty());
        assert_eq!(reg.doc_session_ids(doc_b), vec![session_id]);
    }

    #[test]
    fn live_doc_ids_reflects_only_docs_with_an_active_viewer() {
        let reg = SessionRegistry::new();
        let session_id = Uuid::new_v4();
        let doc = Uuid::new_v4();
        reg.register(session_id, Uuid::new_v4());
        assert!(reg.live_doc_ids().is_empty());

        reg.attach_doc(session_id, doc);
        assert_eq!(reg.live_doc_ids(), vec![doc]);

        reg.detach_doc(session_id);
        assert!(reg.live_doc_ids().is_empty());
    }
}
