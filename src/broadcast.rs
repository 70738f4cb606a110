//! Room broadcaster -- C8.
//!
//! Delivers an encoded event to every session in a channel-room or
//! doc-room. Delivery is best-effort per socket: a send failure (the
//! receiver's outbound queue is gone) prunes that sender from the room
//! rather than aborting the fan-out for everyone else.

use crate::protocol::Envelope;
use crate::registry::{SessionId, SessionRegistry};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Which reverse index a room key is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    Channel,
    Doc,
}

/// One outbound queue per connected socket. The writer task owns the
/// receiving half; `Broadcaster` only ever holds the sender.
pub type Outbound = mpsc::Sender<Envelope>;

#[derive(Clone, Default)]
pub struct Broadcaster {
    registry: Option<SessionRegistry>,
    senders: Arc<RwLock<HashMap<SessionId, Outbound>>>,
}

impl Broadcaster {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry: Some(registry),
            senders: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register_sender(&self, session_id: SessionId, sender: Outbound) {
        self.senders.write().insert(session_id, sender);
    }

    pub fn remove_sender(&self, session_id: SessionId) {
        self.senders.write().remove(&session_id);
    }

    /// Send `envelope` to a single session, pruning its outbound sender on
    /// failure. Used for per-request replies as well as by `broadcast`.
    pub fn send_to(&self, session_id: SessionId, envelope: Envelope) {
        let sender = self.senders.read().get(&session_id).cloned();
        if let Some(sender) = sender {
            if sender.try_send(envelope).is_err() {
                self.senders.write().remove(&session_id);
            }
        }
    }

    /// `broadcast(roomKey, roomKind, event, payload, excludeSession?)`.
    pub fn broadcast(
        &self,
        room_key: Uuid,
        room_kind: RoomKind,
        event: &str,
        payload: Value,
        exclude_session: Option<SessionId>,
    ) {
        let Some(registry) = &self.registry else {
            return;
        };
        let recipients = match room_kind {
            RoomKind::Channel => registry.channel_session_ids(room_key),
            RoomKind::Doc => registry.doc_session_ids(room_key),
        };
        for session_id in recipients {
            if Some(session_id) == exclude_session {
                continue;
            }
            self.send_to(session_id, Envelope::new(event, payload.clone()));
        }
    }
}
