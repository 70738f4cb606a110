//! Wire protocol -- C11.
//!
//! All messages are textual JSON envelopes `{event, data}`. Server-to-client
//! messages always carry a server timestamp `time` (milliseconds since
//! epoch) inside `data`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The message envelope exchanged in both directions over the upgraded
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub data: Value,
}

impl Envelope {
    /// Build a server-to-client envelope, stamping `data` with the current
    /// server time. If `data` is not a JSON object (a client bug upstream,
    /// or a deliberately scalar payload), the timestamp is carried as a
    /// sibling object instead of silently dropped.
    pub fn new(event: &str, mut data: Value) -> Self {
        let time = Utc::now().timestamp_millis();
        match data.as_object_mut() {
            Some(map) => {
                map.insert("time".to_string(), json!(time));
            }
            None => {
                data = json!({ "value": data, "time": time });
            }
        }
        Envelope {
            event: event.to_string(),
            data,
        }
    }

    /// User-facing validation failure; connection stays open, no mutation
    /// performed.
    pub fn system_message(message: impl Into<String>) -> Self {
        Envelope::new("systemmessage", json!({ "message": message.into() }))
    }

    /// Protocol-level failure (malformed envelope, event invalid for the
    /// session's current state); connection stays open.
    pub fn error(original_event: impl Into<String>, message: impl Into<String>) -> Self {
        Envelope::new(
            "error",
            json!({ "originalEvent": original_event.into(), "message": message.into() }),
        )
    }

    /// First-class rejection of an edit against a non-`NORMAL` document;
    /// distinct from a general protocol error.
    pub fn edit_rejected(reason: impl Into<String>) -> Self {
        Envelope::new("editRejected", json!({ "reason": reason.into() }))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Server-handled events, as a closed enum so the dispatch
/// switch in `ws` cannot silently drop an unrecognized-but-typo'd event
/// name without at least matching the catch-all arm explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    Ping,
    CreateChannel,
    JoinChannel,
    ListChannel,
    QuitChannel,
    EnterChannel,
    LeaveChannel,
    CreateDoc,
    DeleteDoc,
    ListDoc,
    UpdateDoc,
    EnterDoc,
    LeaveDoc,
    EditDoc,
    EditDocBatch,
    SyncDoc,
    SnapshotDoc,
    GetChannelUsers,
    GetDocUsers,
    GetDocStatus,
}

impl ServerEvent {
    pub fn from_str(event: &str) -> Option<Self> {
        Some(match event {
            "ping" => ServerEvent::Ping,
            "createChannel" => ServerEvent::CreateChannel,
            "joinChannel" => ServerEvent::JoinChannel,
            "listChannel" => ServerEvent::ListChannel,
            "quitChannel" => ServerEvent::QuitChannel,
            "enterChannel" => ServerEvent::EnterChannel,
            "leaveChannel" => ServerEvent::LeaveChannel,
            "createDoc" => ServerEvent::CreateDoc,
            "deleteDoc" => ServerEvent::DeleteDoc,
            "listDoc" => ServerEvent::ListDoc,
            "updateDoc" => ServerEvent::UpdateDoc,
            "enterDoc" => ServerEvent::EnterDoc,
            "leaveDoc" => ServerEvent::LeaveDoc,
            "editDoc" => ServerEvent::EditDoc,
            "editDocBatch" => ServerEvent::EditDocBatch,
            "syncDoc" => ServerEvent::SyncDoc,
            "snapshotDoc" => ServerEvent::SnapshotDoc,
            "getChannelUsers" => ServerEvent::GetChannelUsers,
            "getDocUsers" => ServerEvent::GetDocUsers,
            "getDocStatus" => ServerEvent::GetDocStatus,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stamps_time_into_an_object_payload() {
        let env = Envelope::new("docOp", json!({ "id": "x" }));
        assert_eq!(env.event, "docOp");
        assert!(env.data.get("time").is_some());
        assert_eq!(env.data.get("id").unwrap(), "x");
    }

    #[test]
    fn new_wraps_a_non_object_payload_rather_than_dropping_the_timestamp() {
        let env = Envelope::new("ping", json!("pong"));
        assert!(env.data.get("time").is_some());
        assert_eq!(env.data.get("value").unwrap(), "pong");
    }

    #[test]
    fn json_round_trips() {
        let env = Envelope::system_message("nope");
        let raw = env.to_json().unwrap();
        let parsed = Envelope::from_json(&raw).unwrap();
        assert_eq!(parsed.event, "systemmessage");
    }

    #[test]
    fn unrecognized_event_name_parses_to_none() {
        assert_eq!(ServerEvent::from_str("bogusEvent"), None);
        assert_eq!(ServerEvent::from_str("editDoc"), Some(ServerEvent::EditDoc));
    }
}
