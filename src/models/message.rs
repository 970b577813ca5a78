//! Chat messages, as carried by the messaging service.
//!

use serde::{Deserialize, Serialize};

use super::PeerRecord;
use crate::ids::{self, PeerId, Timestamp};

/// The kind of content a message carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    #[default]
    Text,
    File,
    Image,
}

/// Delivery state of a message.
///
/// The state travels on the wire for compatibility, but only the store tracks it;
/// a message is never re-sent to update it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Sending,
    Sent,
    Received,
    Read,
    Failed,
}

/// A message from one peer to another peer or to a group.
///
/// Created by the sender and transmitted once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub msg_id: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(rename = "from_user_id")]
    pub from_peer_id: PeerId,
    #[serde(rename = "from_username", default)]
    pub from_name: String,
    #[serde(rename = "to_user_id", default)]
    pub to_peer_id: PeerId,
    #[serde(rename = "to_username", default)]
    pub to_name: String,
    #[serde(rename = "content")]
    pub body: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl ChatMessage {
    /// Create a text message from `from` to a single peer.
    pub fn direct(
        from: &PeerRecord,
        to_peer_id: impl ToString,
        to_name: impl ToString,
        body: impl ToString,
    ) -> Self {
        Self {
            msg_id: ids::generate_message_id(),
            kind: MessageKind::Text,
            from_peer_id: from.peer_id.clone(),
            from_name: from.display_name.clone(),
            to_peer_id: to_peer_id.to_string(),
            to_name: to_name.to_string(),
            body: body.to_string(),
            timestamp: ids::now_timestamp(),
            is_group: false,
            group_id: None,
            status: MessageStatus::Sending,
        }
    }

    /// Create a text message to a group.
    pub fn group(
        group_id: impl ToString,
        from_peer_id: impl ToString,
        from_name: impl ToString,
        body: impl ToString,
    ) -> Self {
        Self {
            msg_id: ids::generate_message_id(),
            kind: MessageKind::Text,
            from_peer_id: from_peer_id.to_string(),
            from_name: from_name.to_string(),
            to_peer_id: PeerId::new(),
            to_name: String::new(),
            body: body.to_string(),
            timestamp: ids::now_timestamp(),
            is_group: true,
            group_id: Some(group_id.to_string()),
            status: MessageStatus::Sending,
        }
    }

    /// Change the status of the message.
    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether this is a direct message between `peer_a` and `peer_b`, either way.
    pub fn is_between(&self, peer_a: &str, peer_b: &str) -> bool {
        !self.is_group
            && ((self.from_peer_id == peer_a && self.to_peer_id == peer_b)
                || (self.from_peer_id == peer_b && self.to_peer_id == peer_a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alice() -> PeerRecord {
        PeerRecord::new("alice-id", "alice", "alice-laptop", "192.168.1.20", 10000)
    }

    #[test]
    fn wire_field_names() {
        let message = ChatMessage::direct(&alice(), "bob-id", "bob", "hello");
        let value = serde_json::to_value(&message).expect("Failed to serialize.");

        for key in [
            "msg_id",
            "type",
            "from_user_id",
            "from_username",
            "to_user_id",
            "to_username",
            "content",
            "timestamp",
            "is_group",
            "group_id",
            "status",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(value["type"], "TEXT");
        assert_eq!(value["status"], "sending");
        assert_eq!(value["group_id"], serde_json::Value::Null);
    }

    #[test]
    fn parses_sparse_message() {
        let message: ChatMessage = serde_json::from_value(json!({
            "msg_id": "msg_0123456789ab",
            "from_user_id": "alice-id",
            "content": "hi",
            "timestamp": 1_700_000_000,
            "type": "IMAGE",
        }))
        .expect("Failed to parse.");

        assert_eq!(message.kind, MessageKind::Image);
        assert_eq!(message.status, MessageStatus::Sending);
        assert!(!message.is_group);
        assert_eq!(message.group_id, None);
    }

    #[test]
    fn conversation_membership() {
        let message = ChatMessage::direct(&alice(), "bob-id", "bob", "hello");
        assert!(message.is_between("alice-id", "bob-id"));
        assert!(message.is_between("bob-id", "alice-id"));
        assert!(!message.is_between("alice-id", "carol-id"));

        let group = ChatMessage::group("group_1", "alice-id", "alice", "hello");
        assert!(!group.is_between("alice-id", ""));
        assert_eq!(group.group_id.as_deref(), Some("group_1"));
    }
}
