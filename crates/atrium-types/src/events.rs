use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::Identity;
use crate::models::{Message, MessageKind};

/// Commands sent FROM client TO server over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum GatewayCommand {
    /// Register in the presence registry and receive the online snapshot.
    /// Identity comes from the verified token; the display name may be
    /// overridden for clients that carry a fresher profile.
    AnnouncePresence {
        #[serde(default)]
        display_name: Option<String>,
    },

    /// Start routing room-scoped events for this conversation to this
    /// connection. Participation is re-checked when a message is sent or
    /// history is fetched, not here.
    JoinRoom { conversation_id: Uuid },

    /// Stop routing room-scoped events for this conversation.
    LeaveRoom { conversation_id: Uuid },

    SendMessage {
        conversation_id: Uuid,
        body: String,
        #[serde(default)]
        kind: MessageKind,
        /// Client-side optimistic id, echoed back in the ack or failure so
        /// the sender can reconcile its temp message.
        client_temp_id: String,
        #[serde(default)]
        reply_to: Option<Uuid>,
    },

    TypingStart { conversation_id: Uuid },

    TypingStop { conversation_id: Uuid },

    /// Mark every currently-unread message in the conversation as read.
    /// Best-effort: a store failure is logged server-side and produces no
    /// event, so clients reconcile unread state on their next history or
    /// notification fetch rather than waiting for an ack.
    MarkRead { conversation_id: Uuid },
}

/// Events sent FROM server TO clients over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum GatewayEvent {
    /// A message was appended to a conversation. Delivered to every
    /// connection joined to the room, in store insertion order.
    MessageAppended { message: Message },

    /// Someone connected or disconnected.
    PresenceChanged {
        identity: Identity,
        display_name: String,
        online: bool,
    },

    /// Ephemeral typing indicator. Lossy, never persisted; clients expire
    /// it after about a second of silence even without a stop event.
    TypingChanged {
        conversation_id: Uuid,
        identity: Identity,
        display_name: String,
        is_typing: bool,
    },

    /// A participant read everything in a conversation.
    ReadReceiptUpdated {
        conversation_id: Uuid,
        identity: Identity,
        read_count: usize,
    },

    /// The send was persisted; the client swaps its temp message for the
    /// canonical one.
    SendAcknowledged {
        client_temp_id: String,
        message_id: Uuid,
        seq: i64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The send was rejected; the client rolls back its optimistic state.
    SendFailed {
        client_temp_id: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_kebab_case_tags() {
        let cmd: GatewayCommand = serde_json::from_str(
            r#"{"type":"join-room","data":{"conversation_id":"00000000-0000-0000-0000-000000000001"}}"#,
        )
        .unwrap();
        assert!(matches!(cmd, GatewayCommand::JoinRoom { .. }));

        let cmd: GatewayCommand =
            serde_json::from_str(r#"{"type":"announce-presence","data":{}}"#).unwrap();
        assert!(matches!(
            cmd,
            GatewayCommand::AnnouncePresence { display_name: None }
        ));
    }

    #[test]
    fn send_message_defaults_kind_to_text() {
        let cmd: GatewayCommand = serde_json::from_str(
            r#"{"type":"send-message","data":{
                "conversation_id":"00000000-0000-0000-0000-000000000001",
                "body":"hello",
                "client_temp_id":"tmp-1"}}"#,
        )
        .unwrap();
        match cmd {
            GatewayCommand::SendMessage { kind, reply_to, .. } => {
                assert_eq!(kind, MessageKind::Text);
                assert!(reply_to.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_tagged_envelopes() {
        let event = GatewayEvent::SendFailed {
            client_temp_id: "tmp-9".into(),
            message: "Conversation not found".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "send-failed");
        assert_eq!(json["data"]["client_temp_id"], "tmp-9");
    }
}
