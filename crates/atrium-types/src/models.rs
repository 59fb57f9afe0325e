use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "member" => Some(Self::Member),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

impl Default for MessageKind {
    fn default() -> Self {
        Self::Text
    }
}

/// A conversation-scoped participant. `identity` holds whichever textual
/// form the participant joined under; comparisons go through the
/// equivalence set, never this literal string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub identity: Identity,
    pub display_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub last_read_message_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    /// Stored name for groups; direct conversations have none and resolve
    /// their name relative to the requesting identity.
    pub name: Option<String>,
    pub participants: Vec<Participant>,
    pub last_message_id: Option<Uuid>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
    pub created_by: Identity,
}

impl Conversation {
    /// Identity strings recorded on the participant list, as stored.
    pub fn participant_forms(&self) -> Vec<String> {
        self.participants
            .iter()
            .map(|p| p.identity.as_str().to_string())
            .collect()
    }

    pub fn participant_for(&self, identity: &Identity) -> Option<&Participant> {
        self.participants.iter().find(|p| p.identity.same_as(identity))
    }

    /// Display name relative to the requesting identity: group name as
    /// stored, direct conversations show the other participant.
    pub fn name_for(&self, identity: &Identity) -> String {
        match self.kind {
            ConversationKind::Group => {
                self.name.clone().unwrap_or_else(|| "Group Chat".to_string())
            }
            ConversationKind::Direct => self
                .participants
                .iter()
                .find(|p| !p.identity.same_as(identity))
                .map(|p| p.display_name.clone())
                .unwrap_or_else(|| "Unknown User".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// Per-conversation insertion sequence — the authoritative ordering key.
    /// Wall-clock timestamps can tie; this never does.
    pub seq: i64,
    pub sender: Identity,
    pub sender_name: String,
    pub body: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub reply_to: Option<Uuid>,
    pub read_by: Vec<ReadReceipt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub identity: Identity,
    pub read_at: DateTime<Utc>,
}

/// A connected participant. Ephemeral; owned by the gateway process and
/// rebuilt from nothing on restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub identity: Identity,
    pub display_name: String,
    pub last_seen: DateTime<Utc>,
}

/// One unread-conversation summary, derived on demand — never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSummary {
    pub id: String,
    pub conversation_id: Uuid,
    pub conversation_name: String,
    pub sender_name: String,
    pub snippet: String,
    pub timestamp: DateTime<Utc>,
    pub unread_count: usize,
    pub message_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationMeta {
    pub current_page: u32,
    pub total_pages: u32,
    pub total_messages: u64,
    pub has_more: bool,
}
