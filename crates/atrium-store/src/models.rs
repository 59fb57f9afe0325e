//! Database row types and row-to-domain conversion. Rows keep everything as
//! stored (TEXT ids, TEXT timestamps) so the SQL layer stays independent of
//! the wire models in atrium-types.

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;
use uuid::Uuid;

use atrium_types::identity::Identity;
use atrium_types::models::{
    Conversation, ConversationKind, Message, MessageKind, Participant, ReadReceipt, Role,
};

use crate::{StoreError, StoreResult};

pub struct ConversationRow {
    pub id: String,
    pub kind: String,
    pub name: Option<String>,
    pub created_by: String,
    pub last_message_id: Option<String>,
    pub last_activity: String,
    pub is_active: bool,
}

pub struct ParticipantRow {
    pub identity: String,
    pub display_name: String,
    pub role: String,
    pub joined_at: String,
    pub last_read_message_id: Option<String>,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub seq: i64,
    pub sender: String,
    pub sender_name: String,
    pub body: String,
    pub kind: String,
    pub created_at: String,
    pub is_edited: bool,
    pub edited_at: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<String>,
    pub reply_to: Option<String>,
}

pub struct ReceiptRow {
    pub message_id: String,
    pub identity: String,
    pub read_at: String,
}

/// Timestamps are stored as fixed-width RFC 3339 UTC text so lexicographic
/// comparison in SQL matches chronological order.
pub fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!("Corrupt timestamp '{}': {}", raw, e);
        DateTime::default()
    })
}

fn parse_uuid(raw: &str, what: &str) -> StoreResult<Uuid> {
    raw.parse()
        .map_err(|e| StoreError::Internal(format!("corrupt {what} id '{raw}': {e}")))
}

impl ConversationRow {
    pub fn into_conversation(self, participants: Vec<ParticipantRow>) -> StoreResult<Conversation> {
        let kind = ConversationKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Internal(format!("corrupt conversation kind '{}'", self.kind)))?;
        let participants = participants
            .into_iter()
            .map(ParticipantRow::into_participant)
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Conversation {
            id: parse_uuid(&self.id, "conversation")?,
            kind,
            name: self.name,
            participants,
            last_message_id: self
                .last_message_id
                .as_deref()
                .map(|id| parse_uuid(id, "message"))
                .transpose()?,
            last_activity: parse_ts(&self.last_activity),
            is_active: self.is_active,
            created_by: Identity::new(self.created_by),
        })
    }
}

impl ParticipantRow {
    pub fn into_participant(self) -> StoreResult<Participant> {
        let role = Role::parse(&self.role)
            .ok_or_else(|| StoreError::Internal(format!("corrupt role '{}'", self.role)))?;
        Ok(Participant {
            identity: Identity::new(self.identity),
            display_name: self.display_name,
            role,
            joined_at: parse_ts(&self.joined_at),
            last_read_message_id: self
                .last_read_message_id
                .as_deref()
                .map(|id| parse_uuid(id, "message"))
                .transpose()?,
        })
    }
}

impl MessageRow {
    pub fn into_message(self, receipts: Vec<ReceiptRow>) -> StoreResult<Message> {
        let kind = MessageKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Internal(format!("corrupt message kind '{}'", self.kind)))?;
        Ok(Message {
            id: parse_uuid(&self.id, "message")?,
            conversation_id: parse_uuid(&self.conversation_id, "conversation")?,
            seq: self.seq,
            sender: Identity::new(self.sender),
            sender_name: self.sender_name,
            body: self.body,
            kind,
            created_at: parse_ts(&self.created_at),
            is_edited: self.is_edited,
            edited_at: self.edited_at.as_deref().map(parse_ts),
            is_deleted: self.is_deleted,
            deleted_at: self.deleted_at.as_deref().map(parse_ts),
            reply_to: self
                .reply_to
                .as_deref()
                .map(|id| parse_uuid(id, "message"))
                .transpose()?,
            read_by: receipts
                .into_iter()
                .map(|r| ReadReceipt {
                    identity: Identity::new(r.identity),
                    read_at: parse_ts(&r.read_at),
                })
                .collect(),
        })
    }
}

/// `?, ?, ?` placeholder list for a dynamic IN clause.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
