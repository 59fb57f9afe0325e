use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    Conversation, Message, MessageKind, NotificationSummary, PaginationMeta,
};

// -- JWT claims --

/// Claims carried by tokens the roster application issues. Shared between
/// the REST middleware and the gateway token verifier; canonical definition
/// lives here to avoid duplication. `sub` is the identity in whichever form
/// the issuer used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub exp: usize,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
pub struct CreateDirectRequest {
    pub peer_identity: String,
    pub peer_display_name: String,
}

#[derive(Debug, Deserialize)]
pub struct ParticipantRef {
    pub identity: String,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub participants: Vec<ParticipantRef>,
}

#[derive(Debug, Deserialize)]
pub struct AddParticipantRequest {
    pub identity: String,
    pub display_name: String,
}

/// A conversation annotated for one requesting identity: resolved display
/// name and unread count.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationView {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub display_name: String,
    pub unread_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    pub success: bool,
    pub data: Vec<ConversationView>,
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub success: bool,
    pub conversation: ConversationView,
}

// -- Messages --

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: Uuid,
    pub body: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub body: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    /// Accepts both spellings; the roster application's pager sends
    /// `pageSize`.
    #[serde(default = "default_page_size", alias = "pageSize")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub success: bool,
    pub messages: Vec<Message>,
    pub pagination: PaginationMeta,
}

#[derive(Debug, Serialize)]
pub struct ReadAllResponse {
    pub success: bool,
    pub marked_count: usize,
    pub conversation_id: Uuid,
}

// -- Notifications --

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    /// Lets the poller supply the username so the legacy username-derived
    /// identity form is included in the lookup.
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NotificationsResponse {
    pub success: bool,
    pub notifications: Vec<NotificationSummary>,
    pub count: usize,
    /// Set when the backing store was unreachable and the empty result is
    /// fail-open rather than a true "no unread messages".
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

// -- Generic --

#[derive(Debug, Serialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}
