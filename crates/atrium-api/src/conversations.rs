use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use atrium_types::api::{
    Ack, AddParticipantRequest, Claims, ConversationListResponse, ConversationResponse,
    ConversationView, CreateDirectRequest, CreateGroupRequest, ReadAllResponse,
};
use atrium_types::identity::Identity;
use atrium_types::models::Conversation;

use crate::AppState;
use crate::error::{ApiError, ApiResult};
use crate::middleware::claims_identity;

fn view_for(conversation: Conversation, unread_count: usize, who: &Identity) -> ConversationView {
    let display_name = conversation.name_for(who);
    ConversationView {
        conversation,
        display_name,
        unread_count,
    }
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let who = claims_identity(&claims);

    let db = state.db.clone();
    let lookup = who.clone();
    let rows = tokio::task::spawn_blocking(move || db.list_for(&lookup))
        .await
        .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {e}")))??;

    let data = rows
        .into_iter()
        .map(|(conv, unread)| view_for(conv, unread, &who))
        .collect();

    Ok(Json(ConversationListResponse {
        success: true,
        data,
    }))
}

pub async fn create_direct(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateDirectRequest>,
) -> ApiResult<impl IntoResponse> {
    let who = claims_identity(&claims);
    let peer = Identity::from(req.peer_identity);

    let db = state.db.clone();
    let creator = who.clone();
    let creator_name = claims.username.clone();
    let conversation = tokio::task::spawn_blocking(move || {
        db.create_direct(&creator, &creator_name, &peer, &req.peer_display_name)
    })
    .await
    .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {e}")))??;

    // Idempotent: re-posting the same pair returns the existing
    // conversation, so 200 rather than 201 keeps clients honest.
    Ok(Json(ConversationResponse {
        success: true,
        conversation: view_for(conversation, 0, &who),
    }))
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<impl IntoResponse> {
    let who = claims_identity(&claims);

    let db = state.db.clone();
    let creator = who.clone();
    let creator_name = claims.username.clone();
    let conversation = tokio::task::spawn_blocking(move || {
        let participants: Vec<(Identity, String)> = req
            .participants
            .into_iter()
            .map(|p| (Identity::from(p.identity), p.display_name))
            .collect();
        db.create_group(&req.name, &creator, &creator_name, &participants)
    })
    .await
    .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {e}")))??;

    Ok((
        StatusCode::CREATED,
        Json(ConversationResponse {
            success: true,
            conversation: view_for(conversation, 0, &who),
        }),
    ))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let who = claims_identity(&claims);

    let db = state.db.clone();
    let requester = who.clone();
    let (conversation, unread) = tokio::task::spawn_blocking(move || {
        let conv = db.get_conversation(id)?;
        if conv.participant_for(&requester).is_none() {
            return Err(atrium_store::StoreError::PermissionDenied(
                "Not a participant".into(),
            ));
        }
        let unread = db.unread_for(&requester, Some(id))?.len();
        Ok((conv, unread))
    })
    .await
    .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {e}")))??;

    Ok(Json(ConversationResponse {
        success: true,
        conversation: view_for(conversation, unread, &who),
    }))
}

pub async fn add_participant(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddParticipantRequest>,
) -> ApiResult<impl IntoResponse> {
    let who = claims_identity(&claims);
    let newcomer = Identity::from(req.identity);

    let db = state.db.clone();
    let actor = who.clone();
    let conversation = tokio::task::spawn_blocking(move || {
        db.add_participant(id, &actor, &newcomer, &req.display_name)
    })
    .await
    .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {e}")))??;

    Ok(Json(ConversationResponse {
        success: true,
        conversation: view_for(conversation, 0, &who),
    }))
}

pub async fn remove_participant(
    State(state): State<AppState>,
    Path((id, identity)): Path<(Uuid, String)>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let who = claims_identity(&claims);
    let target = Identity::from(identity);

    let db = state.db.clone();
    let actor = who.clone();
    let conversation =
        tokio::task::spawn_blocking(move || db.remove_participant(id, &actor, &target))
            .await
            .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {e}")))??;

    Ok(Json(ConversationResponse {
        success: true,
        conversation: view_for(conversation, 0, &who),
    }))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let who = claims_identity(&claims);

    let db = state.db.clone();
    tokio::task::spawn_blocking(move || db.soft_delete_conversation(id, &who))
        .await
        .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {e}")))??;

    Ok(Json(Ack {
        success: true,
        message: "Conversation deleted".into(),
    }))
}

pub async fn read_all(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let who = claims_identity(&claims);

    let db = state.db.clone();
    let reader = who.clone();
    let marked_count = tokio::task::spawn_blocking(move || db.mark_all_read(id, &reader))
        .await
        .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {e}")))??;

    // Other participants' unread badges change too; joined connections
    // hear about it immediately.
    state
        .gateway
        .dispatcher
        .publish(
            id,
            atrium_types::events::GatewayEvent::ReadReceiptUpdated {
                conversation_id: id,
                identity: who,
                read_count: marked_count,
            },
            None,
        )
        .await;

    Ok(Json(ReadAllResponse {
        success: true,
        marked_count,
        conversation_id: id,
    }))
}
