use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use atrium_types::api::{
    Ack, Claims, EditMessageRequest, HistoryQuery, HistoryResponse, MessageResponse,
    SendMessageRequest,
};
use atrium_types::events::GatewayEvent;

use crate::AppState;
use crate::error::{ApiError, ApiResult};
use crate::middleware::claims_identity;

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let who = claims_identity(&claims);
    let conversation_id = req.conversation_id;

    // Same per-conversation lock the gateway send path takes, so REST and
    // WebSocket writers interleave in store order.
    let order_lock = state.gateway.dispatcher.order_lock(conversation_id).await;
    let message = {
        let _guard = order_lock.lock().await;

        let db = state.db.clone();
        let sender = who.clone();
        let sender_name = claims.username.clone();
        let message = tokio::task::spawn_blocking(move || {
            db.append_message(
                conversation_id,
                &sender,
                &sender_name,
                &req.body,
                req.kind,
                req.reply_to,
            )
        })
        .await
        .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {e}")))??;

        state
            .gateway
            .dispatcher
            .publish(
                conversation_id,
                GatewayEvent::MessageAppended {
                    message: message.clone(),
                },
                None,
            )
            .await;
        message
    };

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            success: true,
            message,
        }),
    ))
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let who = claims_identity(&claims);

    let db = state.db.clone();
    let (messages, pagination) = tokio::task::spawn_blocking(move || {
        db.history(conversation_id, Some(&who), query.page, query.page_size)
    })
    .await
    .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {e}")))??;

    Ok(Json(HistoryResponse {
        success: true,
        messages,
        pagination,
    }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let who = claims_identity(&claims);

    let db = state.db.clone();
    let newly_marked = tokio::task::spawn_blocking(move || db.mark_read(id, &who))
        .await
        .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {e}")))??;

    let message = if newly_marked {
        "Message marked as read"
    } else {
        "Message was already read"
    };
    Ok(Json(Ack {
        success: true,
        message: message.into(),
    }))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let who = claims_identity(&claims);

    let db = state.db.clone();
    let message = tokio::task::spawn_blocking(move || db.edit_message(id, &who, &req.body))
        .await
        .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {e}")))??;

    Ok(Json(MessageResponse {
        success: true,
        message,
    }))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let who = claims_identity(&claims);

    let db = state.db.clone();
    let message = tokio::task::spawn_blocking(move || db.soft_delete_message(id, &who))
        .await
        .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {e}")))??;

    Ok(Json(MessageResponse {
        success: true,
        message,
    }))
}
