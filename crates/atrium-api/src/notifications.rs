use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use tracing::warn;

use atrium_store::StoreError;
use atrium_types::api::{Claims, NotificationQuery, NotificationsResponse};
use atrium_types::identity::Identity;

use crate::AppState;
use crate::error::{ApiError, ApiResult};

/// Poll endpoint for the roster application's notification badge. Fails
/// open: a store outage yields an empty (degraded) summary rather than an
/// error, so one subsystem outage never blanks the host page.
pub async fn get_notifications(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Query(query): Query<NotificationQuery>,
    Extension(_claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let who = Identity::from(identity);

    let db = state.db.clone();
    let lookup = who.clone();
    let username = query.username.clone();
    let result = tokio::task::spawn_blocking(move || {
        db.compute_notifications(&lookup, username.as_deref())
    })
    .await
    .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {e}")))?;

    match result {
        Ok(notifications) => Ok(Json(NotificationsResponse {
            success: true,
            count: notifications.len(),
            notifications,
            degraded: false,
        })),
        Err(StoreError::Unavailable(reason)) => {
            warn!("notification lookup degraded for {}: {}", who, reason);
            Ok(Json(NotificationsResponse {
                success: true,
                notifications: vec![],
                count: 0,
                degraded: true,
            }))
        }
        Err(e) => Err(e.into()),
    }
}
