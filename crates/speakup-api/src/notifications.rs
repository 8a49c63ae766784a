use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use tracing::warn;
use uuid::Uuid;

use speakup_types::api::{Claims, MarkAllReadResponse, NotificationQuery};
use speakup_types::events::NotificationChange;
use speakup_types::models::Notification;

use crate::error::ApiError;
use crate::{AppState, db};

const MAX_LIMIT: u32 = 100;

pub async fn list_notifications(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<NotificationQuery>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let limit = query.limit.clamp(1, MAX_LIMIT);
    let user_id = claims.sub.to_string();
    let rows = db(&state, move |db| db.list_notifications(&user_id, limit)).await?;

    let notifications = rows
        .into_iter()
        .map(|row| row.into_model())
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Json(notifications))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = claims.sub.to_string();
    let updated = db(&state, move |db| {
        db.mark_notification_read(&id.to_string(), &user_id)
    })
    .await?;
    if !updated {
        return Err(ApiError::NotFound("notification not found".into()));
    }

    state
        .gateway
        .dispatcher
        .notifications()
        .publish(NotificationChange::Update {
            id,
            user_id: claims.sub,
            is_read: true,
        });

    Ok(Json(serde_json::json!({ "id": id, "isRead": true })))
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MarkAllReadResponse>, ApiError> {
    let user_id = claims.sub.to_string();
    let ids = db(&state, move |db| db.mark_all_notifications_read(&user_id)).await?;

    let bus = state.gateway.dispatcher.notifications();
    for raw in &ids {
        match raw.parse::<Uuid>() {
            Ok(id) => {
                bus.publish(NotificationChange::Update {
                    id,
                    user_id: claims.sub,
                    is_read: true,
                });
            }
            Err(e) => warn!("Skipping corrupt notification id {}: {}", raw, e),
        }
    }

    Ok(Json(MarkAllReadResponse {
        updated: ids.len(),
    }))
}
