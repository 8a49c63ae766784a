use axum::{
    Extension, Json,
    extract::{Query, State, rejection::JsonRejection},
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use speakup_db::timestamp;
use speakup_types::api::{
    Claims, LikeAction, LikeQuery, LikeResult, LikeStatusResponse, ToggleLikeRequest,
    ToggleLikeResponse,
};
use speakup_types::events::LikeChange;

use crate::error::ApiError;
use crate::{AppState, db};

pub async fn like_status(
    State(state): State<AppState>,
    Query(query): Query<LikeQuery>,
) -> Result<Json<LikeStatusResponse>, ApiError> {
    let (Some(liker_id), Some(liked_id)) = (query.liker_id, query.liked_id) else {
        return Err(ApiError::BadRequest("likerId and likedId are required".into()));
    };

    let (has_liked, total_likes) = db(&state, move |db| {
        let liker = liker_id.to_string();
        let liked = liked_id.to_string();
        Ok((db.has_liked(&liker, &liked)?, db.count_likes_for(&liked)?))
    })
    .await?;

    Ok(Json(LikeStatusResponse {
        has_liked,
        total_likes,
    }))
}

/// Like or unlike another participant of an active room. Idempotent: a
/// repeated like reports `already_liked`, a repeated unlike `not_found`.
pub async fn toggle_like(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Result<Json<ToggleLikeRequest>, JsonRejection>,
) -> Result<Json<ToggleLikeResponse>, ApiError> {
    let Json(req) = body?;
    let (Some(room_code), Some(liker_id), Some(liked_id), Some(action)) =
        (req.room_code, req.liker_id, req.liked_id, req.action)
    else {
        return Err(ApiError::BadRequest(
            "roomCode, likerId, likedId and action are required".into(),
        ));
    };

    if liker_id == liked_id {
        return Err(ApiError::BadRequest("cannot like yourself".into()));
    }
    if claims.sub != liker_id {
        return Err(ApiError::Forbidden("likerId must be the caller".into()));
    }

    let code = room_code.clone();
    let room = db(&state, move |db| db.get_room_by_code(&code))
        .await?
        .filter(|room| room.is_active())
        .ok_or_else(|| ApiError::NotFound("room not found".into()))?;

    let room_id = room.id.clone();
    let both_present = db(&state, move |db| {
        Ok(db.is_active_participant(&room_id, &liker_id.to_string())?
            && db.is_active_participant(&room_id, &liked_id.to_string())?)
    })
    .await?;
    if !both_present {
        return Err(ApiError::Forbidden(
            "both users must be in the room".into(),
        ));
    }

    let liker = liker_id.to_string();
    let liked = liked_id.to_string();
    let (result, total_likes, change) = match action {
        LikeAction::Like => {
            let like_id = Uuid::new_v4().to_string();
            let room_id = room.id.clone();
            let (row, total) = db(&state, move |db| {
                let row = db.insert_like_if_absent(
                    &like_id,
                    &room_id,
                    &liker,
                    &liked,
                    &timestamp(Utc::now()),
                )?;
                Ok((row, db.count_likes_for(&liked)?))
            })
            .await?;

            match row {
                Some(row) => {
                    let like = row.into_model()?;
                    let change = LikeChange::Insert {
                        room_code: room_code.clone(),
                        like,
                        total_likes: total,
                    };
                    (LikeResult::Liked, total, Some(change))
                }
                None => (LikeResult::AlreadyLiked, total, None),
            }
        }
        LikeAction::Unlike => {
            let (deleted, total) = db(&state, move |db| {
                let deleted = db.delete_likes(&liker, &liked)?;
                Ok((deleted, db.count_likes_for(&liked)?))
            })
            .await?;

            if deleted > 0 {
                let change = LikeChange::Delete {
                    room_code: room_code.clone(),
                    liker_id,
                    liked_user_id: liked_id,
                    total_likes: total,
                };
                (LikeResult::Unliked, total, Some(change))
            } else {
                (LikeResult::NotFound, total, None)
            }
        }
    };

    if let Some(change) = change {
        info!("{} -> {} in {}: {:?}", liker_id, liked_id, room_code, result);
        state.gateway.dispatcher.likes().publish(change);
    }

    Ok(Json(ToggleLikeResponse {
        action: result,
        total_likes,
    }))
}
