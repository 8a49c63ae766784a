use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use rand::Rng;
use tracing::info;
use uuid::Uuid;

use speakup_db::timestamp;
use speakup_types::api::Claims;
use speakup_types::models::Room;

use crate::error::ApiError;
use crate::{AppState, db};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LEN: usize = 6;
const CODE_ATTEMPTS: usize = 5;

pub fn generate_room_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

pub async fn create_room(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let room_id = Uuid::new_v4().to_string();
    let creator = claims.sub.to_string();

    let code = db(&state, move |db| {
        for _ in 0..CODE_ATTEMPTS {
            let code = generate_room_code();
            if db.get_room_by_code(&code)?.is_none() {
                db.create_room(&room_id, &code, &creator, &timestamp(Utc::now()))?;
                return Ok(Some(code));
            }
        }
        Ok(None)
    })
    .await?
    .ok_or_else(|| anyhow::anyhow!("no free room code after {} attempts", CODE_ATTEMPTS))?;

    info!("{} opened room {}", claims.username, code);
    state
        .gateway
        .presence
        .set_room(claims.sub, Some(code.clone()))
        .await;

    let room = load_room(&state, &code).await?;
    Ok((StatusCode::CREATED, Json(room)))
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Room>, ApiError> {
    Ok(Json(load_room(&state, &code).await?))
}

pub async fn join_room(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(code): Path<String>,
) -> Result<Json<Room>, ApiError> {
    let lookup = code.clone();
    let room = db(&state, move |db| db.get_room_by_code(&lookup))
        .await?
        .ok_or_else(|| ApiError::NotFound("room not found".into()))?;
    if !room.is_active() {
        return Err(ApiError::Conflict("room is closed".into()));
    }

    let user_id = claims.sub.to_string();
    db(&state, move |db| {
        db.join_room(&room.id, &user_id, &timestamp(Utc::now()))
    })
    .await?;

    info!("{} joined room {}", claims.username, code);
    state
        .gateway
        .presence
        .set_room(claims.sub, Some(code.clone()))
        .await;

    Ok(Json(load_room(&state, &code).await?))
}

pub async fn leave_room(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(code): Path<String>,
) -> Result<Json<Room>, ApiError> {
    let lookup = code.clone();
    let room = db(&state, move |db| db.get_room_by_code(&lookup))
        .await?
        .ok_or_else(|| ApiError::NotFound("room not found".into()))?;

    let user_id = claims.sub.to_string();
    let left = db(&state, move |db| {
        db.leave_room(&room.id, &user_id, &timestamp(Utc::now()))
    })
    .await?;
    if !left {
        return Err(ApiError::NotFound("not in this room".into()));
    }

    info!("{} left room {}", claims.username, code);
    state.gateway.presence.set_room(claims.sub, None).await;

    Ok(Json(load_room(&state, &code).await?))
}

async fn load_room(state: &AppState, code: &str) -> Result<Room, ApiError> {
    let code = code.to_string();
    let loaded = db(state, move |db| {
        let Some(room) = db.get_room_by_code(&code)? else {
            return Ok(None);
        };
        let participants = db.get_room_participants(&room.id)?;
        Ok(Some((room, participants)))
    })
    .await?;

    let (room, participants) = loaded.ok_or_else(|| ApiError::NotFound("room not found".into()))?;
    let participants = participants
        .into_iter()
        .map(|p| p.into_model())
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(room.into_model(participants)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_six_upper_alphanumerics() {
        for _ in 0..50 {
            let code = generate_room_code();
            assert_eq!(code.len(), CODE_LEN);
            assert!(
                code.chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
            );
        }
    }
}
