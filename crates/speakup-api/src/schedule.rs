use axum::{
    Extension, Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use speakup_db::models::SessionRow;
use speakup_db::timestamp;
use speakup_gateway::notifications::notify;
use speakup_types::api::{Claims, CreateScheduleRequest};
use speakup_types::models::{NotificationKind, ScheduleSession, SessionStatus};

use crate::error::ApiError;
use crate::{AppState, db};

const MIN_DURATION_MINUTES: u32 = 10;
const MAX_DURATION_MINUTES: u32 = 180;

pub async fn create_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Result<Json<CreateScheduleRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;

    if req.participant_id == claims.sub {
        return Err(ApiError::BadRequest("cannot book a session with yourself".into()));
    }
    if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&req.duration_minutes) {
        return Err(ApiError::BadRequest(format!(
            "durationMinutes must be between {} and {}",
            MIN_DURATION_MINUTES, MAX_DURATION_MINUTES
        )));
    }
    let now = Utc::now();
    if req.scheduled_at_utc <= now {
        return Err(ApiError::BadRequest("scheduledAtUtc must be in the future".into()));
    }

    let participant = req.participant_id.to_string();
    if db(&state, move |db| db.get_user_by_id(&participant))
        .await?
        .is_none()
    {
        return Err(ApiError::NotFound("participant not found".into()));
    }

    let id = Uuid::new_v4();
    let row = SessionRow {
        id: id.to_string(),
        booker_id: claims.sub.to_string(),
        participant_id: req.participant_id.to_string(),
        scheduled_at_utc: timestamp(req.scheduled_at_utc),
        duration_minutes: req.duration_minutes,
        status: SessionStatus::Scheduled.as_str().to_string(),
        booker_timezone: req.booker_timezone,
        participant_timezone: req.participant_timezone,
        created_at: timestamp(now),
    };
    let session = row.clone().into_model()?;
    db(&state, move |db| db.insert_schedule_session(&row)).await?;

    info!(
        "{} booked {} with {} at {}",
        claims.username, id, req.participant_id, req.scheduled_at_utc
    );
    notify_party(
        &state,
        req.participant_id,
        claims.sub,
        NotificationKind::SessionScheduled,
        id,
    )
    .await;

    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ScheduleSession>>, ApiError> {
    let user_id = claims.sub.to_string();
    let rows = db(&state, move |db| db.list_scheduled_for(&user_id)).await?;
    let sessions = rows
        .into_iter()
        .map(SessionRow::into_model)
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Json(sessions))
}

pub async fn cancel_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScheduleSession>, ApiError> {
    let session = finish(&state, &claims, id, SessionStatus::Cancelled).await?;

    let other = if session.booker_id == claims.sub {
        session.participant_id
    } else {
        session.booker_id
    };
    notify_party(&state, other, claims.sub, NotificationKind::SessionCancelled, id).await;

    Ok(Json(session))
}

pub async fn complete_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScheduleSession>, ApiError> {
    let session = finish(&state, &claims, id, SessionStatus::Completed).await?;
    Ok(Json(session))
}

/// Move a scheduled session to a final status on behalf of either party.
async fn finish(
    state: &AppState,
    claims: &Claims,
    id: Uuid,
    status: SessionStatus,
) -> Result<ScheduleSession, ApiError> {
    let sid = id.to_string();
    let session = db(state, move |db| db.get_schedule_session(&sid))
        .await?
        .ok_or_else(|| ApiError::NotFound("session not found".into()))?
        .into_model()?;

    if session.booker_id != claims.sub && session.participant_id != claims.sub {
        return Err(ApiError::Forbidden("not a party to this session".into()));
    }
    if session.status != SessionStatus::Scheduled {
        return Err(ApiError::Conflict(format!(
            "session is already {}",
            session.status.as_str()
        )));
    }

    let sid = id.to_string();
    let moved = db(state, move |db| {
        db.finish_schedule_session(&sid, status.as_str())
    })
    .await?;
    if !moved {
        return Err(ApiError::Conflict("session is no longer scheduled".into()));
    }

    info!("{} marked session {} {}", claims.username, id, status.as_str());
    Ok(ScheduleSession { status, ..session })
}

/// The booking already happened; a failed notification is only logged.
async fn notify_party(
    state: &AppState,
    recipient: Uuid,
    actor: Uuid,
    kind: NotificationKind,
    session_id: Uuid,
) {
    let gateway = &state.gateway;
    if let Err(e) = notify(
        &gateway.db,
        &gateway.dispatcher,
        recipient,
        actor,
        kind,
        Some(session_id),
    )
    .await
    {
        warn!("{} notification for {} failed: {}", kind.as_str(), recipient, e);
    }
}
