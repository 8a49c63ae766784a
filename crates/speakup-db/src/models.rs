//! Database row types. These map directly to SQLite rows.
//! Distinct from speakup-types models to keep the DB layer independent;
//! the `into_model` conversions are where stored text gets validated.

use anyhow::Result;
use rusqlite::Row;

use speakup_types::models::{
    Like, Notification, PresenceRecord, Room, RoomParticipant, ScheduleSession,
};

use crate::{parse_timestamp, parse_uuid};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct PresenceRow {
    pub user_id: String,
    pub username: String,
    pub is_online: bool,
    pub last_seen_at: String,
    pub updated_at: String,
    pub call_status: String,
    pub in_room: bool,
    pub peer_id: Option<String>,
    pub room_code: Option<String>,
}

pub(crate) const PRESENCE_COLUMNS: &str =
    "user_id, username, is_online, last_seen_at, updated_at, call_status, in_room, peer_id, room_code";

impl PresenceRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            username: row.get(1)?,
            is_online: row.get(2)?,
            last_seen_at: row.get(3)?,
            updated_at: row.get(4)?,
            call_status: row.get(5)?,
            in_room: row.get(6)?,
            peer_id: row.get(7)?,
            room_code: row.get(8)?,
        })
    }

    pub fn into_model(self) -> Result<PresenceRecord> {
        Ok(PresenceRecord {
            user_id: parse_uuid(&self.user_id)?,
            username: self.username,
            is_online: self.is_online,
            last_seen_at: parse_timestamp(&self.last_seen_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            call_status: self.call_status.parse()?,
            in_room: self.in_room,
            peer_id: self.peer_id,
            room_code: self.room_code,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RoomRow {
    pub id: String,
    pub code: String,
    pub status: String,
    pub created_by: String,
    pub created_at: String,
}

impl RoomRow {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    pub fn into_model(self, participants: Vec<RoomParticipant>) -> Result<Room> {
        Ok(Room {
            id: parse_uuid(&self.id)?,
            code: self.code,
            status: self.status.parse()?,
            created_by: parse_uuid(&self.created_by)?,
            created_at: parse_timestamp(&self.created_at)?,
            participants,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ParticipantRow {
    pub user_id: String,
    pub username: String,
    pub joined_at: String,
    pub left_at: Option<String>,
}

impl ParticipantRow {
    pub fn into_model(self) -> Result<RoomParticipant> {
        Ok(RoomParticipant {
            user_id: parse_uuid(&self.user_id)?,
            username: self.username,
            joined_at: parse_timestamp(&self.joined_at)?,
            left_at: self.left_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LikeRow {
    pub id: String,
    pub room_id: String,
    pub liker_id: String,
    pub liked_user_id: String,
    pub created_at: String,
}

impl LikeRow {
    pub fn into_model(self) -> Result<Like> {
        Ok(Like {
            id: parse_uuid(&self.id)?,
            room_id: parse_uuid(&self.room_id)?,
            liker_id: parse_uuid(&self.liker_id)?,
            liked_user_id: parse_uuid(&self.liked_user_id)?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub booker_id: String,
    pub participant_id: String,
    pub scheduled_at_utc: String,
    pub duration_minutes: u32,
    pub status: String,
    pub booker_timezone: String,
    pub participant_timezone: String,
    pub created_at: String,
}

pub(crate) const SESSION_COLUMNS: &str = "id, booker_id, participant_id, scheduled_at_utc, duration_minutes, status, booker_timezone, participant_timezone, created_at";

impl SessionRow {
    /// Reads nine session columns starting at `offset`.
    pub(crate) fn from_row_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            booker_id: row.get(offset + 1)?,
            participant_id: row.get(offset + 2)?,
            scheduled_at_utc: row.get(offset + 3)?,
            duration_minutes: row.get(offset + 4)?,
            status: row.get(offset + 5)?,
            booker_timezone: row.get(offset + 6)?,
            participant_timezone: row.get(offset + 7)?,
            created_at: row.get(offset + 8)?,
        })
    }

    pub fn into_model(self) -> Result<ScheduleSession> {
        Ok(ScheduleSession {
            id: parse_uuid(&self.id)?,
            booker_id: parse_uuid(&self.booker_id)?,
            participant_id: parse_uuid(&self.participant_id)?,
            scheduled_at_utc: parse_timestamp(&self.scheduled_at_utc)?,
            duration_minutes: self.duration_minutes,
            status: self.status.parse()?,
            booker_timezone: self.booker_timezone,
            participant_timezone: self.participant_timezone,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

/// Notification joined with its actor's username and, when present, the
/// session it refers to.
#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub actor_id: String,
    pub actor_username: String,
    pub kind: String,
    pub is_read: bool,
    pub created_at: String,
    pub session: Option<SessionRow>,
}

impl NotificationRow {
    pub fn into_model(self) -> Result<Notification> {
        Ok(Notification {
            id: parse_uuid(&self.id)?,
            user_id: parse_uuid(&self.user_id)?,
            actor_id: parse_uuid(&self.actor_id)?,
            actor_username: self.actor_username,
            kind: self.kind.parse()?,
            is_read: self.is_read,
            created_at: parse_timestamp(&self.created_at)?,
            session: self.session.map(SessionRow::into_model).transpose()?,
        })
    }
}
