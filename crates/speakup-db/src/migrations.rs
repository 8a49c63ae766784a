use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS presence (
            user_id       TEXT PRIMARY KEY REFERENCES users(id),
            username      TEXT NOT NULL,
            is_online     INTEGER NOT NULL DEFAULT 0,
            last_seen_at  TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            call_status   TEXT NOT NULL DEFAULT 'idle',
            in_room       INTEGER NOT NULL DEFAULT 0,
            peer_id       TEXT,
            room_code     TEXT,
            CHECK (call_status = 'idle' OR peer_id IS NOT NULL)
        );

        CREATE INDEX IF NOT EXISTS idx_presence_directory
            ON presence(is_online DESC, updated_at DESC, user_id);

        CREATE TABLE IF NOT EXISTS rooms (
            id          TEXT PRIMARY KEY,
            code        TEXT NOT NULL UNIQUE,
            status      TEXT NOT NULL DEFAULT 'active',
            created_by  TEXT NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS room_participants (
            room_id     TEXT NOT NULL REFERENCES rooms(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            joined_at   TEXT NOT NULL,
            left_at     TEXT,
            PRIMARY KEY (room_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS likes (
            id              TEXT PRIMARY KEY,
            room_id         TEXT NOT NULL REFERENCES rooms(id),
            liker_id        TEXT NOT NULL REFERENCES users(id),
            liked_user_id   TEXT NOT NULL REFERENCES users(id),
            created_at      TEXT NOT NULL,
            UNIQUE(liker_id, liked_user_id),
            CHECK (liker_id != liked_user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_likes_liked
            ON likes(liked_user_id);

        CREATE TABLE IF NOT EXISTS schedule_sessions (
            id                    TEXT PRIMARY KEY,
            booker_id             TEXT NOT NULL REFERENCES users(id),
            participant_id        TEXT NOT NULL REFERENCES users(id),
            scheduled_at_utc      TEXT NOT NULL,
            duration_minutes      INTEGER NOT NULL,
            status                TEXT NOT NULL DEFAULT 'scheduled',
            booker_timezone       TEXT NOT NULL,
            participant_timezone  TEXT NOT NULL,
            created_at            TEXT NOT NULL,
            CHECK (booker_id != participant_id)
        );

        CREATE INDEX IF NOT EXISTS idx_schedule_booker
            ON schedule_sessions(booker_id, status, scheduled_at_utc);
        CREATE INDEX IF NOT EXISTS idx_schedule_participant
            ON schedule_sessions(participant_id, status, scheduled_at_utc);

        CREATE TABLE IF NOT EXISTS notifications (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id),
            actor_id    TEXT NOT NULL REFERENCES users(id),
            kind        TEXT NOT NULL,
            is_read     INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            session_id  TEXT REFERENCES schedule_sessions(id)
        );

        CREATE INDEX IF NOT EXISTS idx_notifications_user
            ON notifications(user_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
