use anyhow::{Result, bail};
use rusqlite::Connection;

use crate::models::{ParticipantRow, RoomRow};
use crate::{Database, OptionalExt};

impl Database {
    /// Create an active room with its creator as the first participant.
    pub fn create_room(&self, id: &str, code: &str, created_by: &str, now: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO rooms (id, code, status, created_by, created_at) VALUES (?1, ?2, 'active', ?3, ?4)",
                [id, code, created_by, now],
            )?;
            tx.execute(
                "INSERT INTO room_participants (room_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                [id, created_by, now],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_room_by_code(&self, code: &str) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| query_room_by_code(conn, code))
    }

    pub fn get_room_participants(&self, room_id: &str) -> Result<Vec<ParticipantRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.user_id, u.username, p.joined_at, p.left_at
                 FROM room_participants p
                 JOIN users u ON u.id = p.user_id
                 WHERE p.room_id = ?1
                 ORDER BY p.joined_at ASC",
            )?;
            let rows = stmt
                .query_map([room_id], |row| {
                    Ok(ParticipantRow {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        joined_at: row.get(2)?,
                        left_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn is_active_participant(&self, room_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| query_is_active_participant(conn, room_id, user_id))
    }

    /// Join (or rejoin) an active room.
    pub fn join_room(&self, room_id: &str, user_id: &str, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            let active: Option<String> = conn
                .query_row(
                    "SELECT status FROM rooms WHERE id = ?1",
                    [room_id],
                    |row| row.get(0),
                )
                .optional()?;
            if active.as_deref() != Some("active") {
                bail!("Room {} is not active", room_id);
            }

            conn.execute(
                "INSERT INTO room_participants (room_id, user_id, joined_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(room_id, user_id) DO UPDATE SET joined_at = excluded.joined_at, left_at = NULL",
                [room_id, user_id, now],
            )?;
            Ok(())
        })
    }

    /// Mark the participant as left. The room closes when nobody is left.
    /// Returns false when the user was not an active participant.
    pub fn leave_room(&self, room_id: &str, user_id: &str, now: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let left = tx.execute(
                "UPDATE room_participants SET left_at = ?3
                 WHERE room_id = ?1 AND user_id = ?2 AND left_at IS NULL",
                [room_id, user_id, now],
            )?;
            if left == 0 {
                return Ok(false);
            }

            let remaining: i64 = tx.query_row(
                "SELECT COUNT(*) FROM room_participants WHERE room_id = ?1 AND left_at IS NULL",
                [room_id],
                |row| row.get(0),
            )?;
            if remaining == 0 {
                tx.execute("UPDATE rooms SET status = 'closed' WHERE id = ?1", [room_id])?;
            }

            tx.commit()?;
            Ok(true)
        })
    }
}

pub(crate) fn query_room_by_code(conn: &Connection, code: &str) -> Result<Option<RoomRow>> {
    conn.query_row(
        "SELECT id, code, status, created_by, created_at FROM rooms WHERE code = ?1",
        [code],
        |row| {
            Ok(RoomRow {
                id: row.get(0)?,
                code: row.get(1)?,
                status: row.get(2)?,
                created_by: row.get(3)?,
                created_at: row.get(4)?,
            })
        },
    )
    .optional()
}

pub(crate) fn query_is_active_participant(
    conn: &Connection,
    room_id: &str,
    user_id: &str,
) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM room_participants WHERE room_id = ?1 AND user_id = ?2 AND left_at IS NULL",
            [room_id, user_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::test_support::db_with_users;
    use crate::timestamp;

    #[test]
    fn last_leave_closes_room() {
        let (db, ids) = db_with_users(&["alice", "bob"]);
        let now = timestamp(Utc::now());
        db.create_room("room-1", "R123", &ids[0], &now).unwrap();
        db.join_room("room-1", &ids[1], &now).unwrap();
        assert!(db.is_active_participant("room-1", &ids[1]).unwrap());

        assert!(db.leave_room("room-1", &ids[0], &now).unwrap());
        assert!(db.get_room_by_code("R123").unwrap().unwrap().is_active());
        assert!(!db.leave_room("room-1", &ids[0], &now).unwrap());

        assert!(db.leave_room("room-1", &ids[1], &now).unwrap());
        assert!(!db.get_room_by_code("R123").unwrap().unwrap().is_active());
        assert!(db.join_room("room-1", &ids[1], &now).is_err());
    }

    #[test]
    fn rejoin_clears_left_at() {
        let (db, ids) = db_with_users(&["alice", "bob"]);
        let now = timestamp(Utc::now());
        db.create_room("room-1", "R123", &ids[0], &now).unwrap();
        db.join_room("room-1", &ids[1], &now).unwrap();
        db.leave_room("room-1", &ids[1], &now).unwrap();
        db.join_room("room-1", &ids[1], &now).unwrap();

        let participants = db.get_room_participants("room-1").unwrap();
        assert_eq!(participants.len(), 2);
        assert!(participants.iter().all(|p| p.left_at.is_none()));
    }
}
