use anyhow::Result;
use rusqlite::Connection;

use crate::models::{LikeRow, NotificationRow, SESSION_COLUMNS, SessionRow};
use crate::{Database, OptionalExt};

impl Database {
    // -- Likes --

    /// Insert a like unless the pair already has one. Returns the new row,
    /// or None when it was a duplicate.
    pub fn insert_like_if_absent(
        &self,
        id: &str,
        room_id: &str,
        liker_id: &str,
        liked_user_id: &str,
        now: &str,
    ) -> Result<Option<LikeRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if query_has_liked(&tx, liker_id, liked_user_id)? {
                return Ok(None);
            }

            tx.execute(
                "INSERT INTO likes (id, room_id, liker_id, liked_user_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                [id, room_id, liker_id, liked_user_id, now],
            )?;
            tx.commit()?;

            Ok(Some(LikeRow {
                id: id.to_string(),
                room_id: room_id.to_string(),
                liker_id: liker_id.to_string(),
                liked_user_id: liked_user_id.to_string(),
                created_at: now.to_string(),
            }))
        })
    }

    /// Delete every like from `liker_id` to `liked_user_id`; returns how many.
    pub fn delete_likes(&self, liker_id: &str, liked_user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM likes WHERE liker_id = ?1 AND liked_user_id = ?2",
                [liker_id, liked_user_id],
            )?;
            Ok(deleted)
        })
    }

    pub fn has_liked(&self, liker_id: &str, liked_user_id: &str) -> Result<bool> {
        self.with_conn(|conn| query_has_liked(conn, liker_id, liked_user_id))
    }

    /// Likes received by `liked_user_id` across all rooms.
    pub fn count_likes_for(&self, liked_user_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM likes WHERE liked_user_id = ?1",
                [liked_user_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    // -- Notifications --

    pub fn insert_notification(
        &self,
        id: &str,
        user_id: &str,
        actor_id: &str,
        kind: &str,
        session_id: Option<&str>,
        now: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications (id, user_id, actor_id, kind, is_read, created_at, session_id)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
                rusqlite::params![id, user_id, actor_id, kind, now, session_id],
            )?;
            Ok(())
        })
    }

    pub fn get_notification(&self, id: &str) -> Result<Option<NotificationRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("{} WHERE n.id = ?1", notification_select()),
                [id],
                notification_from_row,
            )
            .optional()
        })
    }

    /// Newest first.
    pub fn list_notifications(&self, user_id: &str, limit: u32) -> Result<Vec<NotificationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE n.user_id = ?1 ORDER BY n.created_at DESC LIMIT ?2",
                notification_select()
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit], notification_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns false when the notification does not exist or belongs to
    /// someone else.
    pub fn mark_notification_read(&self, id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND user_id = ?2",
                [id, user_id],
            )?;
            Ok(updated > 0)
        })
    }

    /// Returns the ids that were unread before this call.
    pub fn mark_all_notifications_read(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let ids = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM notifications WHERE user_id = ?1 AND is_read = 0",
                )?;
                let ids = stmt
                    .query_map([user_id], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                ids
            };
            tx.execute(
                "UPDATE notifications SET is_read = 1 WHERE user_id = ?1 AND is_read = 0",
                [user_id],
            )?;
            tx.commit()?;
            Ok(ids)
        })
    }
}

fn query_has_liked(conn: &Connection, liker_id: &str, liked_user_id: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM likes WHERE liker_id = ?1 AND liked_user_id = ?2",
            [liker_id, liked_user_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn notification_select() -> String {
    let session_columns: Vec<String> = SESSION_COLUMNS
        .split(", ")
        .map(|column| format!("s.{}", column))
        .collect();
    format!(
        "SELECT n.id, n.user_id, n.actor_id, COALESCE(u.username, 'unknown'), n.kind, n.is_read, n.created_at, {}
         FROM notifications n
         LEFT JOIN users u ON u.id = n.actor_id
         LEFT JOIN schedule_sessions s ON s.id = n.session_id",
        session_columns.join(", ")
    )
}

fn notification_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotificationRow> {
    let session_id: Option<String> = row.get(7)?;
    let session = match session_id {
        Some(_) => Some(SessionRow::from_row_at(row, 7)?),
        None => None,
    };
    Ok(NotificationRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        actor_id: row.get(2)?,
        actor_username: row.get(3)?,
        kind: row.get(4)?,
        is_read: row.get(5)?,
        created_at: row.get(6)?,
        session,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::test_support::db_with_users;
    use crate::timestamp;

    #[test]
    fn duplicate_like_is_not_inserted() {
        let (db, ids) = db_with_users(&["alice", "bob"]);
        let now = timestamp(Utc::now());
        db.create_room("room-1", "R123", &ids[0], &now).unwrap();

        let first = db.insert_like_if_absent("l1", "room-1", &ids[0], &ids[1], &now).unwrap();
        let second = db.insert_like_if_absent("l2", "room-1", &ids[0], &ids[1], &now).unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(db.count_likes_for(&ids[1]).unwrap(), 1);

        assert_eq!(db.delete_likes(&ids[0], &ids[1]).unwrap(), 1);
        assert_eq!(db.delete_likes(&ids[0], &ids[1]).unwrap(), 0);
        assert!(!db.has_liked(&ids[0], &ids[1]).unwrap());
    }

    #[test]
    fn self_like_violates_check() {
        let (db, ids) = db_with_users(&["alice"]);
        let now = timestamp(Utc::now());
        db.create_room("room-1", "R123", &ids[0], &now).unwrap();
        assert!(db.insert_like_if_absent("l1", "room-1", &ids[0], &ids[0], &now).is_err());
    }

    #[test]
    fn notifications_join_actor_and_mark_read() {
        let (db, ids) = db_with_users(&["alice", "bob"]);
        let now = timestamp(Utc::now());
        db.insert_notification("n1", &ids[1], &ids[0], "missed_call", None, &now).unwrap();
        db.insert_notification("n2", &ids[1], &ids[0], "missed_call", None, &now).unwrap();

        let row = db.get_notification("n1").unwrap().unwrap();
        assert_eq!(row.actor_username, "alice");
        assert!(row.session.is_none());

        assert!(!db.mark_notification_read("n1", &ids[0]).unwrap());
        assert!(db.mark_notification_read("n1", &ids[1]).unwrap());
        assert_eq!(db.mark_all_notifications_read(&ids[1]).unwrap(), vec!["n2".to_string()]);
        assert!(db.list_notifications(&ids[1], 10).unwrap().iter().all(|n| n.is_read));
    }
}
