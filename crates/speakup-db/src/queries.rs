use crate::models::{PRESENCE_COLUMNS, PresenceRow, UserRow};
use crate::{Database, OptionalExt};
use anyhow::{Result, bail};
use rusqlite::Connection;

impl Database {
    // -- Users --

    /// Returns false when the username is already taken.
    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<bool> {
        self.with_conn(|conn| {
            match conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            ) {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    // -- Presence --

    /// Upsert the user's online flag. Going offline also drops call fields.
    /// Returns true when the row was created by this call.
    pub fn upsert_presence(&self, user_id: &str, is_online: bool, now: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let existed = tx
                .query_row("SELECT 1 FROM presence WHERE user_id = ?1", [user_id], |_| Ok(()))
                .optional()?
                .is_some();

            let written = tx.execute(
                "INSERT INTO presence (user_id, username, is_online, last_seen_at, updated_at)
                 SELECT id, username, ?2, ?3, ?3 FROM users WHERE id = ?1
                 ON CONFLICT(user_id) DO UPDATE SET
                    username     = excluded.username,
                    is_online    = excluded.is_online,
                    last_seen_at = excluded.last_seen_at,
                    updated_at   = excluded.updated_at,
                    call_status  = CASE WHEN excluded.is_online THEN presence.call_status ELSE 'idle' END,
                    peer_id      = CASE WHEN excluded.is_online THEN presence.peer_id ELSE NULL END",
                rusqlite::params![user_id, is_online, now],
            )?;

            if written == 0 {
                bail!("User not found: {}", user_id);
            }

            tx.commit()?;
            Ok(!existed)
        })
    }

    /// Heartbeat: refresh `last_seen_at` without touching `updated_at`.
    pub fn touch_presence(&self, user_id: &str, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE presence SET last_seen_at = ?2 WHERE user_id = ?1",
                [user_id, now],
            )?;
            Ok(())
        })
    }

    /// Write the call projection. A non-idle status needs a peer id; idle
    /// always clears it.
    pub fn set_call_status(
        &self,
        user_id: &str,
        status: &str,
        peer_id: Option<&str>,
        now: &str,
    ) -> Result<()> {
        let peer_id = if status == "idle" { None } else { peer_id };
        if status != "idle" && peer_id.is_none() {
            bail!("call status '{}' requires a peer id", status);
        }

        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE presence SET call_status = ?2, peer_id = ?3, updated_at = ?4 WHERE user_id = ?1",
                rusqlite::params![user_id, status, peer_id, now],
            )?;
            if updated == 0 {
                bail!("No presence row for {}", user_id);
            }
            Ok(())
        })
    }

    pub fn set_presence_room(&self, user_id: &str, room_code: Option<&str>, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE presence SET in_room = ?2, room_code = ?3, updated_at = ?4 WHERE user_id = ?1",
                rusqlite::params![user_id, room_code.is_some(), room_code, now],
            )?;
            if updated == 0 {
                bail!("No presence row for {}", user_id);
            }
            Ok(())
        })
    }

    pub fn get_presence(&self, user_id: &str) -> Result<Option<PresenceRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM presence WHERE user_id = ?1", PRESENCE_COLUMNS),
                [user_id],
                PresenceRow::from_row,
            )
            .optional()
        })
    }

    /// Directory order: online first, then most recently changed. The
    /// trailing `user_id` keeps pages disjoint when timestamps tie.
    pub fn fetch_presence_page(&self, offset: u64, limit: u32) -> Result<Vec<PresenceRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM presence
                 ORDER BY is_online DESC, updated_at DESC, user_id ASC
                 LIMIT ?1 OFFSET ?2",
                PRESENCE_COLUMNS
            ))?;

            let rows = stmt
                .query_map(rusqlite::params![limit, offset as i64], PresenceRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Online rows not seen since `cutoff`.
    pub fn stale_online_presence(&self, cutoff: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM presence WHERE is_online = 1 AND last_seen_at < ?1",
            )?;
            let ids = stmt
                .query_map([cutoff], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Boot-time reset: nobody is connected yet.
    pub fn mark_all_offline(&self, now: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE presence
                 SET is_online = 0, call_status = 'idle', peer_id = NULL, updated_at = ?1
                 WHERE is_online = 1 OR call_status != 'idle'",
                [now],
            )?;
            Ok(updated)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, username, password, created_at FROM users WHERE {} = ?1",
        column
    ))?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::test_support::db_with_users;
    use crate::timestamp;

    #[test]
    fn upsert_reports_insert_then_update() {
        let (db, ids) = db_with_users(&["alice"]);
        let now = timestamp(Utc::now());
        assert!(db.upsert_presence(&ids[0], true, &now).unwrap());
        assert!(!db.upsert_presence(&ids[0], false, &now).unwrap());

        let row = db.get_presence(&ids[0]).unwrap().unwrap();
        assert!(!row.is_online);
        assert_eq!(row.username, "alice");
    }

    #[test]
    fn duplicate_username_is_not_created() {
        let (db, _) = db_with_users(&["alice"]);
        let created = db.create_user("another-id", "alice", "hash").unwrap();
        assert!(!created);
        assert!(db.get_user_by_id("another-id").unwrap().is_none());
        assert!(db.create_user("bob-id", "bob", "hash").unwrap());
    }

    #[test]
    fn upsert_unknown_user_fails() {
        let (db, _) = db_with_users(&[]);
        let now = timestamp(Utc::now());
        assert!(db.upsert_presence("nobody", true, &now).is_err());
    }

    #[test]
    fn last_write_wins_for_online_flag() {
        let (db, ids) = db_with_users(&["alice"]);
        let start = Utc::now();
        let sequence = [true, false, true, true, false];
        for (i, online) in sequence.iter().enumerate() {
            let at = timestamp(start + Duration::seconds(i as i64));
            db.upsert_presence(&ids[0], *online, &at).unwrap();
        }
        let row = db.get_presence(&ids[0]).unwrap().unwrap().into_model().unwrap();
        assert!(!row.is_online);
        assert!(row.last_seen_at >= start + Duration::seconds(4));
    }

    #[test]
    fn going_offline_clears_call_fields() {
        let (db, ids) = db_with_users(&["alice"]);
        let now = timestamp(Utc::now());
        db.upsert_presence(&ids[0], true, &now).unwrap();
        db.set_call_status(&ids[0], "in_call", Some("peer-a"), &now).unwrap();

        db.upsert_presence(&ids[0], false, &now).unwrap();
        let row = db.get_presence(&ids[0]).unwrap().unwrap();
        assert_eq!(row.call_status, "idle");
        assert_eq!(row.peer_id, None);
    }

    #[test]
    fn busy_status_requires_peer_id() {
        let (db, ids) = db_with_users(&["alice"]);
        let now = timestamp(Utc::now());
        db.upsert_presence(&ids[0], true, &now).unwrap();
        assert!(db.set_call_status(&ids[0], "ringing", None, &now).is_err());

        db.set_call_status(&ids[0], "idle", Some("ignored"), &now).unwrap();
        assert_eq!(db.get_presence(&ids[0]).unwrap().unwrap().peer_id, None);
    }

    #[test]
    fn pages_are_disjoint_and_online_first() {
        let names: Vec<String> = (0..45).map(|i| format!("user{:02}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let (db, ids) = db_with_users(&refs);
        let now = timestamp(Utc::now());
        for (i, id) in ids.iter().enumerate() {
            db.upsert_presence(id, i % 3 == 0, &now).unwrap();
        }

        let first = db.fetch_presence_page(0, 20).unwrap();
        let second = db.fetch_presence_page(20, 20).unwrap();
        let third = db.fetch_presence_page(40, 20).unwrap();
        assert_eq!((first.len(), second.len(), third.len()), (20, 20, 5));

        let mut seen = std::collections::HashSet::new();
        for row in first.iter().chain(&second).chain(&third) {
            assert!(seen.insert(row.user_id.clone()), "duplicate {}", row.user_id);
        }
        assert!(first[..15].iter().all(|r| r.is_online));
    }

    #[test]
    fn stale_rows_and_boot_reset() {
        let (db, ids) = db_with_users(&["alice", "bob"]);
        let old = timestamp(Utc::now() - Duration::minutes(10));
        let fresh = timestamp(Utc::now());
        db.upsert_presence(&ids[0], true, &old).unwrap();
        db.upsert_presence(&ids[1], true, &fresh).unwrap();

        let cutoff = timestamp(Utc::now() - Duration::minutes(1));
        assert_eq!(db.stale_online_presence(&cutoff).unwrap(), vec![ids[0].clone()]);

        assert_eq!(db.mark_all_offline(&fresh).unwrap(), 2);
        assert!(db.stale_online_presence(&fresh).unwrap().is_empty());
    }
}
