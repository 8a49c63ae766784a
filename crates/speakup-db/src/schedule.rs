use anyhow::Result;

use crate::models::{SESSION_COLUMNS, SessionRow};
use crate::{Database, OptionalExt};

impl Database {
    pub fn insert_schedule_session(&self, session: &SessionRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO schedule_sessions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    SESSION_COLUMNS
                ),
                rusqlite::params![
                    session.id,
                    session.booker_id,
                    session.participant_id,
                    session.scheduled_at_utc,
                    session.duration_minutes,
                    session.status,
                    session.booker_timezone,
                    session.participant_timezone,
                    session.created_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_schedule_session(&self, id: &str) -> Result<Option<SessionRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM schedule_sessions WHERE id = ?1", SESSION_COLUMNS),
                [id],
                |row| SessionRow::from_row_at(row, 0),
            )
            .optional()
        })
    }

    /// Upcoming sessions where the user is on either side, earliest first.
    pub fn list_scheduled_for(&self, user_id: &str) -> Result<Vec<SessionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM schedule_sessions
                 WHERE (booker_id = ?1 OR participant_id = ?1) AND status = 'scheduled'
                 ORDER BY scheduled_at_utc ASC",
                SESSION_COLUMNS
            ))?;
            let rows = stmt
                .query_map([user_id], |row| SessionRow::from_row_at(row, 0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Move a `scheduled` session to `status`. Returns false if it was no
    /// longer scheduled.
    pub fn finish_schedule_session(&self, id: &str, status: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE schedule_sessions SET status = ?2 WHERE id = ?1 AND status = 'scheduled'",
                [id, status],
            )?;
            Ok(updated > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::models::SessionRow;
    use crate::test_support::db_with_users;
    use crate::timestamp;

    fn session(id: &str, booker: &str, participant: &str, hours: i64) -> SessionRow {
        SessionRow {
            id: id.to_string(),
            booker_id: booker.to_string(),
            participant_id: participant.to_string(),
            scheduled_at_utc: timestamp(Utc::now() + Duration::hours(hours)),
            duration_minutes: 30,
            status: "scheduled".to_string(),
            booker_timezone: "Europe/London".to_string(),
            participant_timezone: "Asia/Ho_Chi_Minh".to_string(),
            created_at: timestamp(Utc::now()),
        }
    }

    #[test]
    fn lists_both_sides_in_time_order() {
        let (db, ids) = db_with_users(&["alice", "bob", "carol"]);
        db.insert_schedule_session(&session("late", &ids[0], &ids[1], 48)).unwrap();
        db.insert_schedule_session(&session("early", &ids[1], &ids[0], 2)).unwrap();
        db.insert_schedule_session(&session("other", &ids[1], &ids[2], 1)).unwrap();

        let ids_for_alice: Vec<String> = db
            .list_scheduled_for(&ids[0])
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids_for_alice, ["early", "late"]);
    }

    #[test]
    fn cancelled_sessions_drop_out() {
        let (db, ids) = db_with_users(&["alice", "bob"]);
        db.insert_schedule_session(&session("s1", &ids[0], &ids[1], 2)).unwrap();
        assert!(db.finish_schedule_session("s1", "cancelled").unwrap());
        assert!(!db.finish_schedule_session("s1", "completed").unwrap());
        assert!(db.list_scheduled_for(&ids[0]).unwrap().is_empty());
    }

    #[test]
    fn self_booking_violates_check() {
        let (db, ids) = db_with_users(&["alice"]);
        assert!(db.insert_schedule_session(&session("s1", &ids[0], &ids[0], 2)).is_err());
    }
}
