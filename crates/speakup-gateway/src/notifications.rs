use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use speakup_db::{Database, timestamp};
use speakup_types::events::NotificationChange;
use speakup_types::models::{Notification, NotificationKind};

use crate::blocking;
use crate::dispatcher::Dispatcher;

/// Persist a notification and push the joined row to its recipient.
pub async fn notify(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    recipient: Uuid,
    actor: Uuid,
    kind: NotificationKind,
    session_id: Option<Uuid>,
) -> Result<Notification> {
    let id = Uuid::new_v4();
    let nid = id.to_string();
    let row = blocking(db, move |db| {
        db.insert_notification(
            &nid,
            &recipient.to_string(),
            &actor.to_string(),
            kind.as_str(),
            session_id.map(|s| s.to_string()).as_deref(),
            &timestamp(Utc::now()),
        )?;
        db.get_notification(&nid)?
            .ok_or_else(|| anyhow!("Notification {} vanished after insert", nid))
    })
    .await?;

    let notification = row.into_model()?;
    info!("{} notification {} -> {}", kind.as_str(), id, recipient);
    dispatcher.notifications().publish(NotificationChange::Insert {
        notification: notification.clone(),
    });
    Ok(notification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::db_with_users;

    #[tokio::test]
    async fn published_row_carries_actor() {
        let (db, ids) = db_with_users(&["alice", "bob"]);
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.notifications().subscribe();

        let created = notify(&db, &dispatcher, ids[1], ids[0], NotificationKind::MissedCall, None)
            .await
            .unwrap();
        assert_eq!(created.actor_username, "alice");
        assert!(!created.is_read);

        let change = rx.recv().await.unwrap();
        assert_eq!(change.recipient(), ids[1]);
    }
}
