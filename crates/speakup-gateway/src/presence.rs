use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use speakup_db::{Database, timestamp};
use speakup_types::api::{DirectoryPage, MAX_PAGE_SIZE};
use speakup_types::events::{PresenceChange, PresencePatch};
use speakup_types::models::{CallStatus, PresenceRecord};

use crate::blocking;
use crate::dispatcher::Dispatcher;

/// Single writer for presence rows. Every write is published on the
/// presence bus; a failed write is logged and still published so
/// connected clients keep the optimistic state until the next write.
#[derive(Clone)]
pub struct PresenceStore {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl PresenceStore {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    pub fn subscribe_to_changes(&self) -> broadcast::Receiver<PresenceChange> {
        self.dispatcher.presence().subscribe()
    }

    pub async fn mark_online(&self, user_id: Uuid) -> Result<()> {
        self.set_online(user_id, true).await
    }

    /// Also resets the call projection.
    pub async fn mark_offline(&self, user_id: Uuid) -> Result<()> {
        self.set_online(user_id, false).await
    }

    async fn set_online(&self, user_id: Uuid, is_online: bool) -> Result<()> {
        let now = Utc::now();
        let uid = user_id.to_string();
        let ts = timestamp(now);

        let written = blocking(&self.db, move |db| {
            let inserted = db.upsert_presence(&uid, is_online, &ts)?;
            let row = if inserted { db.get_presence(&uid)? } else { None };
            Ok(row)
        })
        .await;

        let mut patch = PresencePatch {
            is_online: Some(is_online),
            last_seen_at: Some(now),
            updated_at: Some(now),
            ..Default::default()
        };
        if !is_online {
            patch.call_status = Some(CallStatus::Idle);
            patch.peer_id = Some(None);
        }

        match written {
            Ok(Some(row)) => match row.into_model() {
                Ok(record) => {
                    self.dispatcher.presence().publish(PresenceChange::Insert { record });
                }
                Err(e) => {
                    warn!("Corrupt presence row for {}: {}", user_id, e);
                    self.publish_patch(user_id, patch);
                }
            },
            Ok(None) => self.publish_patch(user_id, patch),
            Err(e) => {
                warn!("Presence write failed for {} (online={}): {}", user_id, is_online, e);
                self.publish_patch(user_id, patch);
                return Err(e);
            }
        }

        debug!("{} is now {}", user_id, if is_online { "online" } else { "offline" });
        Ok(())
    }

    /// Heartbeat. Not published.
    pub async fn touch(&self, user_id: Uuid) -> Result<()> {
        let uid = user_id.to_string();
        let ts = timestamp(Utc::now());
        blocking(&self.db, move |db| db.touch_presence(&uid, &ts)).await
    }

    pub async fn set_call_status(
        &self,
        user_id: Uuid,
        status: CallStatus,
        peer_id: Option<String>,
    ) {
        let now = Utc::now();
        let peer_id = if status == CallStatus::Idle { None } else { peer_id };

        let uid = user_id.to_string();
        let ts = timestamp(now);
        let peer = peer_id.clone();
        let written = blocking(&self.db, move |db| {
            db.set_call_status(&uid, status.as_str(), peer.as_deref(), &ts)
        })
        .await;
        if let Err(e) = written {
            warn!("Call status write failed for {} ({}): {}", user_id, status.as_str(), e);
        }

        self.publish_patch(
            user_id,
            PresencePatch {
                call_status: Some(status),
                peer_id: Some(peer_id),
                updated_at: Some(now),
                ..Default::default()
            },
        );
    }

    pub async fn set_room(&self, user_id: Uuid, room_code: Option<String>) {
        let now = Utc::now();
        let uid = user_id.to_string();
        let ts = timestamp(now);
        let code = room_code.clone();
        let written =
            blocking(&self.db, move |db| db.set_presence_room(&uid, code.as_deref(), &ts)).await;
        if let Err(e) = written {
            warn!("Room presence write failed for {}: {}", user_id, e);
        }

        self.publish_patch(
            user_id,
            PresencePatch {
                in_room: Some(room_code.is_some()),
                room_code: Some(room_code),
                updated_at: Some(now),
                ..Default::default()
            },
        );
    }

    pub async fn get(&self, user_id: Uuid) -> Result<Option<PresenceRecord>> {
        let uid = user_id.to_string();
        let row = blocking(&self.db, move |db| db.get_presence(&uid)).await?;
        row.map(|r| r.into_model()).transpose()
    }

    /// Directory page ordered online-first, then most recently updated.
    pub async fn fetch_page(&self, page_index: u32, page_size: u32) -> Result<DirectoryPage> {
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let offset = page_index as u64 * page_size as u64;

        let rows = blocking(&self.db, move |db| db.fetch_presence_page(offset, page_size + 1)).await?;
        let has_more = rows.len() > page_size as usize;

        let records = rows
            .into_iter()
            .take(page_size as usize)
            .filter_map(|row| {
                let user_id = row.user_id.clone();
                row.into_model()
                    .map_err(|e| warn!("Skipping corrupt presence row {}: {}", user_id, e))
                    .ok()
            })
            .collect();

        Ok(DirectoryPage { records, has_more })
    }

    /// Users marked online whose last heartbeat is older than `cutoff`.
    pub async fn stale_online(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let cutoff = timestamp(cutoff);
        let ids = blocking(&self.db, move |db| db.stale_online_presence(&cutoff)).await?;
        Ok(ids.into_iter().filter_map(|id| id.parse().ok()).collect())
    }

    /// Boot-time reset; nothing is published because nobody is connected.
    pub async fn reset_all(&self) -> Result<usize> {
        let ts = timestamp(Utc::now());
        blocking(&self.db, move |db| db.mark_all_offline(&ts)).await
    }

    fn publish_patch(&self, user_id: Uuid, patch: PresencePatch) {
        self.dispatcher
            .presence()
            .publish(PresenceChange::Update { user_id, patch });
    }
}
