pub mod bus;
pub mod calls;
pub mod connection;
pub mod directory;
pub mod dispatcher;
pub mod notifications;
pub mod presence;
pub mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};

use speakup_db::Database;

use crate::calls::CallService;
use crate::dispatcher::Dispatcher;
use crate::presence::PresenceStore;

/// Timing knobs for the real-time layer.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ring_timeout: Duration,
    /// How long an accepted call may sit in connecting.
    pub connect_timeout: Duration,
    pub presence_stale_after: Duration,
    pub sweep_interval: Duration,
    pub missed_call_notifications: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            presence_stale_after: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(5),
            missed_call_notifications: true,
        }
    }
}

/// Everything a WebSocket connection or REST handler needs to reach the
/// real-time layer.
#[derive(Clone)]
pub struct Gateway {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub presence: PresenceStore,
    pub calls: CallService,
    pub config: GatewayConfig,
    pub jwt_secret: Arc<str>,
}

impl Gateway {
    pub fn new(db: Arc<Database>, jwt_secret: &str, config: GatewayConfig) -> Self {
        let dispatcher = Dispatcher::new();
        let presence = PresenceStore::new(db.clone(), dispatcher.clone());
        let calls = CallService::new(
            db.clone(),
            dispatcher.clone(),
            presence.clone(),
            config.ring_timeout,
            config.connect_timeout,
            config.missed_call_notifications,
        );
        Self {
            db,
            dispatcher,
            presence,
            calls,
            config,
            jwt_secret: Arc::from(jwt_secret),
        }
    }
}

/// Run a blocking DB closure off the async runtime.
pub async fn blocking<F, T>(db: &Arc<Database>, f: F) -> Result<T>
where
    F: FnOnce(&Database) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| anyhow!("spawn_blocking join error: {}", e))?
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use uuid::Uuid;

    use speakup_db::Database;

    use crate::dispatcher::Dispatcher;
    use crate::presence::PresenceStore;
    use crate::{Gateway, GatewayConfig};

    pub fn db_with_users(names: &[&str]) -> (Arc<Database>, Vec<Uuid>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ids = names
            .iter()
            .map(|name| {
                let id = Uuid::new_v4();
                db.create_user(&id.to_string(), name, "hash").unwrap();
                id
            })
            .collect();
        (db, ids)
    }

    pub fn store_with_users(names: &[&str]) -> (PresenceStore, Vec<Uuid>) {
        let (db, ids) = db_with_users(names);
        (PresenceStore::new(db, Dispatcher::new()), ids)
    }

    pub fn gateway_with_users(names: &[&str], config: GatewayConfig) -> (Gateway, Vec<Uuid>) {
        let (db, ids) = db_with_users(names);
        (Gateway::new(db, "test-secret", config), ids)
    }
}
