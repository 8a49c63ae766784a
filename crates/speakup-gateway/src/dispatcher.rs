use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use speakup_types::events::{GatewayEvent, LikeChange, NotificationChange, PresenceChange};

use crate::bus::EventBus;

const BUS_CAPACITY: usize = 1024;

/// Manages connected clients: one typed bus per entity for fan-out, plus a
/// targeted channel per user for call traffic.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    presence: EventBus<PresenceChange>,
    likes: EventBus<LikeChange>,
    notifications: EventBus<NotificationChange>,

    /// Per-user targeted send channels: user_id -> (conn_id, sender)
    user_channels: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<GatewayEvent>)>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                presence: EventBus::new(BUS_CAPACITY),
                likes: EventBus::new(BUS_CAPACITY),
                notifications: EventBus::new(BUS_CAPACITY),
                user_channels: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn presence(&self) -> &EventBus<PresenceChange> {
        &self.inner.presence
    }

    pub fn likes(&self) -> &EventBus<LikeChange> {
        &self.inner.likes
    }

    pub fn notifications(&self) -> &EventBus<NotificationChange> {
        &self.inner.notifications
    }

    /// Register a per-user targeted channel. A newer connection replaces an
    /// older one. Returns (conn_id, receiver).
    pub async fn register_user_channel(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .user_channels
            .write()
            .await
            .insert(user_id, (conn_id, tx));
        (conn_id, rx)
    }

    /// Unregister a per-user channel, but only if conn_id still owns it.
    /// Returns false when a newer connection has taken over.
    pub async fn unregister_user_channel(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut channels = self.inner.user_channels.write().await;
        match channels.get(&user_id) {
            Some((stored_conn_id, _)) if *stored_conn_id == conn_id => {
                channels.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Send a targeted event to a specific user. Returns false if the user
    /// has no live connection.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) -> bool {
        let channels = self.inner.user_channels.read().await;
        match channels.get(&user_id) {
            Some((_, tx)) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub async fn is_connected(&self, user_id: Uuid) -> bool {
        self.inner.user_channels.read().await.contains_key(&user_id)
    }

    pub async fn connected_count(&self) -> usize {
        self.inner.user_channels.read().await.len()
    }
}
