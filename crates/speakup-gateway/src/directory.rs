use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use speakup_types::api::DEFAULT_PAGE_SIZE;
use speakup_types::cache::PresenceCache;
use speakup_types::events::PresenceChange;

use crate::presence::PresenceStore;

/// Paginated partner list kept current by the presence feed.
pub struct DirectoryView {
    store: PresenceStore,
    page_size: u32,
    next_page: u32,
    has_more: bool,
    cache: PresenceCache,
}

impl DirectoryView {
    pub fn new(store: PresenceStore) -> Self {
        Self::with_page_size(store, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(store: PresenceStore, page_size: u32) -> Self {
        Self {
            store,
            page_size,
            next_page: 0,
            has_more: true,
            cache: PresenceCache::new(),
        }
    }

    pub fn cache(&self) -> &PresenceCache {
        &self.cache
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Fetch the next page and append users not already listed. Returns how
    /// many were added; a failed fetch adds nothing and keeps the cursor.
    pub async fn load_next_page(&mut self) -> usize {
        if !self.has_more {
            return 0;
        }

        match self.store.fetch_page(self.next_page, self.page_size).await {
            Ok(page) => {
                self.next_page += 1;
                self.has_more = page.has_more;
                self.cache.clear_error();
                let added = self.cache.extend(page.records);
                debug!("Directory page {} added {} users", self.next_page, added);
                added
            }
            Err(e) => {
                warn!("Directory fetch failed: {}", e);
                self.cache.set_error(e.to_string());
                0
            }
        }
    }

    pub fn apply(&mut self, change: &PresenceChange) -> bool {
        self.cache.apply(change)
    }

    /// Wait for the next presence event and merge it. Returns `false` once
    /// the feed is closed.
    pub async fn next_change(&mut self, rx: &mut broadcast::Receiver<PresenceChange>) -> bool {
        match rx.recv().await {
            Ok(change) => {
                self.apply(&change);
                true
            }
            Err(RecvError::Lagged(n)) => {
                warn!("Directory view lagged, skipped {} presence events", n);
                self.cache
                    .set_error(format!("missed {} presence updates", n));
                true
            }
            Err(RecvError::Closed) => {
                self.cache.set_error("presence feed closed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::store_with_users;

    #[tokio::test]
    async fn pages_append_without_duplicates() {
        let names: Vec<String> = (0..5).map(|i| format!("user{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let (store, ids) = store_with_users(&refs);
        for id in &ids {
            store.mark_online(*id).await.unwrap();
        }

        let mut view = DirectoryView::with_page_size(store, 2);
        assert_eq!(view.load_next_page().await, 2);
        assert_eq!(view.load_next_page().await, 2);
        assert_eq!(view.load_next_page().await, 1);
        assert!(!view.has_more());
        assert_eq!(view.load_next_page().await, 0);
        assert_eq!(view.cache().len(), 5);
    }

    #[tokio::test]
    async fn live_changes_merge_into_loaded_rows() {
        let (store, ids) = store_with_users(&["alice", "bob"]);
        store.mark_online(ids[0]).await.unwrap();
        store.mark_online(ids[1]).await.unwrap();

        let mut rx = store.subscribe_to_changes();
        let mut view = DirectoryView::new(store.clone());
        view.load_next_page().await;

        store.mark_offline(ids[1]).await.unwrap();
        assert!(view.next_change(&mut rx).await);

        assert_eq!(view.cache().online_count(), 1);
        assert!(!view.cache().get(&ids[1]).unwrap().is_online);
    }

    #[tokio::test]
    async fn lagging_sets_the_error_flag() {
        let (store, ids) = store_with_users(&["alice"]);
        let mut view = DirectoryView::new(store.clone());
        let (tx, mut rx) = broadcast::channel(1);
        for _ in 0..3 {
            tx.send(PresenceChange::Delete { user_id: ids[0] }).unwrap();
        }

        assert!(view.next_change(&mut rx).await);
        assert!(view.cache().error().is_some());
    }
}
