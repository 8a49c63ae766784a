use std::collections::HashMap;

use uuid::Uuid;

use crate::events::PresenceChange;
use crate::models::PresenceRecord;

/// Client-side copy of presence rows, keyed by user and kept in arrival
/// order. All mutation goes through `apply` / `extend`.
#[derive(Debug, Default)]
pub struct PresenceCache {
    records: HashMap<Uuid, PresenceRecord>,
    order: Vec<Uuid>,
    error: Option<String>,
}

impl PresenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one change-feed event. Returns whether the cache changed.
    pub fn apply(&mut self, change: &PresenceChange) -> bool {
        match change {
            PresenceChange::Insert { record } => self.insert(record.clone()),
            PresenceChange::Update { user_id, patch } => match self.records.get_mut(user_id) {
                Some(record) => {
                    patch.merge_into(record);
                    true
                }
                None => false,
            },
            PresenceChange::Delete { user_id } => {
                if self.records.remove(user_id).is_some() {
                    self.order.retain(|id| id != user_id);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Append fetched rows, skipping users already cached. Returns how many
    /// were added.
    pub fn extend<I>(&mut self, records: I) -> usize
    where
        I: IntoIterator<Item = PresenceRecord>,
    {
        records
            .into_iter()
            .filter(|record| self.insert(record.clone()))
            .count()
    }

    fn insert(&mut self, record: PresenceRecord) -> bool {
        if self.records.contains_key(&record.user_id) {
            return false;
        }
        self.order.push(record.user_id);
        self.records.insert(record.user_id, record);
        true
    }

    pub fn get(&self, user_id: &Uuid) -> Option<&PresenceRecord> {
        self.records.get(user_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &PresenceRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.records.values().filter(|r| r.is_online).count()
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}
