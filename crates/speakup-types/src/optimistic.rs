use serde::{Deserialize, Serialize};

/// Result of every mutating call a client can make optimistically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MutationOutcome {
    Applied,
    Rejected { reason: String },
}

impl MutationOutcome {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// A value with at most one unconfirmed local change on top of the last
/// confirmed one.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimistic<T> {
    confirmed: T,
    pending: Option<T>,
}

impl<T: Clone> Optimistic<T> {
    pub fn new(confirmed: T) -> Self {
        Self {
            confirmed,
            pending: None,
        }
    }

    /// What the UI should show right now.
    pub fn current(&self) -> &T {
        self.pending.as_ref().unwrap_or(&self.confirmed)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Show `value` before the server has answered.
    pub fn apply(&mut self, value: T) {
        self.pending = Some(value);
    }

    /// Keep the pending value on `Applied`, revert on `Rejected`.
    pub fn settle(&mut self, outcome: &MutationOutcome) -> &T {
        if let Some(pending) = self.pending.take() {
            if outcome.is_applied() {
                self.confirmed = pending;
            }
        }
        &self.confirmed
    }

    /// A change-feed echo is authoritative and drops any pending value.
    pub fn reconcile(&mut self, value: T) {
        self.confirmed = value;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct LikeState {
        has_liked: bool,
        total: u64,
    }

    #[test]
    fn rejected_mutation_reverts() {
        let mut state = Optimistic::new(LikeState {
            has_liked: false,
            total: 3,
        });
        state.apply(LikeState {
            has_liked: true,
            total: 4,
        });
        assert_eq!(state.current().total, 4);

        let shown = state.settle(&MutationOutcome::rejected("not in room")).clone();
        assert_eq!(shown, LikeState { has_liked: false, total: 3 });
        assert!(!state.is_pending());
    }

    #[test]
    fn applied_mutation_sticks() {
        let mut state = Optimistic::new(1u64);
        state.apply(2);
        state.settle(&MutationOutcome::Applied);
        assert_eq!(*state.current(), 2);
    }

    #[test]
    fn echo_overrides_pending() {
        let mut state = Optimistic::new(1u64);
        state.apply(2);
        state.reconcile(5);
        assert_eq!(*state.current(), 5);
        state.settle(&MutationOutcome::rejected("late"));
        assert_eq!(*state.current(), 5);
    }
}
