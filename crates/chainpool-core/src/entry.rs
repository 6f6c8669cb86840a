//! Pool-internal wrapper around a connection.
//!
//! State transitions:
//! - `Idle` → `Borrowed`:    handed out by `borrow()`
//! - `Borrowed` → `Idle`:    returned and (optionally) validated
//! - any → `Invalid`:        failed validation, shutdown, eviction, invalidation
//! - `Invalid` → `Destroyed`: `destroy()` has been invoked (terminal)

use std::time::{Duration, Instant};

/// Lifecycle state of a pooled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Idle,
    Borrowed,
    Invalid,
    Destroyed,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Borrowed => write!(f, "borrowed"),
            Self::Invalid => write!(f, "invalid"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// A connection plus the bookkeeping the pool needs to manage it.
pub(crate) struct PooledEntry<C> {
    pub(crate) id: u64,
    pub(crate) conn: C,
    state: EntryState,
    created_at: Instant,
    idle_since: Instant,
    last_validated: Option<Instant>,
    borrow_count: u64,
}

impl<C> PooledEntry<C> {
    /// Wrap a freshly created connection. New entries go straight to a borrower.
    pub(crate) fn new(id: u64, conn: C) -> Self {
        let now = Instant::now();
        Self {
            id,
            conn,
            state: EntryState::Borrowed,
            created_at: now,
            idle_since: now,
            last_validated: None,
            borrow_count: 1,
        }
    }

    pub(crate) fn state(&self) -> EntryState {
        self.state
    }

    pub(crate) fn mark_borrowed(&mut self) {
        self.transition(EntryState::Borrowed);
        self.borrow_count += 1;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.transition(EntryState::Idle);
        self.idle_since = Instant::now();
    }

    pub(crate) fn mark_invalid(&mut self) {
        self.transition(EntryState::Invalid);
    }

    pub(crate) fn mark_destroyed(&mut self) {
        self.transition(EntryState::Destroyed);
    }

    pub(crate) fn record_validation(&mut self) {
        self.last_validated = Some(Instant::now());
    }

    pub(crate) fn last_validated(&self) -> Option<Instant> {
        self.last_validated
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.idle_since.elapsed()
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn borrow_count(&self) -> u64 {
        self.borrow_count
    }

    fn transition(&mut self, to: EntryState) {
        debug_assert!(
            Self::allowed(self.state, to),
            "illegal entry transition {} -> {} (entry {})",
            self.state,
            to,
            self.id
        );
        tracing::trace!(entry_id = self.id, from = %self.state, to = %to, "entry transition");
        self.state = to;
    }

    fn allowed(from: EntryState, to: EntryState) -> bool {
        use EntryState::*;
        match (from, to) {
            (Destroyed, _) => false,
            (Idle, Borrowed) | (Borrowed, Idle) => true,
            (Invalid, Destroyed) => true,
            (_, Invalid) => from != Invalid,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_is_borrowed() {
        let e = PooledEntry::new(1, ());
        assert_eq!(e.state(), EntryState::Borrowed);
        assert_eq!(e.borrow_count(), 1);
        assert!(e.last_validated().is_none());
    }

    #[test]
    fn borrow_return_loop() {
        let mut e = PooledEntry::new(1, ());
        e.mark_idle();
        assert_eq!(e.state(), EntryState::Idle);
        e.mark_borrowed();
        assert_eq!(e.state(), EntryState::Borrowed);
        assert_eq!(e.borrow_count(), 2);
    }

    #[test]
    fn idle_to_destroyed_via_invalid() {
        let mut e = PooledEntry::new(7, ());
        e.mark_idle();
        e.mark_invalid();
        assert_eq!(e.state(), EntryState::Invalid);
        e.mark_destroyed();
        assert_eq!(e.state(), EntryState::Destroyed);
    }

    #[test]
    fn destroyed_is_terminal() {
        use EntryState::*;
        for to in [Idle, Borrowed, Invalid, Destroyed] {
            assert!(!PooledEntry::<()>::allowed(Destroyed, to));
        }
        assert!(!PooledEntry::<()>::allowed(Idle, Destroyed));
        assert!(PooledEntry::<()>::allowed(Invalid, Destroyed));
    }
}
