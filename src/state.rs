//! Proxy State Machine (C6): NORMAL / DEGRADED / SYNCING / UNAVAILABLE with
//! an explicit legal-transition table. Every transition is logged with its
//! reason; illegal transitions are rejected rather than silently clamped.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseState {
    Normal,
    Degraded,
    Syncing,
    Unavailable,
}

impl DatabaseState {
    fn can_transition_to(self, next: DatabaseState) -> bool {
        use DatabaseState::*;
        matches!(
            (self, next),
            (Normal, Degraded)
                | (Normal, Unavailable)
                | (Degraded, Syncing)
                | (Degraded, Unavailable)
                | (Degraded, Normal)
                | (Syncing, Normal)
                | (Syncing, Degraded)
                | (Syncing, Unavailable)
                | (Unavailable, Degraded)
                | (Unavailable, Normal)
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal state transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: DatabaseState,
    pub to: DatabaseState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: DatabaseState,
    pub to: DatabaseState,
    pub reason: String,
    pub timestamp_ms: i64,
}

pub struct DatabaseStateMachine {
    state: DatabaseState,
    history: Vec<Transition>,
    max_history: usize,
}

impl DatabaseStateMachine {
    pub fn new(initial: DatabaseState) -> Self {
        Self { state: initial, history: Vec::new(), max_history: 200 }
    }

    pub fn state(&self) -> DatabaseState {
        self.state
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn transition_to(&mut self, next: DatabaseState, reason: &str) -> Result<(), TransitionError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(TransitionError { from: self.state, to: next });
        }

        tracing::info!(from = ?self.state, to = ?next, reason, "database state transition");

        self.history.push(Transition {
            from: self.state,
            to: next,
            reason: reason.to_string(),
            timestamp_ms: crate::types::now_ms() as i64,
        });
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        self.state = next;
        Ok(())
    }

    pub fn degraded(&mut self, reason: &str) -> Result<(), TransitionError> {
        self.transition_to(DatabaseState::Degraded, reason)
    }

    pub fn unavailable(&mut self, reason: &str) -> Result<(), TransitionError> {
        self.transition_to(DatabaseState::Unavailable, reason)
    }

    pub fn start_sync(&mut self, reason: &str) -> Result<(), TransitionError> {
        self.transition_to(DatabaseState::Syncing, reason)
    }

    pub fn sync_failed(&mut self, reason: &str) -> Result<(), TransitionError> {
        self.transition_to(DatabaseState::Degraded, reason)
    }

    pub fn recover(&mut self, reason: &str) -> Result<(), TransitionError> {
        self.transition_to(DatabaseState::Normal, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DatabaseState::*;

    #[test]
    fn normal_to_syncing_directly_is_illegal() {
        let mut sm = DatabaseStateMachine::new(Normal);
        assert!(sm.transition_to(Syncing, "bad").is_err());
        assert_eq!(sm.state(), Normal);
    }

    #[test]
    fn full_recovery_cycle_is_legal() {
        let mut sm = DatabaseStateMachine::new(Normal);
        sm.degraded("primary down").unwrap();
        sm.start_sync("primary recovered").unwrap();
        sm.recover("sync complete").unwrap();
        assert_eq!(sm.state(), Normal);
        assert_eq!(sm.history().len(), 3);
    }

    #[test]
    fn same_state_transition_is_a_no_op() {
        let mut sm = DatabaseStateMachine::new(Normal);
        sm.transition_to(Normal, "noop").unwrap();
        assert!(sm.history().is_empty());
    }

    #[test]
    fn syncing_can_fail_back_to_degraded() {
        let mut sm = DatabaseStateMachine::new(Degraded);
        sm.start_sync("recovered").unwrap();
        sm.sync_failed("fencing lost mid-sync").unwrap();
        assert_eq!(sm.state(), Degraded);
    }

    #[test]
    fn unavailable_can_only_exit_to_degraded_or_normal() {
        let mut sm = DatabaseStateMachine::new(Unavailable);
        assert!(sm.transition_to(Syncing, "nope").is_err());
        sm.transition_to(Degraded, "fallback recovered").unwrap();
        assert_eq!(sm.state(), Degraded);
    }
}
