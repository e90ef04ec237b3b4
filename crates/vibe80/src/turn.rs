//! Turn Controller: per-worktree state machine serializing
//! `user_message → agent turn → completion/error`, enforcing at most one
//! open turn per worktree. One `TurnController` is created per worktree
//! and owned by that worktree's event-pump task, so all its mutations
//! are already single-writer by construction — no internal locking
//! needed beyond the state field itself.

use tracing::{debug, warn};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Sending,
    Streaming,
    Completed,
    Errored,
}

pub struct TurnController {
    worktree_id: String,
    state: TurnState,
}

impl TurnController {
    pub fn new(worktree_id: impl Into<String>) -> Self {
        Self {
            worktree_id: worktree_id.into(),
            state: TurnState::Idle,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == TurnState::Idle
    }

    /// Accept a `user_message`. Only legal from `Idle`; anything else is a
    /// `busy` error the caller turns into a WS error frame addressed to
    /// the originating socket only.
    pub fn accept_user_message(&mut self) -> Result<()> {
        if self.state != TurnState::Idle {
            return Err(EngineError::Validation("busy".into()));
        }
        self.state = TurnState::Sending;
        debug!(worktree_id = %self.worktree_id, "turn: idle -> sending");
        Ok(())
    }

    /// The agent acknowledged the turn and began streaming.
    pub fn mark_streaming(&mut self) {
        if self.state == TurnState::Sending {
            self.state = TurnState::Streaming;
            debug!(worktree_id = %self.worktree_id, "turn: sending -> streaming");
        }
    }

    /// `interrupt` is accepted in `sending|streaming` as a best-effort
    /// signal to the agent; it does not by itself end the turn.
    pub fn accept_interrupt(&self) -> Result<()> {
        match self.state {
            TurnState::Sending | TurnState::Streaming => Ok(()),
            _ => Err(EngineError::Validation("no active turn to interrupt".into())),
        }
    }

    pub fn complete(&mut self) {
        self.state = TurnState::Idle;
        debug!(worktree_id = %self.worktree_id, "turn: -> completed -> idle");
    }

    pub fn error(&mut self) {
        if self.state != TurnState::Idle {
            warn!(worktree_id = %self.worktree_id, "turn: -> errored -> idle");
        }
        self.state = TurnState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_concurrent_user_messages() {
        let mut turn = TurnController::new("wt1");
        turn.accept_user_message().unwrap();
        let err = turn.accept_user_message().unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn completes_back_to_idle_and_accepts_next() {
        let mut turn = TurnController::new("wt1");
        turn.accept_user_message().unwrap();
        turn.mark_streaming();
        turn.complete();
        assert!(turn.is_idle());
        turn.accept_user_message().unwrap();
    }

    #[test]
    fn interrupt_requires_active_turn() {
        let turn = TurnController::new("wt1");
        assert!(turn.accept_interrupt().is_err());
    }

    #[test]
    fn error_returns_to_idle() {
        let mut turn = TurnController::new("wt1");
        turn.accept_user_message().unwrap();
        turn.error();
        assert!(turn.is_idle());
    }
}
