//! Game action errors.

use thiserror::Error;

use crate::game::state::GameStatus;
use crate::network::channel::ChannelError;

/// Errors surfaced to user-initiated actions.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GameError {
    /// Nothing in range, or the target no longer qualifies.
    #[error("not eligible: {0}")]
    NotEligible(String),

    /// Action reserved for the game owner.
    #[error("only the game owner can {0}")]
    NotOwner(&'static str),

    /// Status change that would move the game backwards or skip a step.
    #[error("cannot move game from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current status
        from: GameStatus,
        /// Requested status
        to: GameStatus,
    },

    /// Game or player document is gone; the session cannot continue.
    #[error("{0} not found")]
    NotFound(String),

    /// Session has no identity yet.
    #[error("session not started")]
    NotStarted,

    /// The write did not reach the store.
    #[error("write failed: {0}")]
    Channel(#[from] ChannelError),
}

/// Result alias for game actions.
pub type GameResult<T> = Result<T, GameError>;
