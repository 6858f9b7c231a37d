//! Game Logic Module
//!
//! Rules evaluated redundantly on every client. Pure functions over a
//! snapshot wherever possible; the write-back paths take the channel
//! explicitly.
//!
//! ## Module Structure
//!
//! - `state`: Document model and the per-client snapshot
//! - `events`: Alert records
//! - `proximity`: Visibility and eligibility evaluation
//! - `capture`: Capture / rescue / clear transitions and their writes
//! - `lifecycle`: Status transitions, countdown reconciliation, win checks
//! - `pins`: Objective pin layout and reconciliation
//! - `backstop`: Narrow server-side enforcement rules

pub mod backstop;
pub mod capture;
pub mod events;
pub mod lifecycle;
pub mod pins;
pub mod proximity;
pub mod state;

// Re-export key types
pub use capture::{CaptureReport, CaptureRescueMachine, ClearReport};
pub use events::{Alert, AlertKind};
pub use lifecycle::{CountdownReconciler, CountdownTimer, LifecycleController, LifecycleSignals};
pub use proximity::{evaluate, ProximityMemo, ProximityView, Target};
pub use state::{
    EndReason, Game, GameRules, GameSnapshot, GameStatus, LoadState, Location, ObjectivePin,
    PinStatus, Player, PlayerStatus, Role,
};
