//! Serverless Backstop Rules
//!
//! The narrow enforcement the hosted triggers apply on every location
//! write: a runner who leaves the play area becomes an oni, and a runner
//! within capture radius of an oni becomes an oni. No down-counter and
//! no reveal window. Clients do not depend on it; it reads and writes
//! the same documents they do.

use tracing::info;

use crate::core::geo::distance_meters;
use crate::game::state::{GameRules, GameSnapshot, GameStatus, Player, PlayerStatus, Role};
use crate::network::channel::{ChannelError, DocPath, FieldUpdates, RealtimeChannel};

/// Why the backstop acted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackstopReason {
    /// Runner left the play area
    OutOfBounds,
    /// Runner was within capture radius of this oni
    CaughtBy(String),
}

/// A correction the backstop writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackstopAction {
    /// Turn a runner into an oni
    ConvertToOni {
        /// Runner uid
        uid: String,
        /// Trigger
        reason: BackstopReason,
    },
}

/// Evaluate the rules after `uid` wrote its location.
pub fn evaluate_location_write(
    snapshot: &GameSnapshot,
    uid: &str,
    rules: &GameRules,
) -> Vec<BackstopAction> {
    let mut actions = Vec::new();
    if snapshot.status() != Some(GameStatus::Running) {
        return actions;
    }
    let writer = snapshot.player(uid).filter(|p| p.active);
    let (Some(writer), Some(here)) = (writer, snapshot.position(uid)) else {
        return actions;
    };

    let convert = |runner: &Player, reason| BackstopAction::ConvertToOni {
        uid: runner.uid.clone(),
        reason,
    };

    match writer.role {
        Role::Runner => {
            let outside = snapshot
                .game
                .as_ref()
                .and_then(|g| g.bounds.as_ref())
                .is_some_and(|area| !area.contains(here));
            if outside {
                actions.push(convert(writer, BackstopReason::OutOfBounds));
                return actions;
            }
            if writer.status() != PlayerStatus::Active {
                return actions;
            }
            let catcher = snapshot
                .active_players()
                .filter(|p| p.is_oni())
                .find(|oni| {
                    snapshot
                        .position(&oni.uid)
                        .is_some_and(|pos| distance_meters(here, pos) <= rules.capture_radius_m)
                });
            if let Some(oni) = catcher {
                actions.push(convert(writer, BackstopReason::CaughtBy(oni.uid.clone())));
            }
        }
        Role::Oni => {
            let active = snapshot
                .runners()
                .filter(|r| r.status() == PlayerStatus::Active);
            for runner in active {
                let caught = snapshot
                    .position(&runner.uid)
                    .is_some_and(|pos| distance_meters(here, pos) <= rules.capture_radius_m);
                if caught {
                    actions.push(convert(runner, BackstopReason::CaughtBy(writer.uid.clone())));
                }
            }
        }
    }
    actions
}

/// Write the actions. Returns how many were applied.
pub async fn apply_backstop(
    channel: &dyn RealtimeChannel,
    game_id: &str,
    actions: &[BackstopAction],
) -> Result<usize, ChannelError> {
    for action in actions {
        let BackstopAction::ConvertToOni { uid, reason } = action;
        channel
            .write(&DocPath::player(game_id, uid), FieldUpdates::new().set("role", "oni"))
            .await?;
        info!("Backstop converted {} to oni ({:?})", uid, reason);
    }
    Ok(actions.len())
}
