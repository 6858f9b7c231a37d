//! Proximity Engine
//!
//! Pure evaluation of one client's view of the game: who is visible,
//! and which capture, rescue or objective-clear target (if any) is in
//! reach. Recomputed from the snapshot on every change; it owns no
//! timers and performs no writes. Acting on a target is the caller's job.

use std::collections::BTreeSet;

use crate::config::GameConfig;
use crate::core::clock::Millis;
use crate::core::geo::{distance_meters, GeoPoint};
use crate::game::state::{
    GameRules, GameSnapshot, GameStatus, ObjectivePin, Player, PlayerStatus, Role,
};

/// An eligible target and how far away it is.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    /// Player uid or pin id
    pub id: String,
    /// Distance from self
    pub distance_m: f64,
}

/// Everything the render layer needs from one evaluation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProximityView {
    /// Other players drawn on this client's map
    pub visible_players: BTreeSet<String>,
    /// Pins drawn on this client's map
    pub visible_pins: BTreeSet<String>,
    /// Runner the oni can capture right now
    pub capture_target: Option<Target>,
    /// Downed runner this runner can rescue right now
    pub rescue_target: Option<Target>,
    /// Pin this runner can clear right now
    pub clear_target: Option<Target>,
    /// Self position lies outside the play area
    pub self_out_of_bounds: bool,
}

/// Whether `viewer` at `viewer_pos` sees `other` at `other_pos`.
///
/// Same-role players always see each other. Across roles, visibility is
/// distance-limited, and a live reveal window overrides distance.
pub fn can_see(
    viewer: &Player,
    viewer_pos: Option<GeoPoint>,
    other: &Player,
    other_pos: Option<GeoPoint>,
    rules: &GameRules,
    now: Millis,
) -> bool {
    if viewer.role == other.role {
        return true;
    }
    if other.is_revealed(now) {
        return true;
    }
    let distance = match (viewer_pos, other_pos) {
        (Some(a), Some(b)) => distance_meters(a, b),
        _ => return false,
    };
    match viewer.role {
        Role::Oni => {
            other.status() != PlayerStatus::Eliminated
                && distance <= rules.killer_detect_runner_radius_m
        }
        Role::Runner => distance <= rules.runner_see_killer_radius_m,
    }
}

/// Pin visibility radius for a role.
fn pin_radius(role: Role, rules: &GameRules) -> f64 {
    match role {
        Role::Runner => rules.runner_see_generator_radius_m,
        Role::Oni => rules.killer_see_generator_radius_m,
    }
}

/// Keep the nearer candidate; on equal distance the earlier one stays.
fn nearer(best: Option<Target>, id: &str, distance_m: f64) -> Option<Target> {
    match best {
        Some(t) if t.distance_m <= distance_m => Some(t),
        _ => Some(Target {
            id: id.to_string(),
            distance_m,
        }),
    }
}

/// Distance to `target` if `me` may capture it now. Oni only; the target
/// must be an active runner inside the capture radius and, when
/// enforced, outside its cooldown window.
pub fn capture_distance(
    snapshot: &GameSnapshot,
    me: &Player,
    here: GeoPoint,
    target: &Player,
    rules: &GameRules,
    now: Millis,
) -> Option<f64> {
    if !me.is_oni() || !target.is_runner() || !target.active || target.uid == me.uid {
        return None;
    }
    let cooling = rules.enforce_cooldown && target.in_cooldown(now);
    if target.status() != PlayerStatus::Active || cooling {
        return None;
    }
    let d = distance_meters(here, snapshot.position(&target.uid)?);
    (d <= rules.capture_radius_m).then_some(d)
}

/// Distance to `target` if `me` may rescue it now. Both must be runners,
/// `me` active and the target downed.
pub fn rescue_distance(
    snapshot: &GameSnapshot,
    me: &Player,
    here: GeoPoint,
    target: &Player,
    rules: &GameRules,
    now: Millis,
) -> Option<f64> {
    if !me.is_runner() || me.status() != PlayerStatus::Active {
        return None;
    }
    if !target.is_runner() || !target.active || target.uid == me.uid {
        return None;
    }
    let cooling = rules.enforce_cooldown && target.in_cooldown(now);
    if target.status() != PlayerStatus::Downed || cooling {
        return None;
    }
    let d = distance_meters(here, snapshot.position(&target.uid)?);
    (d <= rules.rescue_radius_m).then_some(d)
}

/// Distance to `pin` if `me` may clear it now.
pub fn clear_distance(
    me: &Player,
    here: GeoPoint,
    pin: &ObjectivePin,
    rules: &GameRules,
) -> Option<f64> {
    if !me.is_runner() || me.status() != PlayerStatus::Active || pin.is_cleared() {
        return None;
    }
    let d = distance_meters(here, pin.point());
    (d <= rules.capture_radius_m).then_some(d)
}

/// Nearest capturable runner.
pub fn capture_target(
    snapshot: &GameSnapshot,
    me: &Player,
    here: GeoPoint,
    rules: &GameRules,
    now: Millis,
) -> Option<Target> {
    snapshot
        .runners()
        .filter_map(|p| capture_distance(snapshot, me, here, p, rules, now).map(|d| (p, d)))
        .fold(None, |best, (p, d)| nearer(best, &p.uid, d))
}

/// Nearest rescuable runner.
pub fn rescue_target(
    snapshot: &GameSnapshot,
    me: &Player,
    here: GeoPoint,
    rules: &GameRules,
    now: Millis,
) -> Option<Target> {
    snapshot
        .runners()
        .filter_map(|p| rescue_distance(snapshot, me, here, p, rules, now).map(|d| (p, d)))
        .fold(None, |best, (p, d)| nearer(best, &p.uid, d))
}

/// Nearest clearable pin.
pub fn clear_target(
    snapshot: &GameSnapshot,
    me: &Player,
    here: GeoPoint,
    rules: &GameRules,
) -> Option<Target> {
    snapshot
        .pins
        .values()
        .filter_map(|pin| clear_distance(me, here, pin, rules).map(|d| (pin, d)))
        .fold(None, |best, (pin, d)| nearer(best, &pin.id, d))
}

/// Evaluate the full view for `self_uid` at `now`.
pub fn evaluate(
    snapshot: &GameSnapshot,
    self_uid: &str,
    now: Millis,
    config: &GameConfig,
) -> ProximityView {
    let mut view = ProximityView::default();
    let Some(me) = snapshot.player(self_uid).filter(|p| p.active) else {
        return view;
    };
    let rules = snapshot.rules(config);
    let here = snapshot.position(self_uid);

    view.visible_players = snapshot
        .active_players()
        .filter(|other| other.uid != me.uid)
        .filter(|other| can_see(me, here, other, snapshot.position(&other.uid), &rules, now))
        .map(|other| other.uid.clone())
        .collect();

    let Some(here) = here else {
        return view;
    };

    view.self_out_of_bounds = snapshot
        .game
        .as_ref()
        .and_then(|g| g.bounds.as_ref())
        .is_some_and(|area| !area.contains(here));

    if snapshot.status() != Some(GameStatus::Running) {
        return view;
    }

    let radius = pin_radius(me.role, &rules);
    view.visible_pins = snapshot
        .pins
        .values()
        .filter(|pin| distance_meters(here, pin.point()) <= radius)
        .map(|pin| pin.id.clone())
        .collect();

    view.capture_target = capture_target(snapshot, me, here, &rules, now);
    view.rescue_target = rescue_target(snapshot, me, here, &rules, now);
    view.clear_target = clear_target(snapshot, me, here, &rules);
    view
}

/// Memoized `evaluate`: recomputes only when the store revision, the
/// identity or the wall-clock second changes.
#[derive(Debug, Default)]
pub struct ProximityMemo {
    key: Option<(u64, String, Millis)>,
    view: ProximityView,
}

impl ProximityMemo {
    /// Create an empty memo.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached view, recomputed if any input changed.
    pub fn view(
        &mut self,
        revision: u64,
        snapshot: &GameSnapshot,
        self_uid: &str,
        now: Millis,
        config: &GameConfig,
    ) -> &ProximityView {
        let key = (revision, self_uid.to_string(), now.div_euclid(1000));
        if self.key.as_ref() != Some(&key) {
            self.view = evaluate(snapshot, self_uid, now, config);
            self.key = Some(key);
        }
        &self.view
    }

    /// Whether the last `view` call recomputed with `revision`.
    pub fn is_current(&self, revision: u64) -> bool {
        self.key.as_ref().is_some_and(|(r, _, _)| *r == revision)
    }
}
