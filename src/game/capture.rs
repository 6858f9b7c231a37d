//! Capture / Rescue State Machine
//!
//! Runner status automaton and its write-back:
//!
//! ```text
//!   active --capture--> downed --rescue--> active
//!                         |
//!                         +--capture (downs >= max)--> eliminated
//! ```
//!
//! The acting client writes the target's document directly. There is
//! no compare-and-swap: two clients acting on the same target in the
//! same instant both land and the later write wins. The attacker's own
//! counters go in a second, independent write.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::GameConfig;
use crate::core::clock::{secs_to_ms, Clock, Millis};
use crate::core::geo::GeoPoint;
use crate::error::{GameError, GameResult};
use crate::game::events::Alert;
use crate::game::lifecycle::{all_pins_cleared, all_runners_neutralized, write_game_end};
use crate::game::proximity::{capture_distance, clear_distance, rescue_distance};
use crate::game::state::{
    EndReason, GameRules, GameSnapshot, GameStatus, PinStatus, Player, PlayerStatus,
};
use crate::network::channel::{DocPath, FieldUpdates, RealtimeChannel};

// =============================================================================
// PURE TRANSITIONS
// =============================================================================

/// Victim state after a capture.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureTransition {
    /// New down count
    pub downs: u32,
    /// New status
    pub state: PlayerStatus,
    /// Reveal window end
    pub reveal_until: Millis,
    /// Cooldown end
    pub cooldown_until: Millis,
}

impl CaptureTransition {
    /// Whether the capture eliminated the victim.
    pub fn eliminated(&self) -> bool {
        self.state == PlayerStatus::Eliminated
    }

    /// Partial update for the victim's document.
    ///
    /// `downs` is written as a value computed from the local snapshot, not
    /// an increment, so a racing double capture counts once.
    pub fn to_updates(&self) -> Result<FieldUpdates, crate::network::ChannelError> {
        Ok(FieldUpdates::new()
            .set("downs", self.downs)
            .set_json("state", &self.state)?
            .server_timestamp("lastDownAt")
            .set("lastRevealUntil", self.reveal_until)
            .set("cooldownUntil", self.cooldown_until)
            .increment("stats.capturedTimes", 1))
    }

    /// Apply to a local copy of the victim.
    pub fn apply(&self, victim: &mut Player) {
        victim.downs = self.downs;
        victim.state = Some(self.state);
        victim.last_reveal_until = Some(self.reveal_until);
        victim.cooldown_until = Some(self.cooldown_until);
    }
}

/// Compute the capture of `victim` at `now`.
pub fn capture_transition(victim: &Player, now: Millis, rules: &GameRules) -> CaptureTransition {
    let downs = victim.downs.saturating_add(1).min(rules.max_downs).max(victim.downs);
    let state = if downs >= rules.max_downs {
        PlayerStatus::Eliminated
    } else {
        PlayerStatus::Downed
    };
    CaptureTransition {
        downs,
        state,
        reveal_until: now + secs_to_ms(rules.reveal_duration_sec),
        cooldown_until: now + secs_to_ms(rules.rescue_cooldown_sec),
    }
}

/// Attacker's own write after a capture: counter plus the mutual reveal.
pub fn attacker_updates(now: Millis, rules: &GameRules) -> FieldUpdates {
    FieldUpdates::new()
        .increment("stats.captures", 1)
        .set("lastRevealUntil", now + secs_to_ms(rules.reveal_duration_sec))
}

/// Rescued runner's write. `downs` is left untouched.
pub fn rescue_updates(now: Millis, rules: &GameRules) -> FieldUpdates {
    FieldUpdates::new()
        .set("state", "active")
        .server_timestamp("lastRescuedAt")
        .set("cooldownUntil", now + secs_to_ms(rules.rescue_cooldown_sec))
        .delete("lastRevealUntil")
}

/// Pin write for a clear by `uid`. Both status representations are set.
pub fn clear_updates(uid: &str) -> Result<FieldUpdates, crate::network::ChannelError> {
    Ok(FieldUpdates::new()
        .set_json("status", &PinStatus::Cleared)?
        .set("cleared", true)
        .set("clearedBy", uid)
        .server_timestamp("clearedAt"))
}

// =============================================================================
// MACHINE
// =============================================================================

/// Result of a successful capture.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureReport {
    /// Victim uid
    pub victim_uid: String,
    /// Victim state written
    pub transition: CaptureTransition,
    /// This capture ended the game
    pub game_ended: bool,
}

/// Result of a successful pin clear.
#[derive(Clone, Debug, PartialEq)]
pub struct ClearReport {
    /// Pin id
    pub pin_id: String,
    /// Uncleared pins left
    pub remaining: u32,
    /// This clear ended the game
    pub game_ended: bool,
}

/// Issues capture, rescue and clear writes for one client.
pub struct CaptureRescueMachine {
    channel: Arc<dyn RealtimeChannel>,
    clock: Arc<dyn Clock>,
    config: GameConfig,
    game_id: String,
}

impl CaptureRescueMachine {
    /// Create a machine for `game_id`.
    pub fn new(
        channel: Arc<dyn RealtimeChannel>,
        clock: Arc<dyn Clock>,
        config: GameConfig,
        game_id: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            clock,
            config,
            game_id: game_id.into(),
        }
    }

    /// Running game plus the actor's record and position.
    fn actor<'a>(
        &self,
        snapshot: &'a GameSnapshot,
        uid: &str,
    ) -> GameResult<(&'a Player, GeoPoint)> {
        if snapshot.game.is_none() {
            return Err(GameError::NotFound(format!("game {}", self.game_id)));
        }
        if snapshot.status() != Some(GameStatus::Running) {
            return Err(GameError::NotEligible("game is not running".into()));
        }
        let me = snapshot
            .player(uid)
            .filter(|p| p.active)
            .ok_or_else(|| GameError::NotFound(format!("player {uid}")))?;
        let here = snapshot
            .position(uid)
            .ok_or_else(|| GameError::NotEligible("no location yet".into()))?;
        Ok((me, here))
    }

    async fn send_alert(&self, alert: Alert) {
        let result = match alert.to_updates() {
            Ok(updates) => {
                let path = DocPath::alert(&self.game_id, &alert.id);
                self.channel.write(&path, updates).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(game_id = %self.game_id, to = %alert.to_uid, error = %e, "alert not written");
        }
    }

    async fn end_if(&self, won: bool, snapshot: &GameSnapshot, reason: EndReason) -> bool {
        if !won {
            return false;
        }
        match write_game_end(self.channel.as_ref(), &self.game_id, snapshot, reason).await {
            Ok(ended) => ended,
            Err(e) => {
                warn!(game_id = %self.game_id, error = %e, "win write failed");
                false
            }
        }
    }

    /// Oni `attacker_uid` captures runner `victim_uid`.
    ///
    /// Fails only when the victim write fails or the capture is not
    /// eligible. The attacker stats write, the alert and the win check
    /// are best-effort.
    #[instrument(skip(self, snapshot), fields(game_id = %self.game_id))]
    pub async fn capture(
        &self,
        snapshot: &GameSnapshot,
        attacker_uid: &str,
        victim_uid: &str,
    ) -> GameResult<CaptureReport> {
        let now = self.clock.now_ms();
        let rules = snapshot.rules(&self.config);
        let (me, here) = self.actor(snapshot, attacker_uid)?;
        let victim = snapshot
            .player(victim_uid)
            .ok_or_else(|| GameError::NotFound(format!("player {victim_uid}")))?;
        if capture_distance(snapshot, me, here, victim, &rules, now).is_none() {
            return Err(GameError::NotEligible(format!("cannot capture {victim_uid}")));
        }

        let transition = capture_transition(victim, now, &rules);
        self.channel
            .write(&DocPath::player(&self.game_id, victim_uid), transition.to_updates()?)
            .await?;
        info!(
            "{} captured {} (downs {}, {:?})",
            attacker_uid, victim_uid, transition.downs, transition.state
        );

        if let Err(e) = self
            .channel
            .write(&DocPath::player(&self.game_id, attacker_uid), attacker_updates(now, &rules))
            .await
        {
            warn!(uid = attacker_uid, error = %e, "attacker stats write failed");
        }

        let eliminated = transition.eliminated();
        self.send_alert(Alert::captured(victim_uid, attacker_uid, transition.downs, eliminated))
            .await;

        let mut projected = snapshot.clone();
        if let Some(v) = projected.players.get_mut(victim_uid) {
            transition.apply(v);
        }
        let game_ended = self
            .end_if(all_runners_neutralized(&projected), &projected, EndReason::RunnersNeutralized)
            .await;

        Ok(CaptureReport {
            victim_uid: victim_uid.to_string(),
            transition,
            game_ended,
        })
    }

    /// Runner `rescuer_uid` rescues downed runner `target_uid`.
    #[instrument(skip(self, snapshot), fields(game_id = %self.game_id))]
    pub async fn rescue(
        &self,
        snapshot: &GameSnapshot,
        rescuer_uid: &str,
        target_uid: &str,
    ) -> GameResult<()> {
        let now = self.clock.now_ms();
        let rules = snapshot.rules(&self.config);
        let (me, here) = self.actor(snapshot, rescuer_uid)?;
        let target = snapshot
            .player(target_uid)
            .ok_or_else(|| GameError::NotFound(format!("player {target_uid}")))?;
        if rescue_distance(snapshot, me, here, target, &rules, now).is_none() {
            return Err(GameError::NotEligible(format!("cannot rescue {target_uid}")));
        }

        self.channel
            .write(&DocPath::player(&self.game_id, target_uid), rescue_updates(now, &rules))
            .await?;
        info!("{} rescued {}", rescuer_uid, target_uid);

        if let Err(e) = self
            .channel
            .write(
                &DocPath::player(&self.game_id, rescuer_uid),
                FieldUpdates::new().increment("stats.rescues", 1),
            )
            .await
        {
            warn!(uid = rescuer_uid, error = %e, "rescuer stats write failed");
        }

        self.send_alert(Alert::rescued(target_uid, rescuer_uid)).await;
        Ok(())
    }

    /// Runner `uid` clears objective pin `pin_id`.
    #[instrument(skip(self, snapshot), fields(game_id = %self.game_id))]
    pub async fn clear_pin(
        &self,
        snapshot: &GameSnapshot,
        uid: &str,
        pin_id: &str,
    ) -> GameResult<ClearReport> {
        let rules = snapshot.rules(&self.config);
        let (me, here) = self.actor(snapshot, uid)?;
        let pin = snapshot
            .pins
            .get(pin_id)
            .ok_or_else(|| GameError::NotFound(format!("pin {pin_id}")))?;
        if clear_distance(me, here, pin, &rules).is_none() {
            return Err(GameError::NotEligible(format!("cannot clear {pin_id}")));
        }

        self.channel
            .write(&DocPath::pin(&self.game_id, pin_id), clear_updates(uid)?)
            .await?;

        let mut projected = snapshot.clone();
        if let Some(p) = projected.pins.get_mut(pin_id) {
            p.status = Some(PinStatus::Cleared);
            p.cleared = Some(true);
            p.cleared_by = Some(uid.to_string());
        }
        let standing = projected.pins.values().filter(|p| !p.is_cleared()).count();
        let remaining = u32::try_from(standing).unwrap_or(u32::MAX);
        info!("{} cleared pin {} ({} left)", uid, pin_id, remaining);

        if let Err(e) = self
            .channel
            .write(
                &DocPath::player(&self.game_id, uid),
                FieldUpdates::new().increment("stats.pinsCleared", 1),
            )
            .await
        {
            warn!(uid, error = %e, "pin stats write failed");
        }

        let runners: Vec<String> = projected.runners().map(|p| p.uid.clone()).collect();
        for runner in runners {
            self.send_alert(Alert::pin_cleared(&runner, uid, pin_id, remaining)).await;
        }

        let game_ended = self
            .end_if(all_pins_cleared(&projected), &projected, EndReason::ObjectivesCleared)
            .await;

        Ok(ClearReport {
            pin_id: pin_id.to_string(),
            remaining,
            game_ended,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::geo::GeoPoint;
    use crate::game::state::{from_document, Game, Location, ObjectivePin, Role};
    use crate::network::channel::Document;
    use crate::network::memory::MemoryChannel;
    use proptest::prelude::*;

    const ORIGIN: GeoPoint = GeoPoint { lat: 35.6812, lng: 139.7671 };

    #[test]
    fn test_capture_transition_counts_downs() {
        let rules = GameRules::default();
        let mut victim = Player::new("b", "B", Role::Runner);

        let first = capture_transition(&victim, 1_000, &rules);
        assert_eq!(first.downs, 1);
        assert_eq!(first.state, PlayerStatus::Downed);
        assert_eq!(first.reveal_until, 121_000);
        assert_eq!(first.cooldown_until, 31_000);

        victim.downs = 2;
        let third = capture_transition(&victim, 0, &rules);
        assert_eq!(third.downs, 3);
        assert!(third.eliminated());
    }

    #[test]
    fn test_capture_updates_shape() {
        let t = capture_transition(&Player::new("b", "B", Role::Runner), 0, &GameRules::default());
        let mut doc = Document::new();
        t.to_updates().unwrap().apply_to(&mut doc, 42);
        let p: Player = from_document(&doc).unwrap();
        assert_eq!(p.downs, 1);
        assert_eq!(p.state, Some(PlayerStatus::Downed));
        assert_eq!(p.last_down_at, Some(42));
        assert_eq!(p.stats.captured_times, 1);
    }

    fn apply(player: &Player, updates: FieldUpdates) -> Player {
        let mut doc = match serde_json::to_value(player).unwrap() {
            serde_json::Value::Object(m) => m,
            _ => unreachable!(),
        };
        updates.apply_to(&mut doc, 0);
        from_document(&doc).unwrap()
    }

    proptest! {
        #[test]
        fn prop_downs_monotonic(ops in proptest::collection::vec(any::<bool>(), 1..20)) {
            let rules = GameRules::default();
            let mut victim = Player::new("b", "B", Role::Runner);
            let mut captures = 0u32;

            // true = capture attempt, false = rescue attempt
            for capture in ops {
                let before = victim.downs;
                match (capture, victim.status()) {
                    (true, PlayerStatus::Active) | (true, PlayerStatus::Downed) => {
                        let t = capture_transition(&victim, 0, &rules);
                        victim = apply(&victim, t.to_updates().unwrap());
                        captures += 1;
                    }
                    (false, PlayerStatus::Downed) => {
                        victim = apply(&victim, rescue_updates(0, &rules));
                        prop_assert_eq!(victim.status(), PlayerStatus::Active);
                    }
                    _ => {}
                }
                prop_assert!(victim.downs >= before);
                prop_assert_eq!(victim.downs, captures.min(rules.max_downs));
                prop_assert_eq!(
                    victim.status() == PlayerStatus::Eliminated,
                    victim.downs >= rules.max_downs
                );
            }
        }
    }

    async fn setup() -> (Arc<MemoryChannel>, Arc<ManualClock>, CaptureRescueMachine) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let channel = Arc::new(MemoryChannel::new(clock.clone()));
        let machine =
            CaptureRescueMachine::new(channel.clone(), clock.clone(), GameConfig::default(), "g1");
        (channel, clock, machine)
    }

    fn place(snap: &mut GameSnapshot, player: Player, north_m: f64) {
        let p = ORIGIN.offset_meters(north_m, 0.0);
        snap.locations.insert(
            player.uid.clone(),
            Location {
                lat: p.lat,
                lng: p.lng,
                accuracy_m: None,
                at: None,
            },
        );
        snap.players.insert(player.uid.clone(), player);
    }

    fn running() -> GameSnapshot {
        let mut game = Game::new("a", &GameConfig::default());
        game.status = GameStatus::Running;
        GameSnapshot {
            game: Some(game),
            ..Default::default()
        }
    }

    async fn persist(channel: &MemoryChannel, snap: &GameSnapshot) {
        channel
            .write(
                &DocPath::game("g1"),
                FieldUpdates::from_object(snap.game.as_ref().unwrap()).unwrap(),
            )
            .await
            .unwrap();
        for p in snap.players.values() {
            channel
                .write(&DocPath::player("g1", &p.uid), FieldUpdates::from_object(p).unwrap())
                .await
                .unwrap();
        }
        for pin in snap.pins.values() {
            channel
                .write(&DocPath::pin("g1", &pin.id), FieldUpdates::from_object(pin).unwrap())
                .await
                .unwrap();
        }
    }

    fn stored_player(channel: &MemoryChannel, uid: &str) -> Player {
        from_document(&channel.document(&DocPath::player("g1", uid)).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_capture_writes_victim_and_attacker() {
        let (channel, _clock, machine) = setup().await;
        let mut snap = running();
        place(&mut snap, Player::new("a", "A", Role::Oni), 0.0);
        place(&mut snap, Player::new("b", "B", Role::Runner), 10.0);
        place(&mut snap, Player::new("c", "C", Role::Runner), 5_000.0);
        persist(&channel, &snap).await;

        let report = machine.capture(&snap, "a", "b").await.unwrap();
        assert_eq!(report.transition.downs, 1);
        assert!(!report.game_ended);

        let b = stored_player(&channel, "b");
        assert_eq!(b.state, Some(PlayerStatus::Downed));
        assert_eq!(b.last_reveal_until, Some(1_120_000));
        let a = stored_player(&channel, "a");
        assert_eq!(a.stats.captures, 1);
        assert_eq!(a.last_reveal_until, Some(1_120_000));
        assert_eq!(channel.collection(&DocPath::alerts("g1")).len(), 1);
    }

    #[tokio::test]
    async fn test_capture_out_of_range_rejected() {
        let (channel, _clock, machine) = setup().await;
        let mut snap = running();
        place(&mut snap, Player::new("a", "A", Role::Oni), 0.0);
        place(&mut snap, Player::new("b", "B", Role::Runner), 80.0);

        assert!(matches!(machine.capture(&snap, "a", "b").await, Err(GameError::NotEligible(_))));
        assert_eq!(channel.write_count(), 0);
    }

    #[tokio::test]
    async fn test_runner_cannot_capture() {
        let (_channel, _clock, machine) = setup().await;
        let mut snap = running();
        place(&mut snap, Player::new("b", "B", Role::Runner), 0.0);
        place(&mut snap, Player::new("c", "C", Role::Runner), 0.0);

        assert!(machine.capture(&snap, "b", "c").await.is_err());
    }

    #[tokio::test]
    async fn test_last_runner_capture_ends_game() {
        let (channel, _clock, machine) = setup().await;
        let mut snap = running();
        place(&mut snap, Player::new("a", "A", Role::Oni), 0.0);
        place(&mut snap, Player::new("b", "B", Role::Runner), 0.0);
        persist(&channel, &snap).await;

        let report = machine.capture(&snap, "a", "b").await.unwrap();
        assert!(report.game_ended);
        let game: Game = from_document(&channel.document(&DocPath::game("g1")).unwrap()).unwrap();
        assert_eq!(game.status, GameStatus::Ended);
        assert_eq!(game.end_reason, Some(EndReason::RunnersNeutralized));
    }

    #[tokio::test]
    async fn test_victim_write_failure_surfaces() {
        let (channel, _clock, machine) = setup().await;
        let mut snap = running();
        place(&mut snap, Player::new("a", "A", Role::Oni), 0.0);
        place(&mut snap, Player::new("b", "B", Role::Runner), 0.0);
        channel.set_offline(true);

        assert!(matches!(machine.capture(&snap, "a", "b").await, Err(GameError::Channel(_))));
    }

    #[tokio::test]
    async fn test_rescue_restores_active_keeps_downs() {
        let (channel, clock, machine) = setup().await;
        let mut snap = running();
        let mut b = Player::new("b", "B", Role::Runner);
        b.state = Some(PlayerStatus::Downed);
        b.downs = 1;
        b.cooldown_until = Some(1_030_000);
        b.last_reveal_until = Some(1_120_000);
        place(&mut snap, b, 0.0);
        place(&mut snap, Player::new("c", "C", Role::Runner), 20.0);
        persist(&channel, &snap).await;

        // Still inside the capture cooldown
        assert!(machine.rescue(&snap, "c", "b").await.is_err());

        clock.set(1_030_000);
        machine.rescue(&snap, "c", "b").await.unwrap();
        let b = stored_player(&channel, "b");
        assert_eq!(b.status(), PlayerStatus::Active);
        assert_eq!(b.downs, 1);
        assert_eq!(b.last_reveal_until, None);
        assert_eq!(b.last_rescued_at, Some(1_030_000));
        assert_eq!(stored_player(&channel, "c").stats.rescues, 1);
    }

    #[tokio::test]
    async fn test_clearing_last_pin_ends_game() {
        let (channel, _clock, machine) = setup().await;
        let mut snap = running();
        place(&mut snap, Player::new("a", "A", Role::Oni), 9_000.0);
        place(&mut snap, Player::new("b", "B", Role::Runner), 0.0);
        place(&mut snap, Player::new("c", "C", Role::Runner), 2_000.0);
        let mut done = ObjectivePin::new("p0", ORIGIN);
        done.status = Some(PinStatus::Cleared);
        snap.pins.insert("p0".into(), done);
        snap.pins.insert("p1".into(), ObjectivePin::new("p1", ORIGIN.offset_meters(10.0, 0.0)));
        persist(&channel, &snap).await;

        let report = machine.clear_pin(&snap, "b", "p1").await.unwrap();
        assert_eq!(report.remaining, 0);
        assert!(report.game_ended);

        let doc = channel.document(&DocPath::pin("g1", "p1")).unwrap();
        let pin: ObjectivePin = from_document(&doc).unwrap();
        assert!(pin.is_cleared());
        assert_eq!(pin.cleared_by.as_deref(), Some("b"));

        let game: Game = from_document(&channel.document(&DocPath::game("g1")).unwrap()).unwrap();
        assert_eq!(game.end_reason, Some(EndReason::ObjectivesCleared));
        assert_eq!(stored_player(&channel, "b").stats.pins_cleared, 1);
    }

    #[tokio::test]
    async fn test_actions_require_running_game() {
        let (_channel, _clock, machine) = setup().await;
        let mut snap = running();
        snap.game.as_mut().unwrap().status = GameStatus::Pending;
        place(&mut snap, Player::new("a", "A", Role::Oni), 0.0);
        place(&mut snap, Player::new("b", "B", Role::Runner), 0.0);

        assert_eq!(
            machine.capture(&snap, "a", "b").await,
            Err(GameError::NotEligible("game is not running".into()))
        );
    }
}
