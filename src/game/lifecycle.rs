//! Game Lifecycle
//!
//! Drives `pending -> countdown -> running -> ended`. The countdown is
//! anchored on the shared `countdownStartAt` timestamp so every client
//! converges on the same remaining time; the initiating client runs a
//! local timer until the shared one round-trips.
//!
//! Any client may perform the running and ended transitions. Both are
//! written so that redundant writes from several clients agree by value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, instrument, warn};

use crate::config::GameConfig;
use crate::core::clock::{format_ms, secs_to_ms, Clock, Millis};
use crate::error::{GameError, GameResult};
use crate::game::events::Alert;
use crate::game::state::{EndReason, Game, GameSnapshot, GameStatus, PlayerStatus};
use crate::network::channel::{DocPath, FieldUpdates, RealtimeChannel};
use crate::network::lock;

// =============================================================================
// COUNTDOWN TIMERS
// =============================================================================

/// A countdown anchored at an absolute start time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CountdownTimer {
    /// Anchor instant
    pub start_at: Millis,
    /// Length
    pub duration_ms: i64,
}

impl CountdownTimer {
    /// Create a timer.
    pub fn new(start_at: Millis, duration_sec: u32) -> Self {
        Self {
            start_at,
            duration_ms: secs_to_ms(duration_sec),
        }
    }

    /// Instant the countdown hits zero.
    pub fn ends_at(&self) -> Millis {
        self.start_at + self.duration_ms
    }

    /// Milliseconds left, never negative.
    pub fn remaining_ms(&self, now: Millis) -> i64 {
        (self.ends_at() - now).max(0)
    }

    /// Whole seconds left, rounded up for display.
    pub fn remaining_secs(&self, now: Millis) -> u32 {
        let ms = self.remaining_ms(now);
        u32::try_from((ms + 999) / 1000).unwrap_or(u32::MAX)
    }

    /// Whether the countdown has run out.
    pub fn expired(&self, now: Millis) -> bool {
        now >= self.ends_at()
    }
}

/// Which timer drives the display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerSource {
    /// Optimistic timer started by this client
    Local,
    /// Timer derived from the game document
    Shared,
}

/// What happened when the shared timer showed up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No local timer was running; the shared one is adopted as is
    Adopted,
    /// Local and shared agree within tolerance; the local timer keeps
    /// driving the display to avoid a visible jump
    Synced {
        /// Shared end minus local end
        drift_ms: i64,
    },
    /// Disagreement beyond tolerance; the display jumps to the shared timer
    Corrected {
        /// Shared end minus local end
        drift_ms: i64,
    },
}

/// Two countdown sources and the rule that picks one.
#[derive(Clone, Debug)]
pub struct CountdownReconciler {
    local: Option<CountdownTimer>,
    shared: Option<CountdownTimer>,
    source: TimerSource,
    tolerance_ms: i64,
}

impl CountdownReconciler {
    /// Create an idle reconciler.
    pub fn new(tolerance_ms: i64) -> Self {
        Self {
            local: None,
            shared: None,
            source: TimerSource::Shared,
            tolerance_ms,
        }
    }

    /// Start the optimistic local timer.
    pub fn start_local(&mut self, now: Millis, duration_sec: u32) {
        self.local = Some(CountdownTimer::new(now, duration_sec));
        self.source = TimerSource::Local;
    }

    /// Drop both timers.
    pub fn clear(&mut self) {
        self.local = None;
        self.shared = None;
        self.source = TimerSource::Shared;
    }

    /// Feed the game document. Returns an outcome the first time a shared
    /// timer appears (or whenever it changes).
    pub fn observe(
        &mut self,
        game: &Game,
        default_duration_sec: u32,
    ) -> Option<ReconcileOutcome> {
        if game.status != GameStatus::Countdown {
            self.clear();
            return None;
        }
        let start_at = game.countdown_start_at?;
        let duration = game.countdown_duration_sec.unwrap_or(default_duration_sec);
        let shared = CountdownTimer::new(start_at, duration);
        if self.shared == Some(shared) {
            return None;
        }
        self.shared = Some(shared);

        let Some(local) = self.local else {
            self.source = TimerSource::Shared;
            return Some(ReconcileOutcome::Adopted);
        };
        let drift_ms = shared.ends_at() - local.ends_at();
        if drift_ms.abs() <= self.tolerance_ms {
            self.source = TimerSource::Local;
            Some(ReconcileOutcome::Synced { drift_ms })
        } else {
            self.source = TimerSource::Shared;
            Some(ReconcileOutcome::Corrected { drift_ms })
        }
    }

    /// Timer currently driving the display.
    pub fn active(&self) -> Option<CountdownTimer> {
        match self.source {
            TimerSource::Local => self.local.or(self.shared),
            TimerSource::Shared => self.shared.or(self.local),
        }
    }

    /// Source of `active`.
    pub fn source(&self) -> TimerSource {
        self.source
    }

    /// Optimistic timer, if this client started one.
    pub fn local(&self) -> Option<CountdownTimer> {
        self.local
    }
}

// =============================================================================
// WIN CHECKS
// =============================================================================

/// At least one runner is in the game and none of them is active.
pub fn all_runners_neutralized(snapshot: &GameSnapshot) -> bool {
    let mut runners = snapshot.runners().peekable();
    runners.peek().is_some() && runners.all(|p| p.status() != PlayerStatus::Active)
}

/// At least one pin exists and every pin is cleared.
pub fn all_pins_cleared(snapshot: &GameSnapshot) -> bool {
    !snapshot.pins.is_empty() && snapshot.pins.values().all(|p| p.is_cleared())
}

/// Milliseconds left in the running phase, if it has started.
pub fn game_time_remaining_ms(game: &Game, duration_sec: u32, now: Millis) -> Option<i64> {
    let start_at = game.start_at?;
    Some((start_at + secs_to_ms(duration_sec) - now).max(0))
}

/// Write the end of the game and notify every player.
///
/// Writes `{status: ended, endReason}` even when another client may have
/// done the same; identical values make the redundant write harmless. A
/// game the snapshot already shows ended for a different reason is left
/// alone and `Ok(false)` is returned.
pub async fn write_game_end(
    channel: &dyn RealtimeChannel,
    game_id: &str,
    snapshot: &GameSnapshot,
    reason: EndReason,
) -> GameResult<bool> {
    let game = snapshot
        .game
        .as_ref()
        .ok_or_else(|| GameError::NotFound(format!("game {game_id}")))?;
    if game.status == GameStatus::Ended && game.end_reason.is_some_and(|r| r != reason) {
        debug!(game_id, ?reason, existing = ?game.end_reason, "game already ended");
        return Ok(false);
    }

    let updates = FieldUpdates::new()
        .set("status", "ended")
        .set_json("endReason", &reason)?;
    channel.write(&DocPath::game(game_id), updates).await?;
    info!("Game {} ended: {:?}", game_id, reason);

    for player in snapshot.active_players() {
        let alert = Alert::game_ended(&player.uid, reason);
        let result = match alert.to_updates() {
            Ok(updates) => channel.write(&DocPath::alert(game_id, &alert.id), updates).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(game_id, uid = %player.uid, error = %e, "game end alert not written");
        }
    }
    Ok(true)
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Derived values the UI shows, recomputed every second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LifecycleSignals {
    /// Game status
    pub status: Option<GameStatus>,
    /// Seconds until running, while counting down
    pub countdown_time_left: Option<u32>,
    /// Seconds until time runs out, while running
    pub game_time_remaining: Option<u32>,
}

/// Per-client lifecycle driver for one game.
pub struct LifecycleController {
    channel: Arc<dyn RealtimeChannel>,
    clock: Arc<dyn Clock>,
    config: GameConfig,
    game_id: String,
    uid: String,
    reconciler: Mutex<CountdownReconciler>,
    /// Set once this client's running write landed; cleared when the
    /// snapshot leaves `countdown`.
    running_requested: AtomicBool,
}

impl LifecycleController {
    /// Create a controller acting as `uid` in `game_id`.
    pub fn new(
        channel: Arc<dyn RealtimeChannel>,
        clock: Arc<dyn Clock>,
        config: GameConfig,
        game_id: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        let tolerance = config.countdown_sync_tolerance_ms;
        Self {
            channel,
            clock,
            config,
            game_id: game_id.into(),
            uid: uid.into(),
            reconciler: Mutex::new(CountdownReconciler::new(tolerance)),
            running_requested: AtomicBool::new(false),
        }
    }

    fn game<'a>(&self, snapshot: &'a GameSnapshot) -> GameResult<&'a Game> {
        snapshot
            .game
            .as_ref()
            .ok_or_else(|| GameError::NotFound(format!("game {}", self.game_id)))
    }

    fn require_owner(&self, game: &Game, action: &'static str) -> GameResult<()> {
        if game.is_owner(&self.uid) {
            Ok(())
        } else {
            Err(GameError::NotOwner(action))
        }
    }

    /// Owner starts the countdown. The local timer starts before the write.
    #[instrument(skip(self, snapshot), fields(game_id = %self.game_id))]
    pub async fn start_countdown(&self, snapshot: &GameSnapshot) -> GameResult<()> {
        let game = self.game(snapshot)?;
        self.require_owner(game, "start the countdown")?;
        if !game.status.can_transition_to(GameStatus::Countdown) {
            return Err(GameError::InvalidTransition {
                from: game.status,
                to: GameStatus::Countdown,
            });
        }

        let duration = game
            .countdown_duration_sec
            .unwrap_or(self.config.countdown_duration_sec);
        lock(&self.reconciler).start_local(self.clock.now_ms(), duration);
        self.running_requested.store(false, Ordering::SeqCst);

        let updates = FieldUpdates::new()
            .set("status", "countdown")
            .server_timestamp("countdownStartAt")
            .set("countdownDurationSec", duration);
        if let Err(e) = self.channel.write(&DocPath::game(&self.game_id), updates).await {
            lock(&self.reconciler).clear();
            return Err(e.into());
        }
        info!("Countdown started ({}s)", duration);
        Ok(())
    }

    /// Move a finished countdown to running. Safe to call from every client.
    ///
    /// `startAt` is only written when the snapshot shows it unset; two
    /// clients racing on the same stale snapshot may both write it. A
    /// client writes it at most once while its snapshot still lags.
    pub async fn begin_running(&self, snapshot: &GameSnapshot) -> GameResult<bool> {
        let game = self.game(snapshot)?;
        match game.status {
            GameStatus::Running | GameStatus::Ended => {
                self.running_requested.store(false, Ordering::SeqCst);
                return Ok(false);
            }
            GameStatus::Pending => {
                return Err(GameError::InvalidTransition {
                    from: GameStatus::Pending,
                    to: GameStatus::Running,
                })
            }
            GameStatus::Countdown => {
                if self.running_requested.load(Ordering::SeqCst) {
                    return Ok(false);
                }
            }
        }

        let mut updates = FieldUpdates::new()
            .set("status", "running")
            .delete("countdownStartAt")
            .delete("countdownDurationSec");
        if game.start_at.is_none() {
            updates = updates.server_timestamp("startAt");
        }
        self.channel.write(&DocPath::game(&self.game_id), updates).await?;
        self.running_requested.store(true, Ordering::SeqCst);
        lock(&self.reconciler).clear();
        info!("Game {} running", self.game_id);
        Ok(true)
    }

    /// End the game for `reason`.
    pub async fn end_game(&self, snapshot: &GameSnapshot, reason: EndReason) -> GameResult<bool> {
        let ended = write_game_end(self.channel.as_ref(), &self.game_id, snapshot, reason).await?;
        if ended {
            lock(&self.reconciler).clear();
        }
        Ok(ended)
    }

    /// Owner ends the game by hand, from any non-terminal status.
    #[instrument(skip(self, snapshot), fields(game_id = %self.game_id))]
    pub async fn owner_end(&self, snapshot: &GameSnapshot) -> GameResult<bool> {
        let game = self.game(snapshot)?;
        self.require_owner(game, "end the game")?;
        if game.status == GameStatus::Ended {
            return Ok(false);
        }
        self.end_game(snapshot, EndReason::OwnerEnded).await
    }

    /// Hand ownership to another active player.
    pub async fn reassign_owner(&self, snapshot: &GameSnapshot, new_owner: &str) -> GameResult<()> {
        let game = self.game(snapshot)?;
        self.require_owner(game, "reassign ownership")?;
        if !snapshot.player(new_owner).is_some_and(|p| p.active) {
            return Err(GameError::NotFound(format!("player {new_owner}")));
        }
        self.channel
            .write(&DocPath::game(&self.game_id), FieldUpdates::new().set("ownerUid", new_owner))
            .await?;
        info!("Ownership of {} passed to {}", self.game_id, new_owner);
        Ok(())
    }

    /// Current display signals.
    pub fn signals(&self, snapshot: &GameSnapshot) -> LifecycleSignals {
        let now = self.clock.now_ms();
        let Some(game) = snapshot.game.as_ref() else {
            return LifecycleSignals::default();
        };
        let mut signals = LifecycleSignals {
            status: Some(game.status),
            ..Default::default()
        };
        match game.status {
            GameStatus::Countdown => {
                let mut reconciler = lock(&self.reconciler);
                reconciler.observe(game, self.config.countdown_duration_sec);
                signals.countdown_time_left = reconciler.active().map(|t| t.remaining_secs(now));
            }
            GameStatus::Pending => {
                // Owner's optimistic countdown before its status write lands
                signals.countdown_time_left =
                    lock(&self.reconciler).local().map(|t| t.remaining_secs(now));
            }
            GameStatus::Running => {
                let duration = game
                    .game_duration_sec
                    .unwrap_or(self.config.game_duration_sec);
                signals.game_time_remaining = game_time_remaining_ms(game, duration, now)
                    .map(|ms| u32::try_from((ms + 999) / 1000).unwrap_or(u32::MAX));
            }
            GameStatus::Ended => {}
        }
        signals
    }

    /// One-second tick: reconcile the countdown, fire due transitions and
    /// return the display signals. Write failures are logged; the next
    /// tick tries again.
    pub async fn tick(&self, snapshot: &GameSnapshot) -> LifecycleSignals {
        let now = self.clock.now_ms();
        let Some(game) = snapshot.game.as_ref() else {
            return LifecycleSignals::default();
        };

        match game.status {
            GameStatus::Countdown => {
                let expired = {
                    let mut reconciler = lock(&self.reconciler);
                    match reconciler.observe(game, self.config.countdown_duration_sec) {
                        Some(ReconcileOutcome::Corrected { drift_ms }) => {
                            debug!(drift_ms, "countdown corrected to shared timer")
                        }
                        Some(outcome) => debug!(?outcome, "countdown reconciled"),
                        None => {}
                    }
                    reconciler.active().is_some_and(|t| t.expired(now))
                };
                if expired {
                    if let Err(e) = self.begin_running(snapshot).await {
                        warn!(game_id = %self.game_id, error = %e, "running transition failed");
                    }
                }
            }
            GameStatus::Running => {
                let duration = game
                    .game_duration_sec
                    .unwrap_or(self.config.game_duration_sec);
                if game_time_remaining_ms(game, duration, now) == Some(0) {
                    debug!(now = %format_ms(now), "game time elapsed");
                    if let Err(e) = self.end_game(snapshot, EndReason::TimeElapsed).await {
                        warn!(game_id = %self.game_id, error = %e, "time-elapsed end failed");
                    }
                }
            }
            GameStatus::Pending | GameStatus::Ended => {}
        }

        self.signals(snapshot)
    }
}
