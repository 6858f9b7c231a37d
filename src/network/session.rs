//! Game Session
//!
//! Per-client facade over one game: owns the state store, the location
//! publisher, the capture machine and the lifecycle controller, and
//! exposes the membership operations (create, join, leave, kick, role
//! change). Also runs the one-second ticker that drives countdown
//! expiry and the elapsed-time end.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::GameConfig;
use crate::core::clock::Clock;
use crate::core::geo::PlayArea;
use crate::error::{GameError, GameResult};
use crate::game::capture::{CaptureReport, CaptureRescueMachine, ClearReport};
use crate::game::lifecycle::{LifecycleController, LifecycleSignals};
use crate::game::pins::{create_pins, generate_pins, reconcile_pins};
use crate::game::proximity::{ProximityMemo, ProximityView};
use crate::game::state::{Game, GameSnapshot, GameStatus, Player, Role};
use crate::network::channel::{DocPath, FieldUpdates, RealtimeChannel};
use crate::network::lock;
use crate::network::publisher::{LocationPublisher, PublishOutcome};
use crate::network::store::{GameStateStore, Identity};

/// Ticker period.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// One client's session in one game.
pub struct GameSession {
    channel: Arc<dyn RealtimeChannel>,
    config: GameConfig,
    identity: Identity,
    clock: Arc<dyn Clock>,
    store: GameStateStore,
    publisher: LocationPublisher,
    machine: CaptureRescueMachine,
    lifecycle: LifecycleController,
    memo: Mutex<ProximityMemo>,
    signals: watch::Sender<LifecycleSignals>,
}

impl GameSession {
    /// Open a session for an existing membership and start the store.
    pub fn resume(
        channel: Arc<dyn RealtimeChannel>,
        clock: Arc<dyn Clock>,
        config: GameConfig,
        game_id: &str,
        uid: &str,
    ) -> Self {
        let session = Self {
            store: GameStateStore::new(channel.clone()),
            publisher: LocationPublisher::new(
                channel.clone(),
                clock.clone(),
                config.publisher.clone(),
                game_id,
                uid,
            ),
            machine: CaptureRescueMachine::new(
                channel.clone(),
                clock.clone(),
                config.clone(),
                game_id,
            ),
            lifecycle: LifecycleController::new(
                channel.clone(),
                clock.clone(),
                config.clone(),
                game_id,
                uid,
            ),
            memo: Mutex::new(ProximityMemo::new()),
            signals: watch::channel(LifecycleSignals::default()).0,
            identity: Identity::new(game_id, uid),
            channel,
            clock,
            config,
        };
        session.store.set_identity(session.identity.clone());
        session
    }

    /// Create a game owned by `uid`, who joins as oni. Pins are laid out
    /// when a play area is given.
    #[instrument(skip(channel, clock, config, bounds))]
    pub async fn create_game(
        channel: Arc<dyn RealtimeChannel>,
        clock: Arc<dyn Clock>,
        config: GameConfig,
        uid: &str,
        nickname: &str,
        bounds: Option<PlayArea>,
    ) -> GameResult<Self> {
        let game_id = uuid::Uuid::new_v4().to_string();
        let mut game = Game::new(uid, &config);
        game.bounds = bounds;

        let updates = FieldUpdates::from_object(&game)?.server_timestamp("createdAt");
        channel.write(&DocPath::game(&game_id), updates).await?;
        write_player(channel.as_ref(), &game_id, &Player::new(uid, nickname, Role::Oni)).await?;

        if let Some(area) = &game.bounds {
            let pins = generate_pins(&game_id, 0, area, config.pin_count);
            create_pins(channel.as_ref(), &game_id, &pins).await?;
        } else {
            debug!(game_id = %game_id, "no play area, skipping pin layout");
        }

        info!("Created game {} owned by {}", game_id, uid);
        Ok(Self::resume(channel, clock, config, &game_id, uid))
    }

    /// Join an existing game with a role of choice.
    #[instrument(skip(channel, clock, config))]
    pub async fn join(
        channel: Arc<dyn RealtimeChannel>,
        clock: Arc<dyn Clock>,
        config: GameConfig,
        game_id: &str,
        uid: &str,
        nickname: &str,
        role: Role,
    ) -> GameResult<Self> {
        write_player(channel.as_ref(), game_id, &Player::new(uid, nickname, role)).await?;
        let session = Self::resume(channel, clock, config, game_id, uid);

        if let Some(game) = session.snapshot().game.as_ref() {
            if game.status == GameStatus::Ended {
                warn!(game_id, "joined a game that already ended");
            }
        } else if session.snapshot().load.is_terminal() {
            if let Err(e) = session.channel.delete(&DocPath::player(game_id, uid)).await {
                warn!(game_id, error = %e, "could not undo join");
            }
            return Err(GameError::NotFound(format!("game {game_id}")));
        }

        info!("{} joined {} as {:?}", uid, game_id, role);
        Ok(session)
    }

    /// Leave the game: stop listening and delete own documents.
    pub async fn leave(&self) -> GameResult<()> {
        self.store.stop();
        let Identity { game_id, uid } = &self.identity;
        self.channel.delete(&DocPath::location(game_id, uid)).await?;
        self.channel.delete(&DocPath::player(game_id, uid)).await?;
        info!("{} left {}", uid, game_id);
        Ok(())
    }

    fn require_owner(&self, snapshot: &GameSnapshot, action: &'static str) -> GameResult<()> {
        let game = snapshot
            .game
            .as_ref()
            .ok_or_else(|| GameError::NotFound(format!("game {}", self.identity.game_id)))?;
        if game.is_owner(&self.identity.uid) {
            Ok(())
        } else {
            Err(GameError::NotOwner(action))
        }
    }

    /// Owner removes a player (soft delete).
    pub async fn kick(&self, target_uid: &str) -> GameResult<()> {
        let snapshot = self.snapshot();
        self.require_owner(&snapshot, "kick players")?;
        if snapshot.player(target_uid).is_none() {
            return Err(GameError::NotFound(format!("player {target_uid}")));
        }
        self.channel
            .write(
                &DocPath::player(&self.identity.game_id, target_uid),
                FieldUpdates::new().set("active", false),
            )
            .await?;
        info!("{} kicked {}", self.identity.uid, target_uid);
        Ok(())
    }

    /// Change a role before the game starts. Players may change their
    /// own role; the owner may change anyone's.
    pub async fn change_role(&self, target_uid: &str, role: Role) -> GameResult<()> {
        let snapshot = self.snapshot();
        if target_uid != self.identity.uid {
            self.require_owner(&snapshot, "change other players' roles")?;
        }
        match snapshot.status() {
            Some(GameStatus::Pending) => {}
            Some(status) => {
                return Err(GameError::NotEligible(format!(
                    "roles are fixed once {status:?}"
                )))
            }
            None => return Err(GameError::NotFound(format!("game {}", self.identity.game_id))),
        }
        if snapshot.player(target_uid).is_none() {
            return Err(GameError::NotFound(format!("player {target_uid}")));
        }

        let updates = match role {
            Role::Runner => FieldUpdates::new().set("role", "runner").set("state", "active"),
            Role::Oni => FieldUpdates::new().set("role", "oni").delete("state"),
        };
        self.channel
            .write(&DocPath::player(&self.identity.game_id, target_uid), updates)
            .await?;
        info!("{} is now {:?}", target_uid, role);
        Ok(())
    }

    /// Owner hands ownership to another player.
    pub async fn reassign_owner(&self, new_owner: &str) -> GameResult<()> {
        self.lifecycle.reassign_owner(&self.snapshot(), new_owner).await
    }

    /// Owner relays pins when the count changed.
    pub async fn reconcile_pins(&self) -> GameResult<usize> {
        let snapshot = self.snapshot();
        let pin_count = snapshot.rules(&self.config).pin_count;
        reconcile_pins(
            self.channel.as_ref(),
            &self.identity.game_id,
            &snapshot,
            &self.identity.uid,
            pin_count,
        )
        .await
    }

    /// Offer a GPS fix to the throttled publisher.
    pub async fn publish_location(
        &self,
        lat: f64,
        lng: f64,
        accuracy_m: Option<f64>,
    ) -> PublishOutcome {
        let bounds = self.snapshot().game.and_then(|g| g.bounds);
        self.publisher.set_bounds(bounds);
        self.publisher.publish(lat, lng, accuracy_m).await
    }

    /// Current proximity view, recomputed only when inputs changed.
    pub fn view(&self) -> ProximityView {
        let revision = self.store.revision();
        let snapshot = self.store.snapshot();
        lock(&self.memo)
            .view(revision, &snapshot, &self.identity.uid, self.clock.now_ms(), &self.config)
            .clone()
    }

    /// Capture a runner.
    pub async fn capture(&self, victim_uid: &str) -> GameResult<CaptureReport> {
        self.machine.capture(&self.snapshot(), &self.identity.uid, victim_uid).await
    }

    /// Rescue a downed runner.
    pub async fn rescue(&self, target_uid: &str) -> GameResult<()> {
        self.machine.rescue(&self.snapshot(), &self.identity.uid, target_uid).await
    }

    /// Clear an objective pin.
    pub async fn clear_pin(&self, pin_id: &str) -> GameResult<ClearReport> {
        self.machine.clear_pin(&self.snapshot(), &self.identity.uid, pin_id).await
    }

    /// Owner starts the countdown.
    pub async fn start_countdown(&self) -> GameResult<()> {
        self.lifecycle.start_countdown(&self.snapshot()).await
    }

    /// Owner ends the game.
    pub async fn end_game(&self) -> GameResult<bool> {
        self.lifecycle.owner_end(&self.snapshot()).await
    }

    /// Run one lifecycle tick and publish the signals.
    pub async fn tick(&self) -> LifecycleSignals {
        let signals = self.lifecycle.tick(&self.snapshot()).await;
        self.signals.send_if_modified(|current| {
            if *current == signals {
                return false;
            }
            *current = signals;
            true
        });
        signals
    }

    /// Spawn the one-second ticker. It stops when `shutdown` fires or the
    /// game reaches a terminal state.
    pub fn spawn_ticker(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let signals = session.tick().await;
                        let ended = signals.status == Some(GameStatus::Ended);
                        if ended || session.snapshot().load.is_terminal() {
                            debug!(game_id = %session.identity.game_id, "ticker finished");
                            break;
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!(game_id = %session.identity.game_id, "ticker shut down");
                        break;
                    }
                }
            }
        })
    }

    /// Latest lifecycle signals.
    pub fn signals(&self) -> watch::Receiver<LifecycleSignals> {
        self.signals.subscribe()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> GameSnapshot {
        self.store.snapshot()
    }

    /// Underlying store, for change notifications.
    pub fn store(&self) -> &GameStateStore {
        &self.store
    }

    /// Game and self uid.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Whether the last fix was outside the play area.
    pub fn is_out_of_bounds(&self) -> bool {
        self.publisher.is_out_of_bounds()
    }
}

async fn write_player(
    channel: &dyn RealtimeChannel,
    game_id: &str,
    player: &Player,
) -> GameResult<()> {
    let updates = FieldUpdates::from_object(player)?.server_timestamp("joinedAt");
    channel.write(&DocPath::player(game_id, &player.uid), updates).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::geo::{BoundingBox, GeoPoint};
    use crate::game::state::LoadState;
    use crate::network::memory::MemoryChannel;

    const ORIGIN: GeoPoint = GeoPoint { lat: 35.6812, lng: 139.7671 };

    fn substrate() -> (Arc<MemoryChannel>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (Arc::new(MemoryChannel::new(clock.clone())), clock)
    }

    async fn owner_game(channel: &Arc<MemoryChannel>, clock: &Arc<ManualClock>) -> GameSession {
        GameSession::create_game(
            channel.clone(),
            clock.clone(),
            GameConfig::default(),
            "a",
            "Aki",
            Some(PlayArea::Rect(BoundingBox::around(ORIGIN, 500.0))),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_game_makes_owner_oni_with_pins() {
        let (channel, clock) = substrate();
        let session = owner_game(&channel, &clock).await;
        let snap = session.snapshot();

        assert_eq!(snap.load, LoadState::Ready);
        assert!(snap.game.as_ref().unwrap().is_owner("a"));
        assert_eq!(snap.player("a").unwrap().role, Role::Oni);
        assert_eq!(snap.pins.len(), 5);
    }

    #[tokio::test]
    async fn test_join_missing_game_fails() {
        let (channel, clock) = substrate();
        let result = GameSession::join(
            channel.clone(),
            clock,
            GameConfig::default(),
            "nope",
            "b",
            "Ben",
            Role::Runner,
        )
        .await;
        assert!(matches!(result, Err(GameError::NotFound(_))));
        assert!(channel.collection(&DocPath::players("nope")).is_empty());
    }

    #[tokio::test]
    async fn test_membership_operations() {
        let (channel, clock) = substrate();
        let owner = owner_game(&channel, &clock).await;
        let game_id = owner.identity().game_id.clone();
        let b = GameSession::join(
            channel.clone(),
            clock.clone(),
            GameConfig::default(),
            &game_id,
            "b",
            "Ben",
            Role::default(),
        )
        .await
        .unwrap();

        assert_eq!(b.kick("a").await, Err(GameError::NotOwner("kick players")));
        assert!(b.change_role("a", Role::Runner).await.is_err());
        b.change_role("b", Role::Oni).await.unwrap();
        assert_eq!(owner.snapshot().player("b").unwrap().role, Role::Oni);

        owner.kick("b").await.unwrap();
        assert_eq!(b.snapshot().load, LoadState::PlayerNotFound);
    }

    #[tokio::test]
    async fn test_leave_deletes_documents() {
        let (channel, clock) = substrate();
        let owner = owner_game(&channel, &clock).await;
        let game_id = owner.identity().game_id.clone();
        let b = GameSession::join(
            channel.clone(),
            clock.clone(),
            GameConfig::default(),
            &game_id,
            "b",
            "Ben",
            Role::Runner,
        )
        .await
        .unwrap();
        b.publish_location(ORIGIN.lat, ORIGIN.lng, None).await;
        assert_eq!(owner.snapshot().locations.len(), 1);

        b.leave().await.unwrap();
        let snap = owner.snapshot();
        assert!(snap.player("b").is_none());
        assert!(snap.locations.is_empty());
    }

    #[tokio::test]
    async fn test_ticker_stops_on_shutdown() {
        let (channel, clock) = substrate();
        let session = Arc::new(owner_game(&channel, &clock).await);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = session.spawn_ticker(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(*session.signals().borrow(), LifecycleSignals {
            status: Some(GameStatus::Pending),
            ..Default::default()
        });
    }
}
