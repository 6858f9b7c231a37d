//! Game State Store
//!
//! Fan-in of the per-game subscriptions into one snapshot that the
//! rest of the client reads. Each slice (game, players, locations,
//! pins, alerts) is replaced only when the pushed value differs from
//! what is already held, so identical pushes never wake observers.
//!
//! Observers follow a `watch` revision counter that bumps once per
//! effective change.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::game::events::Alert;
use crate::game::state::{from_document, Game, GameSnapshot, LoadState, ObjectivePin, Player};
use crate::network::channel::{
    ChannelError, DocPath, Document, RealtimeChannel, Snapshot, Subscription,
};
use crate::network::{lock, read, write};

/// Which game and which user this client is.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Game id
    pub game_id: String,
    /// Self user id
    pub uid: String,
}

impl Identity {
    /// Create an identity.
    pub fn new(game_id: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            game_id: game_id.into(),
            uid: uid.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slice {
    Game,
    Players,
    Locations,
    Pins,
    Alerts,
}

impl Slice {
    const ALL: [Slice; 5] = [
        Slice::Game,
        Slice::Players,
        Slice::Locations,
        Slice::Pins,
        Slice::Alerts,
    ];

    fn path(self, game_id: &str) -> DocPath {
        match self {
            Slice::Game => DocPath::game(game_id),
            Slice::Players => DocPath::players(game_id),
            Slice::Locations => DocPath::locations(game_id),
            Slice::Pins => DocPath::pins(game_id),
            Slice::Alerts => DocPath::alerts(game_id),
        }
    }
}

#[derive(Default)]
struct StoreState {
    identity: Option<Identity>,
    snapshot: GameSnapshot,
    game_received: bool,
    players_received: bool,
}

impl StoreState {
    fn reset(&mut self, identity: Option<Identity>) {
        *self = StoreState {
            identity,
            ..StoreState::default()
        };
    }

    /// Recompute the load state. Terminal states stick until reset.
    fn refresh_load(&mut self) -> bool {
        let current = self.snapshot.load;
        if current.is_terminal() {
            return false;
        }

        let uid = self.identity.as_ref().map(|i| i.uid.as_str()).unwrap_or_default();
        let next = if self.game_received && self.snapshot.game.is_none() {
            LoadState::GameNotFound
        } else if self.players_received
            && !self.snapshot.players.get(uid).is_some_and(|p| p.active)
        {
            LoadState::PlayerNotFound
        } else if self.game_received && self.players_received {
            LoadState::Ready
        } else {
            LoadState::Loading
        };

        self.snapshot.load = next;
        next != current
    }
}

struct Shared {
    state: RwLock<StoreState>,
    subscriptions: Mutex<Vec<Subscription>>,
    generation: AtomicU64,
    revision: watch::Sender<u64>,
}

impl Shared {
    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    fn apply(&self, generation: u64, slice: Slice, pushed: Result<Snapshot, ChannelError>) {
        let pushed = match pushed {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Keep the last known value; clearing would flash "no game".
                warn!(?slice, error = %e, "subscription read failed, keeping last value");
                return;
            }
        };

        let mut state = write(&self.state);
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(?slice, "dropping push from previous identity");
            return;
        }
        let uid = state.identity.as_ref().map(|i| i.uid.clone()).unwrap_or_default();

        let changed = match (slice, pushed) {
            (Slice::Game, Snapshot::Document(doc)) => {
                let game = match doc.as_ref().map(from_document::<Game>).transpose() {
                    Ok(game) => game,
                    Err(e) => {
                        warn!(error = %e, "undecodable game document, keeping last value");
                        return;
                    }
                };
                state.game_received = true;
                replace_if_changed(&mut state.snapshot.game, game)
            }
            (Slice::Players, Snapshot::Collection(docs)) => {
                let mut players: BTreeMap<String, Player> = decode_collection(&docs, "player");
                for (id, player) in players.iter_mut() {
                    if player.uid.is_empty() {
                        player.uid = id.clone();
                    }
                }
                state.players_received = true;
                replace_if_changed(&mut state.snapshot.players, players)
            }
            (Slice::Locations, Snapshot::Collection(docs)) => {
                let locations = decode_collection(&docs, "location");
                replace_if_changed(&mut state.snapshot.locations, locations)
            }
            (Slice::Pins, Snapshot::Collection(docs)) => {
                let mut pins: BTreeMap<String, ObjectivePin> = decode_collection(&docs, "pin");
                for (id, pin) in pins.iter_mut() {
                    pin.id = id.clone();
                }
                replace_if_changed(&mut state.snapshot.pins, pins)
            }
            (Slice::Alerts, Snapshot::Collection(docs)) => {
                let all: BTreeMap<String, Alert> = decode_collection(&docs, "alert");
                let mut alerts: Vec<Alert> = all
                    .into_iter()
                    .filter(|(_, a)| a.to_uid == uid)
                    .map(|(id, mut a)| {
                        a.id = id;
                        a
                    })
                    .collect();
                alerts.sort_by(|a, b| {
                    a.created_at
                        .cmp(&b.created_at)
                        .then_with(|| a.id.cmp(&b.id))
                });
                replace_if_changed(&mut state.snapshot.alerts, alerts)
            }
            (slice, other) => {
                warn!(?slice, ?other, "push shape does not match slice");
                return;
            }
        };

        let load_changed = state.refresh_load();
        if load_changed && state.snapshot.load.is_terminal() {
            warn!(load = ?state.snapshot.load, "session documents missing");
        }
        drop(state);

        if changed || load_changed {
            #[cfg(feature = "debug-tracing")]
            tracing::trace!(?slice, "snapshot slice replaced");
            self.bump();
        }
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, next: T) -> bool {
    if *slot == next {
        return false;
    }
    *slot = next;
    true
}

fn decode_collection<T: DeserializeOwned>(
    docs: &BTreeMap<String, Document>,
    kind: &str,
) -> BTreeMap<String, T> {
    docs.iter()
        .filter_map(|(id, doc)| match from_document::<T>(doc) {
            Ok(value) => Some((id.clone(), value)),
            Err(e) => {
                warn!(kind, id = %id, error = %e, "skipping undecodable document");
                None
            }
        })
        .collect()
}

/// Single source of truth for the render layer.
///
/// Constructed with the channel it reads from; `start`/`stop` bound the
/// subscriptions' lifetime.
pub struct GameStateStore {
    channel: Arc<dyn RealtimeChannel>,
    shared: Arc<Shared>,
}

impl GameStateStore {
    /// Create an idle store.
    pub fn new(channel: Arc<dyn RealtimeChannel>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            channel,
            shared: Arc::new(Shared {
                state: RwLock::new(StoreState::default()),
                subscriptions: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                revision,
            }),
        }
    }

    /// Open the subscriptions for a game as a user.
    pub fn start(&self, game_id: &str, uid: &str) {
        self.set_identity(Identity::new(game_id, uid));
    }

    /// Switch identity. A different game or user wipes the snapshot
    /// before the new subscriptions open.
    pub fn set_identity(&self, identity: Identity) {
        let same = read(&self.shared.state).identity.as_ref() == Some(&identity);
        if same && self.is_running() {
            return;
        }

        self.stop();

        let generation = {
            let mut state = write(&self.shared.state);
            if !same {
                state.reset(Some(identity.clone()));
            }
            self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        if !same {
            self.shared.bump();
        }
        info!(game_id = %identity.game_id, uid = %identity.uid, "store starting");

        let subscriptions: Vec<Subscription> = Slice::ALL
            .iter()
            .map(|&slice| {
                let weak: Weak<Shared> = Arc::downgrade(&self.shared);
                self.channel.subscribe(
                    &slice.path(&identity.game_id),
                    Box::new(move |pushed| {
                        if let Some(shared) = weak.upgrade() {
                            shared.apply(generation, slice, pushed);
                        }
                    }),
                )
            })
            .collect();

        *lock(&self.shared.subscriptions) = subscriptions;
    }

    /// Tear down all subscriptions. Idempotent; a no-op before `start`.
    pub fn stop(&self) {
        let subscriptions = std::mem::take(&mut *lock(&self.shared.subscriptions));
        if subscriptions.is_empty() {
            return;
        }
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }
        debug!(count = subscriptions.len(), "store stopped");
    }

    /// Whether subscriptions are open.
    pub fn is_running(&self) -> bool {
        !lock(&self.shared.subscriptions).is_empty()
    }

    /// Current identity.
    pub fn identity(&self) -> Option<Identity> {
        read(&self.shared.state).identity.clone()
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> GameSnapshot {
        read(&self.shared.state).snapshot.clone()
    }

    /// Current revision; bumps once per effective change.
    pub fn revision(&self) -> u64 {
        *self.shared.revision.borrow()
    }

    /// Observe effective changes.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }
}

impl Drop for GameStateStore {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::core::clock::ManualClock;
    use crate::game::state::{GameStatus, Role};
    use crate::network::channel::FieldUpdates;
    use crate::network::memory::MemoryChannel;

    async fn seeded_channel() -> Arc<MemoryChannel> {
        let channel = Arc::new(MemoryChannel::new(Arc::new(ManualClock::new(1_000))));
        let game = Game::new("a", &GameConfig::default());
        channel
            .write(&DocPath::game("g1"), FieldUpdates::from_object(&game).unwrap())
            .await
            .unwrap();
        for (uid, role) in [("a", Role::Oni), ("b", Role::Runner)] {
            let player = Player::new(uid, uid.to_uppercase(), role);
            channel
                .write(&DocPath::player("g1", uid), FieldUpdates::from_object(&player).unwrap())
                .await
                .unwrap();
        }
        channel
    }

    #[tokio::test]
    async fn test_start_loads_snapshot() {
        let channel = seeded_channel().await;
        let store = GameStateStore::new(channel.clone());
        store.start("g1", "a");

        let snap = store.snapshot();
        assert_eq!(snap.load, LoadState::Ready);
        assert_eq!(snap.status(), Some(GameStatus::Pending));
        assert_eq!(snap.players.len(), 2);
        assert_eq!(snap.player("b").unwrap().uid, "b");
        assert_eq!(channel.subscriber_count(), 5);
    }

    #[tokio::test]
    async fn test_identical_push_does_not_bump_revision() {
        let channel = seeded_channel().await;
        let store = GameStateStore::new(channel.clone());
        store.start("g1", "a");
        let before = store.revision();

        // Same value rewritten: pushes arrive but nothing changes
        channel
            .write(&DocPath::game("g1"), FieldUpdates::new().set("status", "pending"))
            .await
            .unwrap();
        assert_eq!(store.revision(), before);

        channel
            .write(&DocPath::game("g1"), FieldUpdates::new().set("status", "countdown"))
            .await
            .unwrap();
        assert_eq!(store.revision(), before + 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let channel = seeded_channel().await;
        let store = GameStateStore::new(channel.clone());
        store.stop();
        store.start("g1", "a");
        store.stop();
        store.stop();
        assert_eq!(channel.subscriber_count(), 0);
        assert!(!store.is_running());

        // Snapshot survives a stop
        assert_eq!(store.snapshot().players.len(), 2);
    }

    #[tokio::test]
    async fn test_identity_change_resets_snapshot() {
        let channel = seeded_channel().await;
        let store = GameStateStore::new(channel.clone());
        store.start("g1", "a");
        assert_eq!(store.snapshot().players.len(), 2);

        store.set_identity(Identity::new("g2", "a"));
        let snap = store.snapshot();
        assert!(snap.players.is_empty());
        assert!(snap.game.is_none());
        assert_eq!(snap.load, LoadState::GameNotFound);
        assert_eq!(channel.subscriber_count(), 5);

        // Late writes to the old game never leak in
        channel
            .write(&DocPath::player("g1", "c"), FieldUpdates::new().set("role", "runner"))
            .await
            .unwrap();
        assert!(store.snapshot().players.is_empty());
    }

    #[tokio::test]
    async fn test_read_failure_keeps_last_value() {
        let channel = seeded_channel().await;
        let store = GameStateStore::new(channel.clone());
        store.start("g1", "a");
        let before = store.snapshot();

        channel.fail_reads(&DocPath::players("g1"), ChannelError::Unavailable("net".into()));
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_player_removed_is_terminal() {
        let channel = seeded_channel().await;
        let store = GameStateStore::new(channel.clone());
        store.start("g1", "b");
        assert_eq!(store.snapshot().load, LoadState::Ready);

        channel.delete(&DocPath::player("g1", "b")).await.unwrap();
        assert_eq!(store.snapshot().load, LoadState::PlayerNotFound);

        // Coming back does not revive the session
        channel
            .write(&DocPath::player("g1", "b"), FieldUpdates::new().set("role", "runner"))
            .await
            .unwrap();
        assert_eq!(store.snapshot().load, LoadState::PlayerNotFound);
    }

    #[tokio::test]
    async fn test_alerts_filtered_to_self() {
        let channel = seeded_channel().await;
        let store = GameStateStore::new(channel.clone());
        store.start("g1", "b");

        for alert in [Alert::captured("b", "a", 1, false), Alert::rescued("c", "b")] {
            channel
                .write(&DocPath::alert("g1", &alert.id), alert.to_updates().unwrap())
                .await
                .unwrap();
        }

        let alerts = store.snapshot().alerts;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].to_uid, "b");
    }

    #[tokio::test]
    async fn test_change_notifications() {
        let channel = seeded_channel().await;
        let store = GameStateStore::new(channel.clone());
        let mut changes = store.subscribe_changes();
        store.start("g1", "a");
        changes.borrow_and_update();

        channel
            .write(
                &DocPath::location("g1", "b"),
                FieldUpdates::new().set("lat", 35.0).set("lng", 139.0),
            )
            .await
            .unwrap();
        assert!(changes.has_changed().unwrap());
        assert_eq!(store.snapshot().locations.len(), 1);
    }
}
