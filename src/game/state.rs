//! Game State Definitions
//!
//! Typed views of the documents stored in the realtime channel.
//! Field names follow the stored camelCase shape so that the backstop
//! triggers and every client read the same documents.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::GameConfig;
use crate::core::clock::Millis;
use crate::core::geo::{GeoPoint, PlayArea};
use crate::game::events::Alert;
use crate::network::channel::Document;

/// Decode a stored document into a typed view.
pub fn from_document<T: DeserializeOwned>(doc: &Document) -> Result<T, serde_json::Error> {
    serde_json::from_value(serde_json::Value::Object(doc.clone()))
}

// =============================================================================
// GAME
// =============================================================================

/// Lifecycle status of a game. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    /// Lobby, waiting for the owner to start
    #[default]
    Pending,
    /// Shared countdown before play
    Countdown,
    /// Active gameplay
    Running,
    /// Terminal
    Ended,
}

impl GameStatus {
    /// Whether `next` is a legal forward step from `self`.
    pub fn can_transition_to(self, next: GameStatus) -> bool {
        matches!(
            (self, next),
            (GameStatus::Pending, GameStatus::Countdown)
                | (GameStatus::Countdown, GameStatus::Running)
                | (GameStatus::Running, GameStatus::Ended)
                // Owner may abort from any non-terminal state
                | (GameStatus::Pending, GameStatus::Ended)
                | (GameStatus::Countdown, GameStatus::Ended)
        )
    }
}

/// Why a game ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Owner ended the game by hand
    OwnerEnded,
    /// Every runner is downed or eliminated
    RunnersNeutralized,
    /// Every objective pin is cleared
    ObjectivesCleared,
    /// The running phase outlasted its duration
    TimeElapsed,
}

impl EndReason {
    /// Role that wins with this outcome, if any.
    pub fn winning_role(self) -> Option<Role> {
        match self {
            EndReason::OwnerEnded => None,
            EndReason::RunnersNeutralized => Some(Role::Oni),
            EndReason::ObjectivesCleared | EndReason::TimeElapsed => Some(Role::Runner),
        }
    }
}

/// The game document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    /// Lifecycle status
    #[serde(default)]
    pub status: GameStatus,
    /// Player holding administrative authority
    pub owner_uid: String,
    /// When running began (set once)
    #[serde(default)]
    pub start_at: Option<Millis>,
    /// Shared countdown anchor
    #[serde(default)]
    pub countdown_start_at: Option<Millis>,
    /// Countdown length (seconds)
    #[serde(default)]
    pub countdown_duration_sec: Option<u32>,
    /// Running phase length (seconds)
    #[serde(default)]
    pub game_duration_sec: Option<u32>,
    /// Capture and pin clearing radius
    #[serde(default)]
    pub capture_radius_m: Option<f64>,
    /// Rescue radius
    #[serde(default)]
    pub rescue_radius_m: Option<f64>,
    /// Oni-detects-runner radius
    #[serde(default)]
    pub killer_detect_runner_radius_m: Option<f64>,
    /// Runner-sees-oni radius
    #[serde(default)]
    pub runner_see_killer_radius_m: Option<f64>,
    /// Runner pin visibility radius
    #[serde(default)]
    pub runner_see_generator_radius_m: Option<f64>,
    /// Oni pin visibility radius
    #[serde(default)]
    pub killer_see_generator_radius_m: Option<f64>,
    /// Target number of objective pins
    #[serde(default)]
    pub pin_count: Option<u32>,
    /// Play area; positions outside are flagged, never blocked
    #[serde(default)]
    pub bounds: Option<PlayArea>,
    /// Why the game ended
    #[serde(default)]
    pub end_reason: Option<EndReason>,
    /// Creation time
    #[serde(default)]
    pub created_at: Option<Millis>,
}

impl Game {
    /// Fresh pending game owned by `owner_uid`.
    pub fn new(owner_uid: impl Into<String>, config: &GameConfig) -> Self {
        Self {
            status: GameStatus::Pending,
            owner_uid: owner_uid.into(),
            start_at: None,
            countdown_start_at: None,
            countdown_duration_sec: None,
            game_duration_sec: Some(config.game_duration_sec),
            capture_radius_m: Some(config.capture_radius_m),
            rescue_radius_m: Some(config.rescue_radius_m),
            killer_detect_runner_radius_m: Some(config.killer_detect_runner_radius_m),
            runner_see_killer_radius_m: Some(config.runner_see_killer_radius_m),
            runner_see_generator_radius_m: Some(config.runner_see_generator_radius_m),
            killer_see_generator_radius_m: Some(config.killer_see_generator_radius_m),
            pin_count: Some(config.pin_count),
            bounds: None,
            end_reason: None,
            created_at: None,
        }
    }

    /// Resolve per-game overrides against config defaults.
    pub fn rules(&self, config: &GameConfig) -> GameRules {
        GameRules {
            capture_radius_m: self.capture_radius_m.unwrap_or(config.capture_radius_m),
            rescue_radius_m: self.rescue_radius_m.unwrap_or(config.rescue_radius_m),
            killer_detect_runner_radius_m: self
                .killer_detect_runner_radius_m
                .unwrap_or(config.killer_detect_runner_radius_m),
            runner_see_killer_radius_m: self
                .runner_see_killer_radius_m
                .unwrap_or(config.runner_see_killer_radius_m),
            runner_see_generator_radius_m: self
                .runner_see_generator_radius_m
                .unwrap_or(config.runner_see_generator_radius_m),
            killer_see_generator_radius_m: self
                .killer_see_generator_radius_m
                .unwrap_or(config.killer_see_generator_radius_m),
            game_duration_sec: self.game_duration_sec.unwrap_or(config.game_duration_sec),
            pin_count: self.pin_count.unwrap_or(config.pin_count),
            max_downs: config.max_downs,
            reveal_duration_sec: config.reveal_duration_sec,
            rescue_cooldown_sec: config.rescue_cooldown_sec,
            enforce_cooldown: config.enforce_cooldown,
        }
    }

    /// Whether `uid` holds administrative authority.
    pub fn is_owner(&self, uid: &str) -> bool {
        self.owner_uid == uid
    }
}

/// Effective tunables for one game.
#[derive(Clone, Debug, PartialEq)]
pub struct GameRules {
    /// Capture and pin clearing radius
    pub capture_radius_m: f64,
    /// Rescue radius
    pub rescue_radius_m: f64,
    /// Oni-detects-runner radius
    pub killer_detect_runner_radius_m: f64,
    /// Runner-sees-oni radius
    pub runner_see_killer_radius_m: f64,
    /// Runner pin visibility radius
    pub runner_see_generator_radius_m: f64,
    /// Oni pin visibility radius
    pub killer_see_generator_radius_m: f64,
    /// Running phase length (seconds)
    pub game_duration_sec: u32,
    /// Target number of objective pins
    pub pin_count: u32,
    /// Downs before elimination
    pub max_downs: u32,
    /// Reveal window after capture (seconds)
    pub reveal_duration_sec: u32,
    /// Cooldown after capture or rescue (seconds)
    pub rescue_cooldown_sec: u32,
    /// Skip targets inside their cooldown window
    pub enforce_cooldown: bool,
}

impl Default for GameRules {
    fn default() -> Self {
        let config = GameConfig::default();
        Game::new("", &config).rules(&config)
    }
}

// =============================================================================
// PLAYER
// =============================================================================

/// Player role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Chaser
    Oni,
    /// Evader
    #[default]
    Runner,
}

/// Runner status automaton state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    /// Free to move and act
    #[default]
    Active,
    /// Captured, waiting for a rescue
    Downed,
    /// Out for the rest of the game
    Eliminated,
}

/// Per-player counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStats {
    /// Captures made (oni)
    #[serde(default)]
    pub captures: u32,
    /// Times captured (runner)
    #[serde(default)]
    pub captured_times: u32,
    /// Pins cleared (runner)
    #[serde(default)]
    pub pins_cleared: u32,
    /// Rescues performed (runner)
    #[serde(default)]
    pub rescues: u32,
}

/// A player document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// User id; equals the document id
    #[serde(default)]
    pub uid: String,
    /// Display name
    #[serde(default)]
    pub nickname: String,
    /// Role in this game
    #[serde(default)]
    pub role: Role,
    /// Soft-delete flag
    #[serde(default = "default_true")]
    pub active: bool,
    /// Avatar image
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Runner status; absent means active
    #[serde(default)]
    pub state: Option<PlayerStatus>,
    /// Times downed
    #[serde(default)]
    pub downs: u32,
    /// Last capture time
    #[serde(default)]
    pub last_down_at: Option<Millis>,
    /// Last rescue time
    #[serde(default)]
    pub last_rescued_at: Option<Millis>,
    /// Force-visible to opponents until this instant
    #[serde(default)]
    pub last_reveal_until: Option<Millis>,
    /// Protected from capture and rescue until this instant
    #[serde(default)]
    pub cooldown_until: Option<Millis>,
    /// Counters
    #[serde(default)]
    pub stats: PlayerStats,
    /// Join time
    #[serde(default)]
    pub joined_at: Option<Millis>,
}

fn default_true() -> bool {
    true
}

impl Player {
    /// New active player.
    pub fn new(uid: impl Into<String>, nickname: impl Into<String>, role: Role) -> Self {
        Self {
            uid: uid.into(),
            nickname: nickname.into(),
            role,
            active: true,
            avatar_url: None,
            state: match role {
                Role::Runner => Some(PlayerStatus::Active),
                Role::Oni => None,
            },
            downs: 0,
            last_down_at: None,
            last_rescued_at: None,
            last_reveal_until: None,
            cooldown_until: None,
            stats: PlayerStats::default(),
            joined_at: None,
        }
    }

    /// Effective status. Oni are always active; a missing state is active.
    pub fn status(&self) -> PlayerStatus {
        match self.role {
            Role::Oni => PlayerStatus::Active,
            Role::Runner => self.state.unwrap_or_default(),
        }
    }

    /// Whether this is an oni.
    pub fn is_oni(&self) -> bool {
        self.role == Role::Oni
    }

    /// Whether this is a runner.
    pub fn is_runner(&self) -> bool {
        self.role == Role::Runner
    }

    /// Force-visible at `now`.
    pub fn is_revealed(&self, now: Millis) -> bool {
        self.last_reveal_until.is_some_and(|until| now < until)
    }

    /// Inside the post-capture/post-rescue protection window at `now`.
    pub fn in_cooldown(&self, now: Millis) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

// =============================================================================
// LOCATION
// =============================================================================

/// Latest known position of a player (latest-wins, no history).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lng: f64,
    /// Reported GPS accuracy
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    /// Commit time
    #[serde(default)]
    pub at: Option<Millis>,
}

impl Location {
    /// Position as a point.
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

// =============================================================================
// OBJECTIVE PIN
// =============================================================================

/// Pin progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PinStatus {
    /// Not yet touched
    #[default]
    Pending,
    /// A clear is in progress
    Clearing,
    /// Terminal
    Cleared,
}

/// An objective pin document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectivePin {
    /// Pin id; equals the document id
    #[serde(default)]
    pub id: String,
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lng: f64,
    /// Three-state progress
    #[serde(default)]
    pub status: Option<PinStatus>,
    /// Legacy boolean form of `status == cleared`
    #[serde(default)]
    pub cleared: Option<bool>,
    /// Runner who cleared it
    #[serde(default)]
    pub cleared_by: Option<String>,
    /// When it was cleared
    #[serde(default)]
    pub cleared_at: Option<Millis>,
}

impl ObjectivePin {
    /// New pending pin.
    pub fn new(id: impl Into<String>, point: GeoPoint) -> Self {
        Self {
            id: id.into(),
            lat: point.lat,
            lng: point.lng,
            status: Some(PinStatus::Pending),
            cleared: Some(false),
            cleared_by: None,
            cleared_at: None,
        }
    }

    /// Resolve both representations. `cleared` wins and is terminal.
    pub fn resolved_status(&self) -> PinStatus {
        if self.cleared == Some(true) {
            return PinStatus::Cleared;
        }
        self.status.unwrap_or_default()
    }

    /// Whether the pin is cleared.
    pub fn is_cleared(&self) -> bool {
        self.resolved_status() == PinStatus::Cleared
    }

    /// Position as a point.
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Whether the session's documents are usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LoadState {
    /// First pushes not received yet
    #[default]
    Loading,
    /// Game and self player present
    Ready,
    /// Game document is gone (terminal)
    GameNotFound,
    /// Self player document is gone or deactivated (terminal)
    PlayerNotFound,
}

impl LoadState {
    /// Whether the session can no longer continue.
    pub fn is_terminal(self) -> bool {
        matches!(self, LoadState::GameNotFound | LoadState::PlayerNotFound)
    }
}

/// Read-only projection of one game as seen by one client.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GameSnapshot {
    /// Load progress
    pub load: LoadState,
    /// Game document
    pub game: Option<Game>,
    /// Players by uid
    pub players: BTreeMap<String, Player>,
    /// Latest locations by uid
    pub locations: BTreeMap<String, Location>,
    /// Objective pins by id
    pub pins: BTreeMap<String, ObjectivePin>,
    /// Alerts addressed to this client, oldest first
    pub alerts: Vec<Alert>,
}

impl GameSnapshot {
    /// Current game status, if the game is loaded.
    pub fn status(&self) -> Option<GameStatus> {
        self.game.as_ref().map(|g| g.status)
    }

    /// Look up a player.
    pub fn player(&self, uid: &str) -> Option<&Player> {
        self.players.get(uid)
    }

    /// Look up a player's position.
    pub fn position(&self, uid: &str) -> Option<GeoPoint> {
        self.locations.get(uid).map(Location::point)
    }

    /// Players that have not been soft-deleted.
    pub fn active_players(&self) -> impl Iterator<Item = &Player> {
        self.players.values().filter(|p| p.active)
    }

    /// Active runners.
    pub fn runners(&self) -> impl Iterator<Item = &Player> {
        self.active_players().filter(|p| p.is_runner())
    }

    /// Effective tunables, falling back to config when the game is not loaded.
    pub fn rules(&self, config: &GameConfig) -> GameRules {
        match &self.game {
            Some(game) => game.rules(config),
            None => Game::new("", config).rules(config),
        }
    }
}
