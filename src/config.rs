//! Game Configuration
//!
//! Tunables for proximity, capture and lifecycle rules. Per-game values
//! stored on the game document override these defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default capture radius (meters).
pub const DEFAULT_CAPTURE_RADIUS_M: f64 = 50.0;
/// Default rescue radius, used when the game leaves it unset (meters).
pub const DEFAULT_RESCUE_RADIUS_M: f64 = 50.0;
/// Default number of downs before elimination.
pub const DEFAULT_MAX_DOWNS: u32 = 3;
/// Default mutual reveal window after a capture (seconds).
pub const DEFAULT_REVEAL_DURATION_SEC: u32 = 120;
/// Default protection window after capture or rescue (seconds).
pub const DEFAULT_RESCUE_COOLDOWN_SEC: u32 = 30;

/// Location publishing throttle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PublisherConfig {
    /// Minimum movement since the last accepted write (meters).
    pub min_distance_m: f64,
    /// Minimum spacing between accepted writes (ms).
    pub min_interval_ms: i64,
    /// Heartbeat: force a write after this long even when stationary (ms).
    pub max_interval_ms: i64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            min_distance_m: 10.0,
            min_interval_ms: 3_000,
            max_interval_ms: 15_000,
        }
    }
}

/// Game-wide tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GameConfig {
    /// Oni capture radius, also the pin clearing radius
    pub capture_radius_m: f64,
    /// Runner rescue radius
    pub rescue_radius_m: f64,
    /// Distance within which an oni detects runners
    pub killer_detect_runner_radius_m: f64,
    /// Distance within which a runner sees oni
    pub runner_see_killer_radius_m: f64,
    /// Distance within which a runner sees objective pins
    pub runner_see_generator_radius_m: f64,
    /// Distance within which an oni sees objective pins
    pub killer_see_generator_radius_m: f64,
    /// Length of the running phase (seconds)
    pub game_duration_sec: u32,
    /// Default countdown length (seconds)
    pub countdown_duration_sec: u32,
    /// Number of objective pins laid out per game
    pub pin_count: u32,
    /// Downs before a runner is eliminated
    pub max_downs: u32,
    /// Mutual reveal window after a capture (seconds)
    pub reveal_duration_sec: u32,
    /// Protection window after capture or rescue (seconds)
    pub rescue_cooldown_sec: u32,
    /// Skip capture/rescue targets still inside their cooldown window
    pub enforce_cooldown: bool,
    /// Local and shared countdowns closer than this are treated as synced (ms)
    pub countdown_sync_tolerance_ms: i64,
    /// Location publishing throttle
    pub publisher: PublisherConfig,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            capture_radius_m: DEFAULT_CAPTURE_RADIUS_M,
            rescue_radius_m: DEFAULT_RESCUE_RADIUS_M,
            killer_detect_runner_radius_m: 500.0,
            runner_see_killer_radius_m: 300.0,
            runner_see_generator_radius_m: 300.0,
            killer_see_generator_radius_m: 100.0,
            game_duration_sec: 1_800,
            countdown_duration_sec: 20,
            pin_count: 5,
            max_downs: DEFAULT_MAX_DOWNS,
            reveal_duration_sec: DEFAULT_REVEAL_DURATION_SEC,
            rescue_cooldown_sec: DEFAULT_RESCUE_COOLDOWN_SEC,
            enforce_cooldown: true,
            countdown_sync_tolerance_ms: 1_000,
            publisher: PublisherConfig::default(),
        }
    }
}

impl GameConfig {
    /// Defaults overlaid with `ONI_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Load from a JSON file. Missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from a key lookup. Unparseable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = parse(&lookup, "ONI_CAPTURE_RADIUS_M") {
            self.capture_radius_m = v;
        }
        if let Some(v) = parse(&lookup, "ONI_RESCUE_RADIUS_M") {
            self.rescue_radius_m = v;
        }
        if let Some(v) = parse(&lookup, "ONI_KILLER_DETECT_RUNNER_RADIUS_M") {
            self.killer_detect_runner_radius_m = v;
        }
        if let Some(v) = parse(&lookup, "ONI_RUNNER_SEE_KILLER_RADIUS_M") {
            self.runner_see_killer_radius_m = v;
        }
        if let Some(v) = parse(&lookup, "ONI_RUNNER_SEE_GENERATOR_RADIUS_M") {
            self.runner_see_generator_radius_m = v;
        }
        if let Some(v) = parse(&lookup, "ONI_KILLER_SEE_GENERATOR_RADIUS_M") {
            self.killer_see_generator_radius_m = v;
        }
        if let Some(v) = parse(&lookup, "ONI_GAME_DURATION_SEC") {
            self.game_duration_sec = v;
        }
        if let Some(v) = parse(&lookup, "ONI_COUNTDOWN_DURATION_SEC") {
            self.countdown_duration_sec = v;
        }
        if let Some(v) = parse(&lookup, "ONI_PIN_COUNT") {
            self.pin_count = v;
        }
        if let Some(v) = parse(&lookup, "ONI_MAX_DOWNS") {
            self.max_downs = v;
        }
        if let Some(v) = parse(&lookup, "ONI_REVEAL_DURATION_SEC") {
            self.reveal_duration_sec = v;
        }
        if let Some(v) = parse(&lookup, "ONI_RESCUE_COOLDOWN_SEC") {
            self.rescue_cooldown_sec = v;
        }
        if let Some(v) = lookup("ONI_ENFORCE_COOLDOWN") {
            self.enforce_cooldown = v == "true" || v == "1";
        }
        if let Some(v) = parse(&lookup, "ONI_PUBLISH_MIN_DISTANCE_M") {
            self.publisher.min_distance_m = v;
        }
        if let Some(v) = parse(&lookup, "ONI_PUBLISH_MIN_INTERVAL_MS") {
            self.publisher.min_interval_ms = v;
        }
        if let Some(v) = parse(&lookup, "ONI_PUBLISH_MAX_INTERVAL_MS") {
            self.publisher.max_interval_ms = v;
        }
    }

    /// Reject values the rules cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let radii = [
            ("captureRadiusM", self.capture_radius_m),
            ("rescueRadiusM", self.rescue_radius_m),
            ("killerDetectRunnerRadiusM", self.killer_detect_runner_radius_m),
            ("runnerSeeKillerRadiusM", self.runner_see_killer_radius_m),
            ("runnerSeeGeneratorRadiusM", self.runner_see_generator_radius_m),
            ("killerSeeGeneratorRadiusM", self.killer_see_generator_radius_m),
        ];
        for (name, value) in radii {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!("{name} must be positive, got {value}")));
            }
        }
        if self.game_duration_sec == 0 {
            return Err(ConfigError::Invalid("gameDurationSec must be positive".into()));
        }
        if self.max_downs == 0 {
            return Err(ConfigError::Invalid("maxDowns must be at least 1".into()));
        }
        let p = &self.publisher;
        if p.min_distance_m < 0.0 || p.min_interval_ms < 0 {
            return Err(ConfigError::Invalid("publisher thresholds must not be negative".into()));
        }
        if p.max_interval_ms < p.min_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "publisher maxIntervalMs ({}) below minIntervalMs ({})",
                p.max_interval_ms, p.min_interval_ms
            )));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        source: std::io::Error,
    },
    /// Config file is not valid JSON for this schema.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = GameConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_downs, 3);
        assert_eq!(config.publisher.min_interval_ms, 3_000);
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = [
            ("ONI_CAPTURE_RADIUS_M", "25"),
            ("ONI_MAX_DOWNS", "5"),
            ("ONI_ENFORCE_COOLDOWN", "false"),
            ("ONI_PIN_COUNT", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = GameConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.capture_radius_m, 25.0);
        assert_eq!(config.max_downs, 5);
        assert!(!config.enforce_cooldown);
        assert_eq!(config.pin_count, 5);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{"captureRadiusM": 30, "publisher": {"minDistanceM": 5}}"#;
        let config: GameConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.capture_radius_m, 30.0);
        assert_eq!(config.publisher.min_distance_m, 5.0);
        assert_eq!(config.publisher.max_interval_ms, 15_000);
        assert_eq!(config.rescue_radius_m, DEFAULT_RESCUE_RADIUS_M);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = GameConfig { capture_radius_m: 0.0, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = GameConfig { max_downs: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let mut config = GameConfig::default();
        config.publisher.max_interval_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file_missing() {
        let err = GameConfig::from_json_file("/nonexistent/onigokko.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
