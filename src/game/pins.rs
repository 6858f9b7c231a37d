//! Objective Pins
//!
//! Pins are laid out in a batch when a game is created and relaid when
//! the owner changes the count. Layout is deterministic per game and
//! round: the seed comes from the game id, so a retried reconciliation
//! writes the same documents.

use tracing::{debug, info, warn};

use crate::core::geo::PlayArea;
use crate::core::rng::{derive_pin_seed, PinRng};
use crate::error::{GameError, GameResult};
use crate::game::state::{GameSnapshot, GameStatus, ObjectivePin};
use crate::network::channel::{ChannelError, DocPath, FieldUpdates, RealtimeChannel};

/// Pin id for index `i` of layout `round`.
pub fn pin_id(round: u32, i: u32) -> String {
    format!("pin-{round}-{i}")
}

/// Layout round encoded in a pin id, if it follows `pin_id`.
fn round_of(id: &str) -> Option<u32> {
    id.strip_prefix("pin-")?.split('-').next()?.parse().ok()
}

/// Round to use for the next layout.
pub fn next_round(snapshot: &GameSnapshot) -> u32 {
    snapshot
        .pins
        .keys()
        .filter_map(|id| round_of(id))
        .max()
        .map_or(0, |r| r.saturating_add(1))
}

/// Lay out `count` pins inside `area`.
pub fn generate_pins(game_id: &str, round: u32, area: &PlayArea, count: u32) -> Vec<ObjectivePin> {
    let mut rng = PinRng::new(derive_pin_seed(game_id, round));
    (0..count)
        .filter_map(|i| rng.point_in(area).map(|p| ObjectivePin::new(pin_id(round, i), p)))
        .collect()
}

/// Write a batch of new pins. Stops at the first failure.
pub async fn create_pins(
    channel: &dyn RealtimeChannel,
    game_id: &str,
    pins: &[ObjectivePin],
) -> Result<(), ChannelError> {
    for pin in pins {
        channel
            .write(&DocPath::pin(game_id, &pin.id), FieldUpdates::from_object(pin)?)
            .await?;
    }
    debug!(game_id, count = pins.len(), "pins created");
    Ok(())
}

/// Owner-only: when the stored pin count differs from the game's
/// `pinCount`, delete every pin and lay out a fresh set. Returns the
/// number of pins written.
pub async fn reconcile_pins(
    channel: &dyn RealtimeChannel,
    game_id: &str,
    snapshot: &GameSnapshot,
    uid: &str,
    pin_count: u32,
) -> GameResult<usize> {
    let game = snapshot
        .game
        .as_ref()
        .ok_or_else(|| GameError::NotFound(format!("game {game_id}")))?;
    if !game.is_owner(uid) {
        return Err(GameError::NotOwner("reconcile pins"));
    }
    if game.status != GameStatus::Pending {
        return Err(GameError::NotEligible("pins can only change before the game starts".into()));
    }
    if snapshot.pins.len() == pin_count as usize {
        return Ok(0);
    }
    let area = game
        .bounds
        .as_ref()
        .ok_or_else(|| GameError::NotEligible("game has no play area".into()))?;

    for id in snapshot.pins.keys() {
        if let Err(e) = channel.delete(&DocPath::pin(game_id, id)).await {
            warn!(game_id, pin = %id, error = %e, "pin delete failed");
            return Err(e.into());
        }
    }

    let pins = generate_pins(game_id, next_round(snapshot), area, pin_count);
    create_pins(channel, game_id, &pins).await?;
    info!("Reconciled pins for {}: {} -> {}", game_id, snapshot.pins.len(), pins.len());
    Ok(pins.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::GameConfig;
    use crate::core::clock::ManualClock;
    use crate::core::geo::{BoundingBox, GeoPoint, GeoPolygon};
    use crate::game::state::Game;
    use crate::network::memory::MemoryChannel;

    fn area() -> PlayArea {
        PlayArea::Rect(BoundingBox::around(GeoPoint::new(35.6812, 139.7671), 500.0))
    }

    #[test]
    fn test_layout_is_deterministic() {
        let a = generate_pins("g1", 0, &area(), 5);
        let b = generate_pins("g1", 0, &area(), 5);
        let c = generate_pins("g2", 0, &area(), 5);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 5);
        assert!(a.iter().all(|p| area().contains(p.point())));
        assert_eq!(a[3].id, "pin-0-3");
    }

    #[test]
    fn test_layout_in_polygon() {
        let triangle = PlayArea::Polygon(GeoPolygon::new(vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 0.01),
            GeoPoint::new(0.01, 0.0),
        ]));
        let pins = generate_pins("g1", 0, &triangle, 20);
        assert_eq!(pins.len(), 20);
        assert!(pins.iter().all(|p| triangle.contains(p.point())));
    }

    #[test]
    fn test_next_round() {
        let mut snap = GameSnapshot::default();
        assert_eq!(next_round(&snap), 0);
        snap.pins.insert("pin-2-0".into(), ObjectivePin::new("pin-2-0", GeoPoint::new(0.0, 0.0)));
        snap.pins.insert("legacy".into(), ObjectivePin::new("legacy", GeoPoint::new(0.0, 0.0)));
        assert_eq!(next_round(&snap), 3);
    }

    #[tokio::test]
    async fn test_reconcile_replaces_pins() {
        let channel = Arc::new(MemoryChannel::new(Arc::new(ManualClock::new(0))));
        let mut game = Game::new("a", &GameConfig::default());
        game.bounds = Some(area());
        let old = generate_pins("g1", 0, &area(), 2);
        create_pins(&*channel, "g1", &old).await.unwrap();

        let mut snap = GameSnapshot {
            game: Some(game),
            ..Default::default()
        };
        snap.pins = old.into_iter().map(|p| (p.id.clone(), p)).collect();

        assert_eq!(
            reconcile_pins(&*channel, "g1", &snap, "b", 4).await,
            Err(GameError::NotOwner("reconcile pins"))
        );
        assert_eq!(reconcile_pins(&*channel, "g1", &snap, "a", 2).await, Ok(0));
        assert_eq!(reconcile_pins(&*channel, "g1", &snap, "a", 4).await, Ok(4));

        let stored = channel.collection(&DocPath::pins("g1"));
        assert_eq!(stored.len(), 4);
        assert!(stored.keys().all(|id| id.starts_with("pin-1-")));
    }
}
