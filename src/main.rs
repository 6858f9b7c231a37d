//! Onigokko Simulator
//!
//! Runs a scripted game between three simulated clients on the
//! in-process channel with a manual clock, logging every transition.
//!
//! Usage: `onigokko-sim [config.json]`. `ONI_*` variables override the
//! defaults when no file is given; `RUST_LOG` controls verbosity.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use onigokko::{
    game::backstop::{apply_backstop, evaluate_location_write},
    game::lifecycle::LifecycleSignals,
    BoundingBox, Clock, GameConfig, GameSession, GameStatus, GeoPoint, ManualClock, MemoryChannel,
    PlayArea, Role, SystemClock, VERSION,
};

const TOKYO_STATION: GeoPoint = GeoPoint { lat: 35.6812, lng: 139.7671 };

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => GameConfig::from_json_file(&path).with_context(|| format!("loading {path}"))?,
        None => {
            let config = GameConfig::from_env();
            config.validate().context("invalid ONI_* overrides")?;
            config
        }
    };

    info!("Onigokko simulator v{}", VERSION);
    info!(
        "Capture radius {} m, {} downs to eliminate, {} pins",
        config.capture_radius_m, config.max_downs, config.pin_count
    );

    demo_game(config).await
}

/// Advance the simulated clock and let every client tick.
async fn step(clock: &ManualClock, sessions: &[&GameSession], ms: i64) -> LifecycleSignals {
    clock.advance(ms);
    let mut last = LifecycleSignals::default();
    for session in sessions {
        last = session.tick().await;
    }
    last
}

/// Move a client and publish the fix.
async fn walk(clock: &ManualClock, session: &GameSession, to: GeoPoint) {
    // Stay clear of the publisher's minimum interval
    clock.advance(3_000);
    session.publish_location(to.lat, to.lng, Some(5.0)).await;
}

async fn demo_game(config: GameConfig) -> Result<()> {
    info!("=== Starting Demo Game ===");

    let clock = Arc::new(ManualClock::new(SystemClock.now_ms()));
    let channel = Arc::new(MemoryChannel::new(clock.clone()));
    let area = PlayArea::Rect(BoundingBox::around(TOKYO_STATION, 600.0));

    let aki = GameSession::create_game(
        channel.clone(),
        clock.clone(),
        config.clone(),
        "aki",
        "Aki",
        Some(area),
    )
    .await?;
    let game_id = aki.identity().game_id.clone();
    info!("Game ID: {}", game_id);

    let ben = GameSession::join(
        channel.clone(),
        clock.clone(),
        config.clone(),
        &game_id,
        "ben",
        "Ben",
        Role::Runner,
    )
    .await?;
    let chie = GameSession::join(
        channel.clone(),
        clock.clone(),
        config.clone(),
        &game_id,
        "chie",
        "Chie",
        Role::Runner,
    )
    .await?;
    let everyone = [&aki, &ben, &chie];

    walk(&clock, &aki, TOKYO_STATION.offset_meters(-200.0, 0.0)).await;
    walk(&clock, &ben, TOKYO_STATION.offset_meters(150.0, 100.0)).await;
    walk(&clock, &chie, TOKYO_STATION.offset_meters(100.0, -250.0)).await;

    // Countdown
    aki.start_countdown().await?;
    loop {
        let signals = step(&clock, &everyone, 1_000).await;
        if signals.status == Some(GameStatus::Running) {
            break;
        }
        if let Some(left) = signals.countdown_time_left {
            if left % 5 == 0 {
                info!("Countdown: {}s", left);
            }
        }
    }
    info!("Game running, {:?}s on the clock", aki.tick().await.game_time_remaining);

    // Aki chases Ben down
    let ben_spot = TOKYO_STATION.offset_meters(150.0, 100.0);
    walk(&clock, &aki, ben_spot).await;
    let Some(target) = aki.view().capture_target else {
        bail!("expected Ben within capture range");
    };
    let report = aki.capture(&target.id).await?;
    info!("Ben downed ({} of {} downs)", report.transition.downs, config.max_downs);

    // Chie waits out the cooldown and rescues Ben
    walk(&clock, &aki, TOKYO_STATION.offset_meters(-300.0, 300.0)).await;
    walk(&clock, &chie, ben_spot.offset_meters(10.0, 0.0)).await;
    step(&clock, &everyone, i64::from(config.rescue_cooldown_sec) * 1_000).await;
    match chie.view().rescue_target {
        Some(target) => chie.rescue(&target.id).await?,
        None => bail!("expected Ben to be rescuable"),
    }
    info!("Ben back in play, downs {}", chie.snapshot().player("ben").map_or(0, |p| p.downs));

    // Ben strays out of bounds; the hosted backstop converts him
    walk(&clock, &ben, TOKYO_STATION.offset_meters(900.0, 0.0)).await;
    info!("Ben out of bounds: {}", ben.is_out_of_bounds());
    let snapshot = ben.snapshot();
    let actions = evaluate_location_write(&snapshot, "ben", &snapshot.rules(&config));
    apply_backstop(&*channel, &game_id, &actions).await?;

    // Chie clears every pin
    let pins: Vec<_> = chie.snapshot().pins.values().map(|p| (p.id.clone(), p.point())).collect();
    for (pin_id, at) in pins {
        walk(&clock, &chie, at).await;
        let report = chie.clear_pin(&pin_id).await?;
        info!("Pin {} cleared, {} left", pin_id, report.remaining);
        if report.game_ended {
            break;
        }
    }

    // === Results ===
    let snapshot = aki.snapshot();
    let game = snapshot.game.as_ref().context("game document missing")?;
    info!("=== Game Results ===");
    info!("Status: {:?}, reason: {:?}", game.status, game.end_reason);
    for player in snapshot.players.values() {
        info!(
            "{} ({:?}): captures {}, captured {}, rescues {}, pins {}",
            player.nickname,
            player.role,
            player.stats.captures,
            player.stats.captured_times,
            player.stats.rescues,
            player.stats.pins_cleared
        );
    }
    for alert in &chie.snapshot().alerts {
        info!("Chie alert: {:?}", alert.event);
    }

    for session in everyone {
        session.store().stop();
    }
    Ok(())
}
