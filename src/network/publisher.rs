//! Location Publisher
//!
//! Throttles device-cadence GPS fixes down to occasional location writes.
//! Two gates: a distance gate (moved far enough) and a time gate (spaced
//! far enough apart), with a heartbeat that forces a write for a
//! stationary player once the maximum interval passes.
//!
//! Publishing is best-effort telemetry. Failures are logged and swallowed;
//! the next fix retries naturally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::config::PublisherConfig;
use crate::core::clock::{Clock, Millis};
use crate::core::geo::{distance_meters, GeoPoint, PlayArea};
use crate::network::channel::{DocPath, FieldUpdates, RealtimeChannel};
use crate::network::{read, write};

/// Why a fix was not written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleReason {
    /// Too soon after the last accepted write
    TooSoon,
    /// Not moved far enough and heartbeat not due
    NotMoved,
}

/// Result of one `publish` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Write committed
    Written {
        /// The fix lies outside the play area
        out_of_bounds: bool,
    },
    /// Suppressed by a gate
    Throttled(ThrottleReason),
    /// Write failed; logged and dropped
    Failed,
}

#[derive(Clone, Copy, Debug)]
struct LastWrite {
    at: Millis,
    point: GeoPoint,
}

/// Throttle decision for one fix.
fn gate(
    config: &PublisherConfig,
    last: Option<LastWrite>,
    now: Millis,
    point: GeoPoint,
) -> Result<(), ThrottleReason> {
    let Some(last) = last else {
        return Ok(());
    };
    let elapsed = now - last.at;
    if elapsed < config.min_interval_ms {
        return Err(ThrottleReason::TooSoon);
    }
    let moved = distance_meters(last.point, point) >= config.min_distance_m;
    let heartbeat = elapsed >= config.max_interval_ms;
    if moved || heartbeat {
        Ok(())
    } else {
        Err(ThrottleReason::NotMoved)
    }
}

/// Per-client location writer.
pub struct LocationPublisher {
    channel: Arc<dyn RealtimeChannel>,
    clock: Arc<dyn Clock>,
    config: PublisherConfig,
    path: DocPath,
    bounds: RwLock<Option<PlayArea>>,
    last: Mutex<Option<LastWrite>>,
    out_of_bounds: AtomicBool,
}

impl LocationPublisher {
    /// Create a publisher writing `games/{game_id}/locations/{uid}`.
    pub fn new(
        channel: Arc<dyn RealtimeChannel>,
        clock: Arc<dyn Clock>,
        config: PublisherConfig,
        game_id: &str,
        uid: &str,
    ) -> Self {
        Self {
            channel,
            clock,
            config,
            path: DocPath::location(game_id, uid),
            bounds: RwLock::new(None),
            last: Mutex::new(None),
            out_of_bounds: AtomicBool::new(false),
        }
    }

    /// Set or clear the play area used for flagging.
    pub fn set_bounds(&self, bounds: Option<PlayArea>) {
        *write(&self.bounds) = bounds;
    }

    /// Whether the most recent fix was outside the play area.
    pub fn is_out_of_bounds(&self) -> bool {
        self.out_of_bounds.load(Ordering::Relaxed)
    }

    /// Target document.
    pub fn path(&self) -> &DocPath {
        &self.path
    }

    /// Offer a GPS fix. Never fails; the outcome is informational.
    pub async fn publish(&self, lat: f64, lng: f64, accuracy_m: Option<f64>) -> PublishOutcome {
        let point = GeoPoint::new(lat, lng);
        let now = self.clock.now_ms();

        // Flag every fix, written or not; never blocks the write
        let out_of_bounds = read(&self.bounds)
            .as_ref()
            .is_some_and(|area| !area.contains(point));
        if self.out_of_bounds.swap(out_of_bounds, Ordering::Relaxed) != out_of_bounds {
            debug!(path = %self.path, out_of_bounds, "boundary flag changed");
        }

        // Held across the write so concurrent fixes cannot both pass the gate
        let mut last = self.last.lock().await;
        if let Err(reason) = gate(&self.config, *last, now, point) {
            trace!(path = %self.path, ?reason, "fix throttled");
            return PublishOutcome::Throttled(reason);
        }

        let mut updates = FieldUpdates::new()
            .set("lat", lat)
            .set("lng", lng)
            .server_timestamp("at");
        updates = match accuracy_m {
            Some(acc) => updates.set("accuracyM", acc),
            None => updates.delete("accuracyM"),
        };

        match self.channel.write(&self.path, updates).await {
            Ok(()) => {
                *last = Some(LastWrite { at: now, point });
                debug!(path = %self.path, lat, lng, out_of_bounds, "location published");
                PublishOutcome::Written { out_of_bounds }
            }
            Err(e) => {
                warn!(path = %self.path, error = %e, "location write failed");
                PublishOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::geo::BoundingBox;
    use crate::network::memory::MemoryChannel;

    const TOKYO: GeoPoint = GeoPoint { lat: 35.6812, lng: 139.7671 };

    fn setup() -> (Arc<MemoryChannel>, Arc<ManualClock>, LocationPublisher) {
        let clock = Arc::new(ManualClock::new(0));
        let channel = Arc::new(MemoryChannel::new(clock.clone()));
        let publisher = LocationPublisher::new(
            channel.clone(),
            clock.clone(),
            PublisherConfig::default(),
            "g1",
            "b",
        );
        (channel, clock, publisher)
    }

    #[tokio::test]
    async fn test_stationary_fixes_only_heartbeat() {
        let (channel, clock, publisher) = setup();
        let mut written = Vec::new();

        // Same point every 500 ms for 20 s
        for step in 0..=40 {
            let now = step * 500;
            clock.set(now);
            let outcome = publisher.publish(TOKYO.lat, TOKYO.lng, None).await;
            if let PublishOutcome::Written { .. } = outcome {
                written.push(now);
            }
        }

        assert_eq!(written, vec![0, 15_000]);
        assert_eq!(channel.write_count(), 2);
    }

    #[tokio::test]
    async fn test_moving_fixes_respect_min_interval() {
        let (_channel, clock, publisher) = setup();
        let mut written = Vec::new();

        // 20 m per 500 ms fix for 10 s
        for step in 0..20 {
            let now = step * 500;
            clock.set(now);
            let p = TOKYO.offset_meters(20.0 * step as f64, 0.0);
            let outcome = publisher.publish(p.lat, p.lng, Some(5.0)).await;
            if let PublishOutcome::Written { .. } = outcome {
                written.push(now);
            }
        }

        assert_eq!(written, vec![0, 3_000, 6_000, 9_000]);
        for pair in written.windows(2) {
            assert!(pair[1] - pair[0] >= 3_000);
        }
    }

    #[tokio::test]
    async fn test_gps_jitter_only_heartbeats() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let (channel, clock, publisher) = setup();
        let mut rng = StdRng::seed_from_u64(7);

        // A standing player whose fix wanders up to 4 m, once a second
        for step in 0..=60 {
            clock.set(step * 1_000);
            let p = TOKYO.offset_meters(rng.gen_range(-2.0..2.0), rng.gen_range(-2.0..2.0));
            publisher.publish(p.lat, p.lng, Some(8.0)).await;
        }

        // First fix plus one heartbeat every 15 s
        assert_eq!(channel.write_count(), 5);
    }

    #[tokio::test]
    async fn test_small_moves_are_suppressed() {
        let (_channel, clock, publisher) = setup();
        publisher.publish(TOKYO.lat, TOKYO.lng, None).await;

        clock.set(4_000);
        let nudge = TOKYO.offset_meters(3.0, 0.0);
        assert_eq!(
            publisher.publish(nudge.lat, nudge.lng, None).await,
            PublishOutcome::Throttled(ThrottleReason::NotMoved)
        );
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_bookkeeping() {
        let (channel, clock, publisher) = setup();
        publisher.publish(TOKYO.lat, TOKYO.lng, None).await;

        channel.set_offline(true);
        clock.set(3_000);
        let p = TOKYO.offset_meters(50.0, 0.0);
        assert_eq!(publisher.publish(p.lat, p.lng, None).await, PublishOutcome::Failed);

        // Next fix retries right away since the failed one left no mark
        channel.set_offline(false);
        clock.set(3_500);
        assert!(matches!(
            publisher.publish(p.lat, p.lng, None).await,
            PublishOutcome::Written { .. }
        ));
    }

    #[tokio::test]
    async fn test_out_of_bounds_is_flagged_but_written() {
        let (channel, _clock, publisher) = setup();
        publisher.set_bounds(Some(PlayArea::Rect(BoundingBox::around(TOKYO, 200.0))));

        let outside = TOKYO.offset_meters(1_000.0, 0.0);
        let outcome = publisher.publish(outside.lat, outside.lng, None).await;

        assert_eq!(outcome, PublishOutcome::Written { out_of_bounds: true });
        assert!(publisher.is_out_of_bounds());
        let doc = channel.document(publisher.path()).unwrap();
        assert_eq!(doc["lat"], serde_json::json!(outside.lat));
    }
}
