//! Pin Placement RNG
//!
//! Xorshift128+ seeded from the game id, so that a reconciliation
//! round always lays out the same pins for the same game.

use sha2::{Digest, Sha256};

use super::geo::{GeoPoint, PlayArea};

/// Attempts per pin before giving up on a polygon sample.
const MAX_SAMPLE_ATTEMPTS: u32 = 64;

/// Deterministic PRNG using the Xorshift128+ algorithm.
#[derive(Clone, Debug)]
pub struct PinRng {
    state: [u64; 2],
}

impl PinRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// SplitMix64 spreads weak seeds over the full state.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // State must never be all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Generate the next 64-bit value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Uniform float in [0, 1).
    #[inline]
    pub fn next_unit(&mut self) -> f64 {
        // 53 high bits -> exact f64 mantissa
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Sample a point uniformly inside the play area.
    ///
    /// Rectangles sample directly; polygons use rejection sampling over
    /// their bounding box and fall back to the box center.
    pub fn point_in(&mut self, area: &PlayArea) -> Option<GeoPoint> {
        let bbox = area.bounding_box()?;
        for _ in 0..MAX_SAMPLE_ATTEMPTS {
            let lat = bbox.min_lat + self.next_unit() * (bbox.max_lat - bbox.min_lat);
            let lng = bbox.min_lng + self.next_unit() * (bbox.max_lng - bbox.min_lng);
            let candidate = GeoPoint::new(lat, lng);
            if area.contains(candidate) {
                return Some(candidate);
            }
        }
        Some(bbox.center())
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive the pin layout seed for a game and reconciliation round.
pub fn derive_pin_seed(game_id: &str, round: u32) -> u64 {
    let mut hasher = Sha256::new();

    // Domain separator
    hasher.update(b"ONIGOKKO_PIN_SEED_V1");
    hasher.update(game_id.as_bytes());
    hasher.update(round.to_le_bytes());

    let hash = hasher.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[0..8]);
    u64::from_le_bytes(seed)
}
