//! Core primitives.
//!
//! Geographic math, time, and deterministic placement randomness.
//! Nothing in here touches the realtime channel.

pub mod clock;
pub mod geo;
pub mod rng;

// Re-export core types
pub use clock::{Clock, ManualClock, Millis, SystemClock};
pub use geo::{distance_meters, is_within_bounds, BoundingBox, GeoPoint, GeoPolygon, PlayArea};
pub use rng::{derive_pin_seed, PinRng};
