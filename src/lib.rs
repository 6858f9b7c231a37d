//! # Onigokko
//!
//! Concurrent state reconciliation core for a location-based game of tag.
//! Oni chase runners across a real play area; every client evaluates the
//! same proximity rules against its own copy of the shared documents and
//! writes the resulting transitions back. There is no authoritative tick
//! loop: clients converge through last-write-wins document updates.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ONIGOKKO CORE                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Pure primitives                           │
//! │  ├── geo.rs      - Haversine distance, bounds, polygons      │
//! │  ├── clock.rs    - Injected wall clock                       │
//! │  └── rng.rs      - Seeded pin placement                      │
//! │                                                              │
//! │  game/           - Rules (evaluated on every client)         │
//! │  ├── state.rs    - Documents and snapshot                    │
//! │  ├── proximity.rs- Visibility and eligibility                │
//! │  ├── capture.rs  - Capture / rescue / clear                  │
//! │  ├── lifecycle.rs- Countdown, status, win checks             │
//! │  ├── pins.rs     - Objective layout                          │
//! │  └── backstop.rs - Server-side enforcement subset            │
//! │                                                              │
//! │  network/        - Realtime channel plumbing                 │
//! │  ├── channel.rs  - Channel contract                          │
//! │  ├── memory.rs   - In-process channel                        │
//! │  ├── publisher.rs- Throttled location writes                 │
//! │  ├── store.rs    - Subscription fan-in                       │
//! │  └── session.rs  - Per-client facade and ticker              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data flow
//!
//! `LocationPublisher -> RealtimeChannel -> GameStateStore -> proximity
//! -> capture / lifecycle -> RealtimeChannel`
//!
//! Races between clients (double capture, capture against rescue,
//! redundant game end) are tolerated, not prevented: the later write
//! wins, and writes that may be repeated are repeated by value.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod error;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use crate::config::{ConfigError, GameConfig, PublisherConfig};
pub use crate::core::clock::{Clock, ManualClock, Millis, SystemClock};
pub use crate::core::geo::{distance_meters, is_within_bounds, BoundingBox, GeoPoint, PlayArea};
pub use crate::error::{GameError, GameResult};
pub use crate::game::state::{GameSnapshot, GameStatus, LoadState, Player, PlayerStatus, Role};
pub use crate::network::{GameSession, GameStateStore, MemoryChannel, RealtimeChannel};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
