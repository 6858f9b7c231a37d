//! Network Layer
//!
//! Everything that talks to the realtime channel: the channel contract,
//! the in-process store, the throttled location publisher, the
//! subscription fan-in store, and the per-client session.

pub mod channel;
pub mod memory;
pub mod publisher;
pub mod session;
pub mod store;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use channel::{
    server_timestamp, ChangeCallback, ChannelError, DocPath, Document, FieldUpdates, FieldValue,
    RealtimeChannel, Snapshot, Subscription,
};
pub use memory::MemoryChannel;
pub use publisher::{LocationPublisher, PublishOutcome, ThrottleReason};
pub use session::GameSession;
pub use store::{GameStateStore, Identity};

/// Lock a mutex, recovering the data if a callback panicked while holding it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
