//! Realtime Channel Contract
//!
//! The document store with realtime push that every client talks to.
//! The core only depends on this trait; storage, transport and
//! server-side triggers live behind it.
//!
//! ## Semantics
//!
//! - `subscribe` pushes the current value immediately and then every
//!   committed change. Ordering across different paths is unspecified.
//! - `write` merges fields into a document, creating it if absent.
//!   Field keys may be dotted paths (`stats.captures`).
//! - `FieldValue::Increment` is applied atomically by the store.
//! - `FieldValue::ServerTimestamp` resolves to the commit time.
//! - `delete` removes a whole document.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::clock::Millis;
use crate::network::lock;

/// A stored document: a JSON object.
pub type Document = serde_json::Map<String, Value>;

/// Push callback. Receives either a fresh snapshot or a read failure.
pub type ChangeCallback = Box<dyn Fn(Result<Snapshot, ChannelError>) + Send + Sync>;

// =============================================================================
// PATHS
// =============================================================================

/// Slash-separated path to a document (even segment count) or a
/// collection (odd segment count).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocPath(String);

impl DocPath {
    /// Parse and validate a raw path.
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() || trimmed.split('/').any(str::is_empty) {
            return Err(ChannelError::InvalidPath(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// `games/{game_id}`
    pub fn game(game_id: &str) -> Self {
        Self(format!("games/{game_id}"))
    }

    /// `games/{game_id}/players`
    pub fn players(game_id: &str) -> Self {
        Self(format!("games/{game_id}/players"))
    }

    /// `games/{game_id}/players/{uid}`
    pub fn player(game_id: &str, uid: &str) -> Self {
        Self(format!("games/{game_id}/players/{uid}"))
    }

    /// `games/{game_id}/locations`
    pub fn locations(game_id: &str) -> Self {
        Self(format!("games/{game_id}/locations"))
    }

    /// `games/{game_id}/locations/{uid}`
    pub fn location(game_id: &str, uid: &str) -> Self {
        Self(format!("games/{game_id}/locations/{uid}"))
    }

    /// `games/{game_id}/pins`
    pub fn pins(game_id: &str) -> Self {
        Self(format!("games/{game_id}/pins"))
    }

    /// `games/{game_id}/pins/{pin_id}`
    pub fn pin(game_id: &str, pin_id: &str) -> Self {
        Self(format!("games/{game_id}/pins/{pin_id}"))
    }

    /// `games/{game_id}/alerts`
    pub fn alerts(game_id: &str) -> Self {
        Self(format!("games/{game_id}/alerts"))
    }

    /// `games/{game_id}/alerts/{alert_id}`
    pub fn alert(game_id: &str, alert_id: &str) -> Self {
        Self(format!("games/{game_id}/alerts/{alert_id}"))
    }

    /// Raw path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.0.split('/').count()
    }

    /// Whether this path names a collection.
    pub fn is_collection(&self) -> bool {
        self.depth() % 2 == 1
    }

    /// Whether this path names a document.
    pub fn is_document(&self) -> bool {
        !self.is_collection()
    }

    /// Last segment (document or collection id).
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Enclosing path, if any.
    pub fn parent(&self) -> Option<DocPath> {
        self.0.rsplit_once('/').map(|(parent, _)| Self(parent.to_string()))
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// FIELD UPDATES
// =============================================================================

/// A single field mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// Overwrite with a value
    Set(Value),
    /// Atomic numeric increment (missing field counts as zero)
    Increment(i64),
    /// Resolved by the store to its commit time (Unix ms)
    ServerTimestamp,
    /// Remove the field
    Delete,
}

/// Sentinel resolved server-side to the commit time.
pub fn server_timestamp() -> FieldValue {
    FieldValue::ServerTimestamp
}

/// A partial document update, keyed by (possibly dotted) field path.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldUpdates(BTreeMap<String, FieldValue>);

impl FieldUpdates {
    /// Empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field.
    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), FieldValue::Set(value.into()));
        self
    }

    /// Set a field to any serializable value.
    pub fn set_json<T: Serialize>(mut self, field: &str, value: &T) -> Result<Self, ChannelError> {
        self.0.insert(field.to_string(), FieldValue::Set(serde_json::to_value(value)?));
        Ok(self)
    }

    /// Increment a numeric field atomically.
    pub fn increment(mut self, field: &str, delta: i64) -> Self {
        self.0.insert(field.to_string(), FieldValue::Increment(delta));
        self
    }

    /// Stamp a field with the commit time.
    pub fn server_timestamp(mut self, field: &str) -> Self {
        self.0.insert(field.to_string(), FieldValue::ServerTimestamp);
        self
    }

    /// Remove a field.
    pub fn delete(mut self, field: &str) -> Self {
        self.0.insert(field.to_string(), FieldValue::Delete);
        self
    }

    /// Every top-level field of an object, as `Set`.
    pub fn from_object<T: Serialize>(value: &T) -> Result<Self, ChannelError> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self(
                map.into_iter().map(|(k, v)| (k, FieldValue::Set(v))).collect(),
            )),
            other => Err(ChannelError::InvalidValue(format!("expected object, got {other}"))),
        }
    }

    /// Look up a pending mutation.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    /// Iterate mutations in field order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    /// Number of mutated fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is mutated.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge a document-level update into `doc`, resolving sentinels
    /// against `commit_time`.
    pub fn apply_to(&self, doc: &mut Document, commit_time: Millis) {
        for (field, value) in &self.0 {
            let parts: Vec<&str> = field.split('.').collect();
            apply_field(doc, &parts, value, commit_time);
        }
    }
}

fn apply_field(doc: &mut Document, path: &[&str], value: &FieldValue, commit_time: Millis) {
    match path {
        [] => {}
        [leaf] => apply_leaf(doc, leaf, value, commit_time),
        [head, rest @ ..] => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !entry.is_object() {
                *entry = Value::Object(Document::new());
            }
            if let Value::Object(child) = entry {
                apply_field(child, rest, value, commit_time);
            }
        }
    }
}

fn apply_leaf(doc: &mut Document, leaf: &str, value: &FieldValue, commit_time: Millis) {
    match value {
        FieldValue::Set(v) => {
            doc.insert(leaf.to_string(), v.clone());
        }
        FieldValue::Increment(delta) => {
            let next = match doc.get(leaf) {
                Some(Value::Number(n)) if n.is_i64() => {
                    Value::from(n.as_i64().unwrap_or(0).saturating_add(*delta))
                }
                Some(Value::Number(n)) => Value::from(n.as_f64().unwrap_or(0.0) + *delta as f64),
                _ => Value::from(*delta),
            };
            doc.insert(leaf.to_string(), next);
        }
        FieldValue::ServerTimestamp => {
            doc.insert(leaf.to_string(), Value::from(commit_time));
        }
        FieldValue::Delete => {
            doc.remove(leaf);
        }
    }
}

// =============================================================================
// SNAPSHOTS & SUBSCRIPTIONS
// =============================================================================

/// Value pushed to a subscriber.
#[derive(Clone, Debug, PartialEq)]
pub enum Snapshot {
    /// Single document; `None` when it does not exist
    Document(Option<Document>),
    /// Every document in a collection, keyed by id
    Collection(BTreeMap<String, Document>),
}

/// Teardown handle for a subscription.
///
/// `unsubscribe` is idempotent; dropping the handle also unsubscribes.
pub struct Subscription {
    path: DocPath,
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    /// Wrap a cancel action.
    pub fn new(path: DocPath, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            path,
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// Subscribed path.
    pub fn path(&self) -> &DocPath {
        &self.path
    }

    /// Whether the subscription is still live.
    pub fn is_active(&self) -> bool {
        lock(&self.cancel).is_some()
    }

    /// Stop receiving pushes. Safe to call repeatedly.
    pub fn unsubscribe(&self) {
        let cancel = lock(&self.cancel).take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path)
            .field("active", &self.is_active())
            .finish()
    }
}

// =============================================================================
// CHANNEL TRAIT
// =============================================================================

/// Document store with realtime push.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// Subscribe to a document or collection path.
    fn subscribe(&self, path: &DocPath, on_change: ChangeCallback) -> Subscription;

    /// Merge a partial update into a document, creating it if absent.
    async fn write(&self, path: &DocPath, updates: FieldUpdates) -> Result<(), ChannelError>;

    /// Remove a document.
    async fn delete(&self, path: &DocPath) -> Result<(), ChannelError>;
}

/// Channel errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChannelError {
    /// Store unreachable (network).
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    /// Write or read rejected by access rules.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed or wrong-kind path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Value could not be stored.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Channel shut down.
    #[error("channel closed")]
    Closed,
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        ChannelError::InvalidValue(e.to_string())
    }
}
