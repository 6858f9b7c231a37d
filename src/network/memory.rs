//! In-Process Realtime Channel
//!
//! A single-process document store with realtime push. Every client in
//! a simulation shares one instance; tests use it as the store double.
//! Writes commit immediately and fan out to subscribers synchronously,
//! after the store lock is released.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::core::clock::Clock;
use crate::network::channel::{
    ChangeCallback, ChannelError, DocPath, Document, FieldUpdates, RealtimeChannel, Snapshot,
    Subscription,
};
use crate::network::lock;

struct Subscriber {
    path: DocPath,
    callback: Arc<ChangeCallback>,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<DocPath, Document>,
    subscribers: BTreeMap<u64, Subscriber>,
    next_subscriber: u64,
    offline: bool,
    writes: u64,
}

impl Inner {
    fn snapshot_of(&self, path: &DocPath) -> Snapshot {
        if path.is_collection() {
            let docs = self
                .docs
                .iter()
                .filter(|(p, _)| p.parent().as_ref() == Some(path))
                .map(|(p, d)| (p.id().to_string(), d.clone()))
                .collect();
            Snapshot::Collection(docs)
        } else {
            Snapshot::Document(self.docs.get(path).cloned())
        }
    }

    /// Subscribers affected by a change to `changed`, with their fresh snapshots.
    fn pending_notifications(&self, changed: &DocPath) -> Vec<(Arc<ChangeCallback>, Snapshot)> {
        let parent = changed.parent();
        self.subscribers
            .values()
            .filter(|s| &s.path == changed || Some(&s.path) == parent.as_ref())
            .map(|s| (s.callback.clone(), self.snapshot_of(&s.path)))
            .collect()
    }
}

/// Shared in-memory document store.
pub struct MemoryChannel {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl MemoryChannel {
    /// Create an empty store stamping commits with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
        }
    }

    /// Simulate losing connectivity: writes and deletes fail while offline.
    pub fn set_offline(&self, offline: bool) {
        lock(&self.inner).offline = offline;
    }

    /// Push a read failure to every subscriber of `path`.
    pub fn fail_reads(&self, path: &DocPath, error: ChannelError) {
        let callbacks: Vec<_> = lock(&self.inner)
            .subscribers
            .values()
            .filter(|s| &s.path == path)
            .map(|s| s.callback.clone())
            .collect();
        for callback in callbacks {
            callback(Err(error.clone()));
        }
    }

    /// Current contents of a document.
    pub fn document(&self, path: &DocPath) -> Option<Document> {
        lock(&self.inner).docs.get(path).cloned()
    }

    /// Current contents of a collection, keyed by id.
    pub fn collection(&self, path: &DocPath) -> BTreeMap<String, Document> {
        match lock(&self.inner).snapshot_of(path) {
            Snapshot::Collection(docs) => docs,
            Snapshot::Document(_) => BTreeMap::new(),
        }
    }

    /// Number of committed writes and deletes.
    pub fn write_count(&self) -> u64 {
        lock(&self.inner).writes
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    fn notify(pending: Vec<(Arc<ChangeCallback>, Snapshot)>) {
        for (callback, snapshot) in pending {
            callback(Ok(snapshot));
        }
    }
}

#[async_trait]
impl RealtimeChannel for MemoryChannel {
    fn subscribe(&self, path: &DocPath, on_change: ChangeCallback) -> Subscription {
        let callback = Arc::new(on_change);
        let (id, initial) = {
            let mut inner = lock(&self.inner);
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.insert(id, Subscriber {
                path: path.clone(),
                callback: callback.clone(),
            });
            (id, inner.snapshot_of(path))
        };
        trace!(%path, id, "subscribed");

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let subscription = Subscription::new(path.clone(), move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).subscribers.remove(&id);
            }
        });

        callback(Ok(initial));
        subscription
    }

    async fn write(&self, path: &DocPath, updates: FieldUpdates) -> Result<(), ChannelError> {
        if !path.is_document() {
            return Err(ChannelError::InvalidPath(path.to_string()));
        }
        let commit_time = self.clock.now_ms();

        let pending = {
            let mut inner = lock(&self.inner);
            if inner.offline {
                return Err(ChannelError::Unavailable(format!("offline, dropped write to {path}")));
            }
            let doc = inner.docs.entry(path.clone()).or_default();
            updates.apply_to(doc, commit_time);
            inner.writes += 1;
            inner.pending_notifications(path)
        };
        debug!(%path, fields = updates.len(), "committed write");

        Self::notify(pending);
        Ok(())
    }

    async fn delete(&self, path: &DocPath) -> Result<(), ChannelError> {
        if !path.is_document() {
            return Err(ChannelError::InvalidPath(path.to_string()));
        }

        let pending = {
            let mut inner = lock(&self.inner);
            if inner.offline {
                return Err(ChannelError::Unavailable(format!("offline, dropped delete of {path}")));
            }
            if inner.docs.remove(path).is_none() {
                return Ok(());
            }
            inner.writes += 1;
            inner.pending_notifications(path)
        };
        debug!(%path, "committed delete");

        Self::notify(pending);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use serde_json::json;

    fn channel() -> MemoryChannel {
        MemoryChannel::new(Arc::new(ManualClock::new(1_000)))
    }

    fn recorder() -> (Arc<Mutex<Vec<Result<Snapshot, ChannelError>>>>, ChangeCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Box::new(move |s| sink.lock().unwrap().push(s)))
    }

    #[tokio::test]
    async fn test_subscribe_pushes_current_value_then_changes() {
        let channel = channel();
        let path = DocPath::game("g1");
        channel.write(&path, FieldUpdates::new().set("status", "pending")).await.unwrap();

        let (seen, callback) = recorder();
        let _sub = channel.subscribe(&path, callback);
        channel.write(&path, FieldUpdates::new().set("status", "countdown")).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        match &seen[1] {
            Ok(Snapshot::Document(Some(doc))) => assert_eq!(doc["status"], json!("countdown")),
            other => panic!("unexpected push: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_collection_subscription_sees_children_only() {
        let channel = channel();
        let (seen, callback) = recorder();
        let _sub = channel.subscribe(&DocPath::players("g1"), callback);

        channel
            .write(&DocPath::player("g1", "a"), FieldUpdates::new().set("role", "oni"))
            .await
            .unwrap();
        channel
            .write(&DocPath::player("g2", "b"), FieldUpdates::new().set("role", "oni"))
            .await
            .unwrap();
        channel
            .write(&DocPath::game("g1"), FieldUpdates::new().set("status", "pending"))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2, "initial push plus one child write");
        match seen.last() {
            Some(Ok(Snapshot::Collection(docs))) => {
                assert_eq!(docs.len(), 1);
                assert!(docs.contains_key("a"));
            }
            other => panic!("unexpected push: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_timestamp_and_increment() {
        let clock = Arc::new(ManualClock::new(5_000));
        let channel = MemoryChannel::new(clock.clone());
        let path = DocPath::player("g1", "a");

        channel
            .write(&path, FieldUpdates::new().increment("stats.captures", 1).server_timestamp("at"))
            .await
            .unwrap();
        clock.advance(10);
        channel.write(&path, FieldUpdates::new().increment("stats.captures", 1)).await.unwrap();

        let doc = channel.document(&path).unwrap();
        assert_eq!(doc["stats"]["captures"], json!(2));
        assert_eq!(doc["at"], json!(5_000));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_pushes() {
        let channel = channel();
        let path = DocPath::game("g1");
        let (seen, callback) = recorder();
        let sub = channel.subscribe(&path, callback);
        assert_eq!(channel.subscriber_count(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(channel.subscriber_count(), 0);

        channel.write(&path, FieldUpdates::new().set("status", "running")).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_writes_fail() {
        let channel = channel();
        channel.set_offline(true);
        let result = channel.write(&DocPath::game("g1"), FieldUpdates::new().set("a", 1)).await;
        assert!(matches!(result, Err(ChannelError::Unavailable(_))));
        assert_eq!(channel.write_count(), 0);

        channel.set_offline(false);
        assert!(channel.write(&DocPath::game("g1"), FieldUpdates::new().set("a", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_and_collection_path_rejected() {
        let channel = channel();
        let path = DocPath::location("g1", "a");
        channel.write(&path, FieldUpdates::new().set("lat", 1.0)).await.unwrap();
        channel.delete(&path).await.unwrap();
        assert!(channel.document(&path).is_none());

        let result = channel.write(&DocPath::players("g1"), FieldUpdates::new()).await;
        assert!(matches!(result, Err(ChannelError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_fail_reads_reaches_subscribers() {
        let channel = channel();
        let path = DocPath::game("g1");
        let (seen, callback) = recorder();
        let _sub = channel.subscribe(&path, callback);

        channel.fail_reads(&path, ChannelError::PermissionDenied("rules".into()));
        let seen = seen.lock().unwrap();
        assert!(matches!(seen.last(), Some(Err(ChannelError::PermissionDenied(_)))));
    }
}
