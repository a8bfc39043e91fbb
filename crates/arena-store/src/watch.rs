//! Low-level change watches.
//!
//! A watch is registered on up to [`MAX_WATCH_KEYS`] keys and receives one
//! [`WatchEvent`] per commit that wrote any of them. Events are published
//! by the committing thread while it still holds the connection lock, so a
//! watcher observes commits in exactly the order they were applied.
//!
//! The hub performs no deduplication or batching; consumers that only need
//! "something changed" (such as the subscription broker) coalesce on their
//! side.
//!
//! Each watch queues at most [`WATCH_QUEUE_CAPACITY`] undelivered events.
//! A reader that falls that far behind loses the newer events and finds
//! [`WatchStream::take_lagged`] set; it should re-read the keys it watches.
//!
//! Dropping a [`WatchStream`] unregisters it immediately.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use crate::entry::{decode_value, Mutation, MutationKind, Versionstamp};
use crate::error::{StoreError, StoreResult};
use crate::key::Key;

/// Maximum number of keys a single watch may observe.
pub const MAX_WATCH_KEYS: usize = 10;

/// Undelivered events a single watch may hold before it lags.
pub const WATCH_QUEUE_CAPACITY: usize = 1024;

// ── events ───────────────────────────────────────────────────────────

/// The new state of one watched key after a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// The key now holds this JSON-encoded value.
    Set(Vec<u8>),
    /// The key was deleted.
    Deleted,
}

/// One watched key touched by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    pub key: Key,
    pub change: Change,
}

impl WatchEntry {
    /// Decode the new value, or `None` for a deletion.
    pub fn value<T: DeserializeOwned>(&self) -> StoreResult<Option<T>> {
        match &self.change {
            Change::Set(bytes) => decode_value(bytes).map(Some),
            Change::Deleted => Ok(None),
        }
    }

    pub fn is_deletion(&self) -> bool {
        self.change == Change::Deleted
    }
}

/// Everything a single commit changed among a watcher's keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Versionstamp of the commit; shared by all entries.
    pub versionstamp: Versionstamp,
    /// Touched keys, in the order they were passed to `watch`.
    pub entries: Vec<WatchEntry>,
}

// ── hub ──────────────────────────────────────────────────────────────

struct Watcher {
    keys: Vec<(Key, Vec<u8>)>,
    tx: mpsc::Sender<WatchEvent>,
    lagged: Arc<AtomicBool>,
}

struct HubInner {
    next_id: AtomicU64,
    watchers: DashMap<u64, Watcher>,
    closed: AtomicBool,
}

/// Registry of live watches, shared by every clone of a [`crate::Kv`].
#[derive(Clone)]
pub(crate) struct WatchHub {
    inner: Arc<HubInner>,
}

impl WatchHub {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                next_id: AtomicU64::new(1),
                watchers: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn register(&self, keys: &[Key]) -> StoreResult<WatchStream> {
        self.register_with_capacity(keys, WATCH_QUEUE_CAPACITY)
    }

    fn register_with_capacity(&self, keys: &[Key], capacity: usize) -> StoreResult<WatchStream> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        if keys.is_empty() {
            return Err(StoreError::InvalidArgument("watch needs at least one key".into()));
        }
        if keys.len() > MAX_WATCH_KEYS {
            return Err(StoreError::InvalidArgument(format!(
                "watch accepts at most {MAX_WATCH_KEYS} keys, got {}",
                keys.len()
            )));
        }

        let keys = keys
            .iter()
            .map(|k| Ok((k.clone(), k.encode()?)))
            .collect::<StoreResult<Vec<_>>>()?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity);
        let lagged = Arc::new(AtomicBool::new(false));
        self.inner.watchers.insert(
            id,
            Watcher {
                keys,
                tx,
                lagged: Arc::clone(&lagged),
            },
        );

        // `close` may have run between the check above and the insert.
        if self.is_closed() {
            self.inner.watchers.remove(&id);
            return Err(StoreError::Closed);
        }

        debug!(watch_id = id, active = self.inner.watchers.len(), "watch registered");
        Ok(WatchStream {
            id,
            rx,
            lagged,
            hub: self.clone(),
        })
    }

    pub(crate) fn unregister(&self, id: u64) {
        if self.inner.watchers.remove(&id).is_some() {
            debug!(watch_id = id, active = self.inner.watchers.len(), "watch released");
        }
    }

    /// Notify every watcher whose keys intersect `written`.
    ///
    /// `written` pairs each mutation with its encoded key. Must be called
    /// while the commit still holds the connection lock.
    pub(crate) fn publish(&self, versionstamp: Versionstamp, written: &[(&Mutation, Vec<u8>)]) {
        if written.is_empty() {
            return;
        }
        for watcher in self.inner.watchers.iter() {
            let entries: Vec<WatchEntry> = watcher
                .keys
                .iter()
                .filter_map(|(key, encoded)| {
                    // Later mutations of the same key win, as in the commit.
                    written
                        .iter()
                        .rev()
                        .find(|(_, written_key)| written_key == encoded)
                        .map(|(mutation, _)| WatchEntry {
                            key: key.clone(),
                            change: match &mutation.kind {
                                MutationKind::Set(bytes) => Change::Set(bytes.clone()),
                                MutationKind::Delete => Change::Deleted,
                            },
                        })
                })
                .collect();

            if entries.is_empty() {
                continue;
            }
            trace!(watch_id = *watcher.key(), %versionstamp, "watch event");
            let event = WatchEvent {
                versionstamp,
                entries,
            };
            match watcher.tx.try_send(event) {
                // Closed: the stream is being dropped and unregisters itself.
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    if !watcher.lagged.swap(true, Ordering::AcqRel) {
                        warn!(
                            watch_id = *watcher.key(),
                            %versionstamp,
                            "watch queue full, dropping events"
                        );
                    }
                }
            }
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.inner.watchers.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Mark closed and end every stream.
    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let released = self.inner.watchers.len();
        self.inner.watchers.clear();
        debug!(released, "watch hub closed");
    }
}

// ── stream ───────────────────────────────────────────────────────────

/// A live watch registration.
///
/// Yields events until cancelled, dropped, or the store is closed.
pub struct WatchStream {
    id: u64,
    rx: mpsc::Receiver<WatchEvent>,
    lagged: Arc<AtomicBool>,
    hub: WatchHub,
}

impl WatchStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. `None` once the watch is cancelled or the
    /// store closed.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Take an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }

    /// Whether events were dropped because the queue was full since the
    /// last call. Clears the flag.
    pub fn take_lagged(&self) -> bool {
        self.lagged.swap(false, Ordering::AcqRel)
    }

    /// A handle that can release this watch from elsewhere.
    pub fn canceller(&self) -> WatchCanceller {
        WatchCanceller {
            id: self.id,
            hub: self.hub.clone(),
        }
    }

    /// Release the watch now.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

impl Stream for WatchStream {
    type Item = WatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Releases a [`WatchStream`]'s registration without owning the stream.
///
/// After `cancel` returns, no further events are delivered and the
/// stream's `recv` drains what was already queued, then yields `None`.
#[derive(Clone)]
pub struct WatchCanceller {
    id: u64,
    hub: WatchHub,
}

impl WatchCanceller {
    pub fn cancel(&self) {
        self.hub.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &Key, value: i64) -> (Mutation, Vec<u8>) {
        (Mutation::set(key.clone(), &value).unwrap(), key.encode().unwrap())
    }

    fn publish(hub: &WatchHub, vs: u64, writes: &[(Mutation, Vec<u8>)]) {
        let refs: Vec<(&Mutation, Vec<u8>)> = writes.iter().map(|(m, k)| (m, k.clone())).collect();
        hub.publish(Versionstamp::from_raw(vs), &refs);
    }

    #[tokio::test]
    async fn only_watched_keys_are_delivered() {
        let hub = WatchHub::new();
        let a = Key::from(["a"]);
        let b = Key::from(["b"]);
        let mut stream = hub.register(std::slice::from_ref(&a)).unwrap();

        publish(&hub, 1, &[set(&b, 1)]);
        publish(&hub, 2, &[set(&a, 2), set(&b, 3)]);

        let event = stream.recv().await.unwrap();
        assert_eq!(event.versionstamp, Versionstamp::from_raw(2));
        assert_eq!(event.entries.len(), 1);
        assert_eq!(event.entries[0].key, a);
        assert_eq!(event.entries[0].value::<i64>().unwrap(), Some(2));
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn deletions_are_marked() {
        let hub = WatchHub::new();
        let a = Key::from(["a"]);
        let mut stream = hub.register(std::slice::from_ref(&a)).unwrap();

        let del = (Mutation::delete(a.clone()), a.encode().unwrap());
        publish(&hub, 4, &[del]);

        let event = stream.recv().await.unwrap();
        assert!(event.entries[0].is_deletion());
        assert_eq!(event.entries[0].value::<i64>().unwrap(), None);
    }

    #[tokio::test]
    async fn drop_unregisters() {
        let hub = WatchHub::new();
        let stream = hub.register(&[Key::from(["a"])]).unwrap();
        let other = hub.register(&[Key::from(["a"])]).unwrap();
        assert_eq!(hub.active(), 2);

        drop(stream);
        assert_eq!(hub.active(), 1);
        other.cancel();
        assert_eq!(hub.active(), 0);
    }

    #[tokio::test]
    async fn canceller_ends_stream() {
        let hub = WatchHub::new();
        let a = Key::from(["a"]);
        let mut stream = hub.register(std::slice::from_ref(&a)).unwrap();
        let canceller = stream.canceller();

        publish(&hub, 1, &[set(&a, 1)]);
        canceller.cancel();
        publish(&hub, 2, &[set(&a, 2)]);

        // The event queued before cancellation is still drained.
        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
        assert_eq!(hub.active(), 0);
    }

    #[tokio::test]
    async fn close_ends_streams_and_rejects_new_watches() {
        let hub = WatchHub::new();
        let mut stream = hub.register(&[Key::from(["a"])]).unwrap();
        hub.close();

        assert!(stream.recv().await.is_none());
        assert!(matches!(hub.register(&[Key::from(["a"])]), Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn slow_reader_lags_instead_of_growing() {
        let hub = WatchHub::new();
        let a = Key::from(["a"]);
        let mut stream = hub.register_with_capacity(std::slice::from_ref(&a), 2).unwrap();

        for vs in 1..=5 {
            publish(&hub, vs, &[set(&a, vs as i64)]);
        }
        assert!(stream.take_lagged());
        assert!(!stream.take_lagged());

        // The queued prefix survives in order; the overflow is gone.
        assert_eq!(stream.recv().await.unwrap().versionstamp, Versionstamp::from_raw(1));
        assert_eq!(stream.recv().await.unwrap().versionstamp, Versionstamp::from_raw(2));
        assert!(stream.try_recv().is_none());

        // Once drained, delivery resumes.
        publish(&hub, 6, &[set(&a, 6)]);
        assert_eq!(stream.recv().await.unwrap().versionstamp, Versionstamp::from_raw(6));
        assert!(!stream.take_lagged());
    }

    #[test]
    fn key_count_is_bounded() {
        let hub = WatchHub::new();
        assert!(hub.register(&[]).is_err());
        let keys: Vec<Key> = (0..=MAX_WATCH_KEYS as i64).map(|i| Key::from([i])).collect();
        assert!(matches!(hub.register(&keys), Err(StoreError::InvalidArgument(_))));
    }
}
