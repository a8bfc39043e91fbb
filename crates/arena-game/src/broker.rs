//! Live views built on store watches.
//!
//! A [`Broker`] turns "one of these keys changed" into "here is the current
//! view", and shares the work between every subscriber of the same topic:
//!
//! ```text
//!   subscribe(t) ──► topics[t] ──► one WatchStream on the source's keys
//!                       │                   │ event
//!                       │                   ▼
//!                       │         pump: debounce, drain, derive
//!                       │                   │
//!                       └── watch::Receiver ◄┘ Slot::Ready(view)
//!                              ▲    ▲    ▲
//!                       Subscription × N
//! ```
//!
//! The store watch is registered before the first view is derived, so a
//! commit racing `subscribe` is either in the initial view or triggers a
//! re-derive. Views are re-read from the store on every change; watch
//! payloads are only a signal. Subscribers see the latest view and may skip
//! intermediate ones.
//!
//! The last subscriber to leave a topic releases its store watch before
//! `drop` returns. The pump is aborted at the same time, but abort only
//! takes effect at its next await: a derive already reading the store
//! finishes that read, and its view is discarded.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arena_store::{Key, Kv, WatchCanceller, WatchStream};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::Stream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use crate::error::{GameError, GameResult};
use crate::games::GameStore;
use crate::index;
use crate::types::Game;

// ── sources ──────────────────────────────────────────────────────────

/// Describes one family of live views.
#[async_trait]
pub trait ViewSource: Send + Sync + 'static {
    type Topic: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static;
    type View: Send + Sync + 'static;

    /// Keys whose changes invalidate the view of `topic`.
    fn watch_keys(&self, topic: &Self::Topic) -> Vec<Key>;

    /// Read the current view of `topic` from the store.
    async fn derive(&self, topic: &Self::Topic) -> GameResult<Self::View>;
}

/// In-progress games of one user, refreshed whenever any of them changes.
pub struct PlayerGamesSource {
    games: GameStore,
}

impl PlayerGamesSource {
    pub fn new(games: GameStore) -> Self {
        Self { games }
    }
}

#[async_trait]
impl ViewSource for PlayerGamesSource {
    type Topic = String;
    type View = Vec<Game>;

    fn watch_keys(&self, user_id: &String) -> Vec<Key> {
        vec![index::games_updated_key(user_id)]
    }

    async fn derive(&self, user_id: &String) -> GameResult<Vec<Game>> {
        self.games.list_in_progress_by_player(user_id).await
    }
}

/// A single game record.
pub struct GameSource {
    games: GameStore,
}

impl GameSource {
    pub fn new(games: GameStore) -> Self {
        Self { games }
    }
}

#[async_trait]
impl ViewSource for GameSource {
    type Topic = String;
    type View = Game;

    fn watch_keys(&self, game_id: &String) -> Vec<Key> {
        vec![index::game_key(game_id)]
    }

    async fn derive(&self, game_id: &String) -> GameResult<Game> {
        self.games
            .get(game_id)
            .await?
            .ok_or_else(|| GameError::NotFound {
                entity: "game",
                id: game_id.clone(),
            })
    }
}

// ── broker ───────────────────────────────────────────────────────────

/// What a topic currently publishes.
enum Slot<V> {
    /// The first view is still being derived.
    Pending,
    Ready(Arc<V>),
    /// Deriving failed; the topic has ended.
    Failed(String),
    /// The store was closed; the topic has ended.
    Closed,
}

impl<V> Clone for Slot<V> {
    fn clone(&self) -> Self {
        match self {
            Slot::Pending => Slot::Pending,
            Slot::Ready(view) => Slot::Ready(Arc::clone(view)),
            Slot::Failed(reason) => Slot::Failed(reason.clone()),
            Slot::Closed => Slot::Closed,
        }
    }
}

struct Topic<V> {
    generation: u64,
    subscribers: usize,
    rx: watch::Receiver<Slot<V>>,
    canceller: WatchCanceller,
    pump: JoinHandle<()>,
}

impl<V> Topic<V> {
    /// Release the watch now; the pump stops at its next await.
    fn shutdown(self) {
        self.canceller.cancel();
        self.pump.abort();
    }
}

struct BrokerInner<S: ViewSource> {
    kv: Kv,
    source: Arc<S>,
    debounce: Duration,
    topics: DashMap<S::Topic, Topic<S::View>>,
    generations: AtomicU64,
}

/// Fan-out of live views for one [`ViewSource`].
pub struct Broker<S: ViewSource> {
    inner: Arc<BrokerInner<S>>,
}

impl<S: ViewSource> Clone for Broker<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ViewSource> Broker<S> {
    /// `debounce` is how long a pump waits after a change before
    /// re-deriving, so bursts of commits produce one view.
    pub fn new(kv: Kv, source: S, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                kv,
                source: Arc::new(source),
                debounce,
                topics: DashMap::new(),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to `topic`, sharing the store watch with any existing
    /// subscribers.
    pub fn subscribe(&self, topic: S::Topic) -> GameResult<Subscription<S::View>> {
        let (generation, mut rx) = match self.inner.topics.entry(topic.clone()) {
            Entry::Occupied(mut entry) if !entry.get().pump.is_finished() => {
                let live = entry.get_mut();
                live.subscribers += 1;
                (live.generation, live.rx.clone())
            }
            Entry::Occupied(mut entry) => {
                // The previous pump ended (failure or store closed); start over.
                let fresh = self.inner.start(&topic)?;
                let handle = (fresh.generation, fresh.rx.clone());
                entry.insert(fresh).shutdown();
                handle
            }
            Entry::Vacant(entry) => {
                let fresh = self.inner.start(&topic)?;
                let handle = (fresh.generation, fresh.rx.clone());
                entry.insert(fresh);
                handle
            }
        };
        // Deliver whatever the topic already holds on the first `next`.
        rx.mark_changed();

        let inner = Arc::clone(&self.inner);
        Ok(Subscription {
            rx,
            release: Some(Box::new(move || inner.release(&topic, generation))),
            done: false,
        })
    }

    /// Distinct topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.inner.topics.len()
    }

    pub fn subscriber_count(&self, topic: &S::Topic) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|t| t.subscribers)
            .unwrap_or(0)
    }
}

impl<S: ViewSource> BrokerInner<S> {
    fn start(&self, topic: &S::Topic) -> GameResult<Topic<S::View>> {
        let keys = self.source.watch_keys(topic);
        let stream = self.kv.watch(&keys)?;
        let canceller = stream.canceller();
        let (tx, rx) = watch::channel(Slot::Pending);

        let span = tracing::debug_span!("live_view", %topic);
        let pump = tokio::spawn(
            pump(
                Arc::clone(&self.source),
                topic.clone(),
                stream,
                tx,
                self.debounce,
            )
            .instrument(span),
        );

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        debug!(%topic, generation, "live view started");
        Ok(Topic {
            generation,
            subscribers: 1,
            rx,
            canceller,
            pump,
        })
    }

    fn release(&self, topic: &S::Topic, generation: u64) {
        let Entry::Occupied(mut entry) = self.topics.entry(topic.clone()) else {
            return;
        };
        // A newer topic replaced the one this subscriber belonged to.
        if entry.get().generation != generation {
            return;
        }
        let live = entry.get_mut();
        live.subscribers -= 1;
        if live.subscribers == 0 {
            entry.remove().shutdown();
            debug!(%topic, generation, "live view released");
        }
    }
}

async fn pump<S: ViewSource>(
    source: Arc<S>,
    topic: S::Topic,
    mut stream: WatchStream,
    tx: watch::Sender<Slot<S::View>>,
    debounce: Duration,
) {
    loop {
        match source.derive(&topic).await {
            Ok(view) => {
                tx.send_replace(Slot::Ready(Arc::new(view)));
            }
            Err(err) => {
                warn!(%err, "deriving live view failed; ending topic");
                tx.send_replace(Slot::Failed(err.to_string()));
                return;
            }
        }

        if stream.recv().await.is_none() {
            debug!("store watch ended");
            tx.send_replace(Slot::Closed);
            return;
        }
        if !debounce.is_zero() {
            tokio::time::sleep(debounce).await;
        }
        let mut coalesced = 0_usize;
        while stream.try_recv().is_some() {
            coalesced += 1;
        }
        if coalesced > 0 {
            debug!(coalesced, "coalesced change events");
        }
        // Dropped events need no replay: the next derive re-reads the store.
        if stream.take_lagged() {
            debug!("store watch lagged");
        }
    }
}

// ── subscriptions ────────────────────────────────────────────────────

/// A cancellable handle on a live view.
///
/// Dropping it (or calling [`Subscription::cancel`]) leaves the topic. When
/// it was the last subscriber, the store watch is gone once the drop
/// returns; a derive that was already running may still complete its store
/// read in the background.
pub struct Subscription<V> {
    rx: watch::Receiver<Slot<V>>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
    done: bool,
}

impl<V> Subscription<V> {
    /// The latest view, waiting for a change if it was already seen.
    ///
    /// A failed derive is reported once as `Some(Err(_))`; after that, and
    /// after the store closes, this returns `None`.
    pub async fn next(&mut self) -> Option<GameResult<Arc<V>>> {
        while !self.done {
            if self.rx.changed().await.is_err() {
                self.done = true;
                break;
            }
            let slot = self.rx.borrow_and_update().clone();
            match slot {
                Slot::Pending => continue,
                Slot::Ready(view) => return Some(Ok(view)),
                Slot::Failed(reason) => {
                    self.done = true;
                    return Some(Err(GameError::SubscriptionFailed(reason)));
                }
                Slot::Closed => self.done = true,
            }
        }
        None
    }

    /// Leave the topic now.
    pub fn cancel(self) {
        drop(self);
    }

    /// Adapt into a [`Stream`] of views, e.g. for a server-sent-events body.
    pub fn into_stream(self) -> impl Stream<Item = GameResult<Arc<V>>> + Send
    where
        V: Send + Sync + 'static,
    {
        futures::stream::unfold(self, |mut sub| async move {
            let item = sub.next().await?;
            Some((item, sub))
        })
    }
}

impl<V> Drop for Subscription<V> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

// ── bundle ───────────────────────────────────────────────────────────

/// The two live views the game needs, over one store.
#[derive(Clone)]
pub struct LiveUpdates {
    pub player_games: Broker<PlayerGamesSource>,
    pub game: Broker<GameSource>,
}

impl LiveUpdates {
    pub fn new(kv: Kv, debounce: Duration) -> Self {
        let games = GameStore::new(kv.clone());
        Self {
            player_games: Broker::new(kv.clone(), PlayerGamesSource::new(games.clone()), debounce),
            game: Broker::new(kv, GameSource::new(games), debounce),
        }
    }

    /// In-progress games of `user_id`, pushed on every change.
    pub fn subscribe_player_games(&self, user_id: &str) -> GameResult<Subscription<Vec<Game>>> {
        self.player_games.subscribe(user_id.to_string())
    }

    /// One game, pushed on every change.
    pub fn subscribe_game(&self, game_id: &str) -> GameResult<Subscription<Game>> {
        self.game.subscribe(game_id.to_string())
    }
}
