//! Coalescing cache in front of a [`Generator`].
//!
//! Every key moves through `absent → in-flight → {cached | absent}`. While a
//! key is in flight, its waiters are parked in a registry and any new caller
//! for that key joins them instead of starting another computation. Cached
//! values are never replaced. Failures leave the key absent, so the next
//! caller retries.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::dispatch;
use crate::error::{EmbeddingError, Result};
use crate::generator::Generator;

/// What a waiter receives once its key's batch completes.
pub(crate) type Delivery<V> = std::result::Result<V, Arc<EmbeddingError>>;

type Waiter<V> = oneshot::Sender<Delivery<V>>;

/// Cache and waiter registry. Only ever touched under [`Shared::lock`].
pub(crate) struct State<K, V> {
    cache: HashMap<K, V>,
    waiting: HashMap<K, Vec<Waiter<V>>>,
    hits: u64,
    misses: u64,
    coalesced: u64,
    batches_dispatched: u64,
    batches_failed: u64,
}

impl<K, V> State<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn new() -> Self {
        Self {
            cache: HashMap::new(),
            waiting: HashMap::new(),
            hits: 0,
            misses: 0,
            coalesced: 0,
            batches_dispatched: 0,
            batches_failed: 0,
        }
    }

    /// Publish the outcome of a batch to every waiter of its keys and drop
    /// the keys from the registry.
    ///
    /// On success the key moves to the cache in the same step, so no caller
    /// can observe it as both cached and in flight.
    pub(crate) fn complete(&mut self, keys: Vec<K>, outcome: Delivery<Vec<V>>) {
        match outcome {
            Ok(outputs) => {
                for (key, output) in keys.into_iter().zip(outputs) {
                    let waiters = self.waiting.remove(&key).unwrap_or_default();
                    notify(waiters, &Ok(output.clone()));
                    self.cache.insert(key, output);
                }
            }
            Err(err) => {
                self.batches_failed += 1;
                let delivery = Err(err);
                for key in keys {
                    let waiters = self.waiting.remove(&key).unwrap_or_default();
                    notify(waiters, &delivery);
                }
            }
        }
    }
}

fn notify<V: Clone>(waiters: Vec<Waiter<V>>, delivery: &Delivery<V>) {
    for waiter in waiters {
        // The caller went away; its slot is simply discarded.
        if waiter.send(delivery.clone()).is_err() {
            trace!("Dropping delivery for abandoned waiter");
        }
    }
}

/// State shared between the cache handle and its dispatch loop.
pub(crate) struct Shared<G: Generator> {
    pub(crate) generator: G,
    state: Mutex<State<G::Key, G::Output>>,
}

impl<G: Generator> Shared<G> {
    fn new(generator: G) -> Self {
        Self {
            generator,
            state: Mutex::new(State::new()),
        }
    }

    /// Lock the cache state. The guard must never be held across an await.
    pub(crate) fn lock(&self) -> MutexGuard<'_, State<G::Key, G::Output>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A per-call result slot.
enum Slot<V> {
    /// Cache hit, bound while registering.
    Ready(V),
    /// Waiting on a batch.
    Pending(oneshot::Receiver<Delivery<V>>),
}

impl<V> Slot<V> {
    async fn wait(self) -> Result<V> {
        match self {
            Slot::Ready(value) => Ok(value),
            Slot::Pending(rx) => match rx.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(EmbeddingError::from_batch(err)),
                // The registry itself was torn down with the runtime.
                Err(_) => Err(EmbeddingError::Shutdown),
            },
        }
    }
}

/// Statistics about the coalescing cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cached keys.
    pub entries: usize,

    /// Number of keys currently being generated.
    pub in_flight: usize,

    /// Number of callers waiting on in-flight keys.
    pub waiters: usize,

    /// Keys answered from the cache.
    pub hits: u64,

    /// Keys that had to be generated.
    pub misses: u64,

    /// Keys that joined an in-flight computation.
    pub coalesced: u64,

    /// Batches handed to the dispatch loop.
    pub batches_dispatched: u64,

    /// Batches that failed, including those failed by shutdown.
    pub batches_failed: u64,
}

/// A [`Generator`] wrapper that caches outputs and coalesces concurrent
/// requests for the same key into a single generator call.
///
/// Construction spawns the dispatch loop, so it must happen inside a Tokio
/// runtime. The loop stops when [`CachedGenerator::shutdown`] is called, when
/// the cancellation token passed to [`CachedGenerator::with_config`] (or its
/// parent) is cancelled, or when the handle is dropped.
pub struct CachedGenerator<G: Generator> {
    shared: Arc<Shared<G>>,
    batches: mpsc::UnboundedSender<Vec<G::Key>>,
    shutdown: CancellationToken,
    config: CacheConfig,
}

impl<G: Generator> CachedGenerator<G> {
    /// Create a cache with default configuration and its own lifetime scope.
    pub fn new(generator: G) -> Self {
        Self::with_config(generator, CacheConfig::default(), CancellationToken::new())
    }

    /// Create a cache bound to `shutdown`.
    ///
    /// Cancelling `shutdown` stops the dispatch loop. Shutting down the cache
    /// does not cancel `shutdown` itself.
    pub fn with_config(generator: G, config: CacheConfig, shutdown: CancellationToken) -> Self {
        let shared = Arc::new(Shared::new(generator));
        let shutdown = shutdown.child_token();
        let (batches, rx) = mpsc::unbounded_channel();

        tokio::spawn(dispatch::run(Arc::clone(&shared), rx, shutdown.clone()));

        Self {
            shared,
            batches,
            shutdown,
            config,
        }
    }

    /// Resolve `keys` to outputs, in order.
    ///
    /// Fails with the first error among the keys, in key order. Use
    /// [`CachedGenerator::resolve_each`] to get per-key outcomes instead.
    pub async fn resolve(&self, keys: &[G::Key]) -> Result<Vec<G::Output>> {
        let slots = self.request(keys)?;

        let mut outputs = Vec::with_capacity(slots.len());
        for slot in slots {
            outputs.push(slot.wait().await?);
        }
        Ok(outputs)
    }

    /// Resolve `keys` and report an outcome per key.
    ///
    /// The outer error is only returned for invalid input.
    pub async fn resolve_each(&self, keys: &[G::Key]) -> Result<Vec<Result<G::Output>>> {
        let slots = self.request(keys)?;

        let mut outcomes = Vec::with_capacity(slots.len());
        for slot in slots {
            outcomes.push(slot.wait().await);
        }
        Ok(outcomes)
    }

    /// Bind cache hits, join in-flight keys and dispatch the rest.
    fn request(&self, keys: &[G::Key]) -> Result<Vec<Slot<G::Output>>> {
        if keys.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut guard = self.shared.lock();
        let state = &mut *guard;

        let mut slots = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();

        for key in keys {
            if let Some(output) = state.cache.get(key) {
                state.hits += 1;
                slots.push(Slot::Ready(output.clone()));
                continue;
            }

            let (tx, rx) = oneshot::channel();
            match state.waiting.get_mut(key) {
                Some(waiters) => {
                    state.coalesced += 1;
                    waiters.push(tx);
                }
                None => {
                    state.misses += 1;
                    state.waiting.insert(key.clone(), vec![tx]);
                    missing.push(key.clone());
                }
            }
            slots.push(Slot::Pending(rx));
        }

        if missing.is_empty() {
            return Ok(slots);
        }

        let batches: Vec<Vec<G::Key>> = match self.config.max_batch_size {
            Some(max) if missing.len() > max => {
                missing.chunks(max.max(1)).map(<[_]>::to_vec).collect()
            }
            _ => vec![missing],
        };

        for batch in batches {
            debug!(
                "Dispatching {} keys to {}",
                batch.len(),
                self.shared.generator.name()
            );
            match self.batches.send(batch) {
                Ok(()) => state.batches_dispatched += 1,
                Err(mpsc::error::SendError(batch)) => {
                    warn!("Dispatch loop has stopped, failing {} keys", batch.len());
                    state.complete(batch, Err(Arc::new(EmbeddingError::Shutdown)));
                }
            }
        }

        Ok(slots)
    }

    /// Check if a key is cached.
    pub fn contains(&self, key: &G::Key) -> bool {
        self.shared.lock().cache.contains_key(key)
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.shared.lock().cache.len()
    }

    /// Whether nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let state = self.shared.lock();
        CacheStats {
            entries: state.cache.len(),
            in_flight: state.waiting.len(),
            waiters: state.waiting.values().map(Vec::len).sum(),
            hits: state.hits,
            misses: state.misses,
            coalesced: state.coalesced,
            batches_dispatched: state.batches_dispatched,
            batches_failed: state.batches_failed,
        }
    }

    /// Stop the dispatch loop.
    ///
    /// Waiters of queued and in-flight batches receive
    /// [`EmbeddingError::Shutdown`]. Cached keys can still be resolved.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether the cache has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Get the wrapped generator.
    pub fn generator(&self) -> &G {
        &self.shared.generator
    }

    /// Get the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

#[async_trait]
impl<G: Generator> Generator for CachedGenerator<G> {
    type Key = G::Key;
    type Output = G::Output;

    fn name(&self) -> &str {
        self.shared.generator.name()
    }

    async fn generate(&self, keys: &[Self::Key]) -> Result<Vec<Self::Output>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.resolve(keys).await
    }
}
