//! The resolution facade.
//!
//! [`ResolverService`] composes the cache, the single-flight layer, the dispatch queue and the
//! persistence gateway:
//!
//! 1. An unexpired cache entry is returned right away.
//! 2. A resolution already running for the key is joined.
//! 3. Otherwise a lookup is queued. Its answer is cached, counted and scheduled for
//!    persistence. Timeouts and rejections are passed through without touching the cache.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;

use crate::caching::{CacheLookup, ResolveError, TtlCache, UsageAggregator};
use crate::config::Config;
use crate::display::{DisplayMapping, DisplayTable, display_for};
use crate::persistence::{
    DurableStorage, FlushStatus, PersistedState, PersistenceGateway, SnapshotFn,
    storage_from_config,
};
use crate::queue::{BackoffInfo, DispatchQueue, LookupOutcome};
use crate::remote::{HttpLookup, RemoteLookup};
use crate::singleflight::Deduplicator;
use crate::utils::{Timestamp, now_millis};

/// The answer for a key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LocationInfo {
    /// The raw value, `None` if there is none or it could not be resolved right now.
    pub value: Option<String>,
    /// The presentation string for `value`.
    pub display: Option<String>,
}

/// The cache and the counts derived from it. Always locked together so they never disagree.
#[derive(Debug)]
struct CacheState {
    cache: TtlCache,
    usage: UsageAggregator,
}

impl CacheState {
    fn lookup(&mut self, key: &str, now: Timestamp) -> Option<Option<String>> {
        match self.cache.lookup(key, now) {
            CacheLookup::Hit(entry) => Some(entry.value),
            CacheLookup::Expired(_) => {
                self.usage.remove(key);
                None
            }
            CacheLookup::Miss => None,
        }
    }

    fn store(&mut self, key: String, value: Option<String>, now: Timestamp) {
        match &value {
            Some(value) => self.usage.insert(&key, value),
            None => self.usage.remove(&key),
        }
        self.cache.put(key, value, now);
    }

    /// Evicts expired entries and forgets their keys in the counts.
    fn sweep_expired(&mut self, now: Timestamp) {
        for (key, _) in self.cache.sweep_expired(now) {
            self.usage.remove(&key);
        }
    }

    fn snapshot(&mut self, now: Timestamp) -> PersistedState {
        self.sweep_expired(now);
        PersistedState {
            cache: self.cache.snapshot(),
            counts: self.usage.counts(),
        }
    }
}

/// Resolves keys to values through the remote side, with caching in front of it.
///
/// Cloning is cheap and yields a handle to the same resolver.
#[derive(Clone)]
pub struct ResolverService {
    state: Arc<Mutex<CacheState>>,
    dedup: Deduplicator<Option<String>>,
    queue: DispatchQueue,
    persistence: PersistenceGateway,
    display: Arc<dyn DisplayMapping>,
}

impl std::fmt::Debug for ResolverService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverService")
            .field("dedup", &self.dedup)
            .field("queue", &self.queue)
            .field("persistence", &self.persistence)
            .finish()
    }
}

impl ResolverService {
    /// Creates a resolver with the collaborators configured in `config`.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let remote =
            HttpLookup::from_config(&config.remote).context("failed to set up remote lookup")?;
        let storage = storage_from_config(&config.persistence);
        let display = DisplayTable::new(config.display_names.clone());

        Ok(Self::new(config, Arc::new(remote), storage, Arc::new(display)).await)
    }

    /// Creates a resolver and restores the persisted state from `storage`.
    ///
    /// Persisted entries that already expired are dropped and the usage counts are rebuilt
    /// from the surviving entries.
    pub async fn new(
        config: &Config,
        remote: Arc<dyn RemoteLookup>,
        storage: Arc<dyn DurableStorage>,
        display: Arc<dyn DisplayMapping>,
    ) -> Self {
        let state = Arc::new(Mutex::new(CacheState {
            cache: TtlCache::new(&config.cache),
            usage: UsageAggregator::default(),
        }));

        let snapshot_state = Arc::clone(&state);
        let snapshot: SnapshotFn = Arc::new(move || snapshot_state.lock().snapshot(now_millis()));
        let persistence = PersistenceGateway::new(storage, config.persistence.clone(), snapshot);

        let persisted = persistence.load().await;
        let loaded = {
            let mut state = state.lock();
            let CacheState { cache, usage } = &mut *state;
            cache.load_from(persisted.cache, now_millis(), usage)
        };
        tracing::info!(loaded, "Restored resolver cache");
        persistence.start_periodic();

        Self {
            state,
            dedup: Deduplicator::new(),
            queue: DispatchQueue::new(config.queue, config.remote.timeout, remote),
            persistence,
            display,
        }
    }

    /// Resolves `key`, degrading every failure to an absent value.
    pub async fn resolve(&self, key: &str) -> LocationInfo {
        match self.try_resolve(key).await {
            Ok(info) => info,
            Err(error) => {
                tracing::debug!(key, %error, "Could not resolve key");
                LocationInfo::default()
            }
        }
    }

    /// Resolves `key`, reporting why it could not be resolved right now.
    ///
    /// A lookup that timed out resolves to an absent value without an error, but is not
    /// cached either.
    pub async fn try_resolve(&self, key: &str) -> Result<LocationInfo, ResolveError> {
        metric!(counter("resolver.access") += 1);

        if let Some(value) = self.cached(key) {
            metric!(counter("resolver.cache.hit") += 1);
            tracing::trace!(key, "Resolved from cache");
            return Ok(self.location(value));
        }
        metric!(counter("resolver.cache.miss") += 1);

        // While disabled, a pending resolution is still joined but a new one fails to enqueue.
        let outcome = self
            .dedup
            .resolve(key, || self.lookup_remote(key.to_owned()))
            .await;

        // The resolution we joined may have written the cache by now.
        if let Some(value) = self.cached(key) {
            return Ok(self.location(value));
        }
        outcome.map(|value| self.location(value))
    }

    /// Resolves all `keys` concurrently, in the order given.
    pub async fn resolve_many<I, S>(&self, keys: I) -> Vec<Result<LocationInfo, ResolveError>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys: Vec<S> = keys.into_iter().collect();
        join_all(keys.iter().map(|key| self.try_resolve(key.as_ref()))).await
    }

    fn cached(&self, key: &str) -> Option<Option<String>> {
        self.state.lock().lookup(key, now_millis())
    }

    fn location(&self, value: Option<String>) -> LocationInfo {
        let display = display_for(self.display.as_ref(), value.as_deref());
        LocationInfo { value, display }
    }

    /// Queues a remote lookup for `key` and caches its answer.
    ///
    /// The lookup is queued right away, so a full queue or a disabled resolver is reported to
    /// every waiter.
    fn lookup_remote(
        &self,
        key: String,
    ) -> impl Future<Output = Result<Option<String>, ResolveError>> + Send + 'static + use<> {
        let queued = self.queue.enqueue(&key);
        let state = Arc::clone(&self.state);
        let persistence = self.persistence.clone();

        async move {
            match queued?.await? {
                LookupOutcome::Answered(value) => {
                    state.lock().store(key, value.clone(), now_millis());
                    persistence.schedule_flush();
                    Ok(value)
                }
                LookupOutcome::TimedOut => Ok(None),
            }
        }
    }

    /// Switches remote lookups on or off. Cached answers are served either way.
    ///
    /// Disabling rejects lookups still waiting in the queue with [`ResolveError::Disabled`].
    /// A lookup already sent to the remote side completes and its answer is cached.
    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.queue.set_enabled(enabled);
        if previous != enabled {
            tracing::info!(enabled, "Remote lookups switched");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.queue.is_enabled()
    }

    /// Clears the usage counts. The cache is left alone.
    ///
    /// Counts are rebuilt from the cache when the state is restored, so this only affects the
    /// running process and what it persists.
    pub fn reset_statistics(&self) {
        self.state.lock().usage.clear();
        self.persistence.schedule_flush();
    }

    /// The number of distinct keys whose unexpired entry resolves to each value.
    pub fn counts(&self) -> BTreeMap<String, u64> {
        let mut state = self.state.lock();
        state.sweep_expired(now_millis());
        state.usage.counts()
    }

    /// The number of unexpired cache entries.
    pub fn cache_len(&self) -> usize {
        let mut state = self.state.lock();
        state.sweep_expired(now_millis());
        state.cache.len()
    }

    pub fn backoff(&self) -> BackoffInfo {
        self.queue.backoff()
    }

    /// The number of lookups waiting for dispatch.
    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    /// Persists the current state right away.
    pub async fn flush(&self) -> FlushStatus {
        self.persistence.flush().await
    }

    /// Removes all cached entries and counts, in memory and in storage.
    pub async fn clear(&self) -> FlushStatus {
        {
            let mut state = self.state.lock();
            state.cache.clear();
            state.usage.clear();
        }
        if let Err(error) = self.persistence.clear().await {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "Failed to clear persisted state"
            );
            return FlushStatus::Unavailable;
        }
        self.persistence.flush().await
    }

    /// Cancels all timers, rejects queued lookups and writes the state one last time.
    pub async fn shutdown(&self) -> FlushStatus {
        self.persistence.shutdown();
        self.queue.shutdown();
        self.persistence.flush().await
    }
}
