use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::caching::CacheEntry;
use crate::config::PersistenceConfig;

use super::{DurableStorage, StorageError};

/// Name of the record holding the cache entries.
pub const CACHE_RECORD: &str = "resolver_cache";
/// Name of the record holding the usage counts.
pub const COUNTS_RECORD: &str = "usage_counts";

/// Everything that is mirrored to durable storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub cache: BTreeMap<String, CacheEntry>,
    pub counts: BTreeMap<String, u64>,
}

/// The result of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Both records were written.
    Written { bytes: u64 },
    /// Storage usage is over the threshold, nothing was written.
    SkippedQuota { used: u64 },
    /// The storage failed or went away, nothing was written.
    Unavailable,
}

impl FlushStatus {
    fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Written { .. } => "written",
            Self::SkippedQuota { .. } => "skipped_quota",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Produces the state to persist. Called synchronously right before every write.
pub type SnapshotFn = Arc<dyn Fn() -> PersistedState + Send + Sync>;

#[derive(Default)]
struct Timers {
    generation: u64,
    debounce: Option<JoinHandle<()>>,
    periodic: Option<JoinHandle<()>>,
    shut_down: bool,
}

struct GatewayInner {
    storage: Arc<dyn DurableStorage>,
    config: PersistenceConfig,
    snapshot: SnapshotFn,
    timers: Mutex<Timers>,
    stop_periodic: Notify,
    warned_decile: AtomicU64,
    write_lock: tokio::sync::Mutex<()>,
}

/// Mirrors the in-memory state to durable storage.
///
/// Writes are coalesced: [`schedule_flush`](Self::schedule_flush) restarts a debounce timer on
/// every call and only writes once things calm down. A periodic timer bounds staleness when
/// mutations never stop. Both timers are owned by the gateway and cancelled on
/// [`shutdown`](Self::shutdown). A flush that already started always runs to completion, so
/// the two records are never left out of sync by a cancelled timer.
///
/// Before writing, the storage usage is checked against the quota. Once usage reaches
/// `flush_threshold_percent` of the quota, flushes are skipped. A warning is logged once for
/// every 10% of the quota crossed.
///
/// Storage failures never propagate. The in-memory state stays authoritative and the next
/// timer tries again.
#[derive(Clone)]
pub struct PersistenceGateway {
    inner: Arc<GatewayInner>,
}

impl fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("config", &self.inner.config)
            .field("warned_decile", &self.inner.warned_decile)
            .finish()
    }
}

impl PersistenceGateway {
    pub fn new(
        storage: Arc<dyn DurableStorage>,
        config: PersistenceConfig,
        snapshot: SnapshotFn,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                storage,
                config,
                snapshot,
                timers: Mutex::new(Timers::default()),
                stop_periodic: Notify::new(),
                warned_decile: AtomicU64::new(0),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Reads the persisted state.
    ///
    /// Missing, unreadable or malformed records are treated as empty.
    pub async fn load(&self) -> PersistedState {
        PersistedState {
            cache: self.inner.read_record(CACHE_RECORD).await.unwrap_or_default(),
            counts: self.inner.read_record(COUNTS_RECORD).await.unwrap_or_default(),
        }
    }

    /// Writes the current state right away.
    pub async fn flush(&self) -> FlushStatus {
        self.inner.flush().await
    }

    /// Writes the current state once no further call happened for the debounce period.
    pub fn schedule_flush(&self) {
        let mut timers = self.inner.timers.lock();
        if timers.shut_down {
            return;
        }

        timers.generation += 1;
        let generation = timers.generation;
        if let Some(previous) = timers.debounce.take() {
            previous.abort();
        }

        let inner = Arc::clone(&self.inner);
        let future = async move {
            tokio::time::sleep(inner.config.debounce).await;
            {
                let mut timers = inner.timers.lock();
                if timers.generation != generation {
                    return;
                }
                // From here on the flush is no longer aborted by a newer schedule.
                timers.debounce = None;
            }
            inner.flush().await;
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        timers.debounce = Some(tokio::spawn(future));
    }

    /// Starts the periodic flush. Calling this again has no effect.
    pub fn start_periodic(&self) {
        let mut timers = self.inner.timers.lock();
        if timers.shut_down || timers.periodic.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let period = inner.config.periodic_interval;
        let future = async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                if inner.timers.lock().shut_down {
                    return;
                }
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = inner.stop_periodic.notified() => return,
                }
                if inner.timers.lock().shut_down {
                    return;
                }
                inner.flush().await;
            }
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        timers.periodic = Some(tokio::spawn(future));
    }

    /// Whether a debounced flush is waiting.
    pub fn has_scheduled_flush(&self) -> bool {
        self.inner.timers.lock().debounce.is_some()
    }

    /// Removes both records from storage.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.inner.write_lock.lock().await;
        self.inner.storage.remove(CACHE_RECORD).await?;
        self.inner.storage.remove(COUNTS_RECORD).await?;
        Ok(())
    }

    /// Cancels both timers. Explicit flushes still work afterwards.
    ///
    /// A pending debounce is aborted while it waits. The periodic task is told to stop and
    /// finishes a flush it is in the middle of.
    pub fn shutdown(&self) {
        let mut timers = self.inner.timers.lock();
        timers.shut_down = true;
        timers.periodic = None;
        // A debounce that started flushing already removed its handle.
        if let Some(debounce) = timers.debounce.take() {
            debounce.abort();
        }
        drop(timers);
        self.inner.stop_periodic.notify_waiters();
    }
}

impl GatewayInner {
    async fn read_record<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.storage.get(key).await {
            Ok(bytes) => bytes?,
            Err(StorageError::ContextInvalidated) => return None,
            Err(error) => {
                tracing::warn!(
                    record = key,
                    error = &error as &dyn std::error::Error,
                    "Failed to read persisted record"
                );
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(
                    record = key,
                    error = &error as &dyn std::error::Error,
                    "Discarding malformed persisted record"
                );
                None
            }
        }
    }

    async fn flush(&self) -> FlushStatus {
        let _guard = self.write_lock.lock().await;
        // Snapshot under the write lock, so an older snapshot never overwrites a newer one.
        // Mutations after this point are picked up by the next flush.
        let state = (self.snapshot)();
        let status = match self.write(state).await {
            Ok(status) => status,
            Err(StorageError::ContextInvalidated) => {
                tracing::debug!("Storage went away, not persisting");
                FlushStatus::Unavailable
            }
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "Failed to persist resolver state"
                );
                FlushStatus::Unavailable
            }
        };

        metric!(counter("persistence.flush") += 1, "status" => status.metrics_tag());
        status
    }

    async fn write(&self, state: PersistedState) -> Result<FlushStatus, StorageError> {
        let used = self.storage.bytes_used().await?;
        metric!(gauge("persistence.bytes_used") = used);
        self.sample_usage(used);

        if !self.within_quota(used) {
            tracing::warn!(
                used,
                quota = self.config.quota_bytes,
                "Storage usage over threshold, skipping flush"
            );
            return Ok(FlushStatus::SkippedQuota { used });
        }

        let cache = serde_json::to_vec(&state.cache)?;
        let counts = serde_json::to_vec(&state.counts)?;
        let bytes = (cache.len() + counts.len()) as u64;

        self.storage.set(CACHE_RECORD, cache).await?;
        self.storage.set(COUNTS_RECORD, counts).await?;

        tracing::debug!(entries = state.cache.len(), bytes, "Persisted resolver state");
        Ok(FlushStatus::Written { bytes })
    }

    /// `used / quota < threshold`. A zero quota means unlimited.
    fn within_quota(&self, used: u64) -> bool {
        let quota = self.config.quota_bytes;
        if quota == 0 {
            return true;
        }
        used.saturating_mul(100) / quota < u64::from(self.config.flush_threshold_percent)
    }

    /// Warns once for every 10% of the quota that usage crosses.
    fn sample_usage(&self, used: u64) {
        let quota = self.config.quota_bytes;
        if quota == 0 {
            return;
        }

        let decile = (used.saturating_mul(10) / quota).min(10);
        let previous = self.warned_decile.fetch_max(decile, Ordering::Relaxed);
        if decile > previous {
            tracing::warn!(
                used,
                quota,
                "Storage usage crossed {}% of the quota",
                decile * 10
            );
        }
    }
}
