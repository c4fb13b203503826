//! Deduplication of concurrent resolutions of the same key.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared, TryFutureExt};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};

use crate::caching::ResolveError;
use crate::utils::defer::defer;

type ComputationChannel<T> = Shared<oneshot::Receiver<Result<T, ResolveError>>>;
type ComputationMap<T> = Arc<Mutex<BTreeMap<String, ComputationChannel<T>>>>;

/// Makes sure that only one computation per key is running at any time.
///
/// Callers asking for a key that is already being computed are handed the same shared channel
/// and observe the identical outcome.
pub struct Deduplicator<T> {
    current_computations: ComputationMap<T>,
}

impl<T> std::fmt::Debug for Deduplicator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let running = self
            .current_computations
            .try_lock()
            .map(|c| c.len())
            .unwrap_or_default();
        f.debug_struct("Deduplicator")
            .field("running computations", &running)
            .finish()
    }
}

impl<T> Clone for Deduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            current_computations: Arc::clone(&self.current_computations),
        }
    }
}

impl<T> Default for Deduplicator<T> {
    fn default() -> Self {
        Self {
            current_computations: Default::default(),
        }
    }
}

impl<T> Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a computation for `key` is currently running.
    pub fn is_pending(&self, key: &str) -> bool {
        self.current_computations.lock().contains_key(key)
    }

    /// The number of running computations.
    pub fn len(&self) -> usize {
        self.current_computations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves `key`, computing it with `producer` unless a computation is already running.
    ///
    /// `producer` is only invoked when no computation for `key` is registered. Its future is
    /// spawned right away, so it makes progress even if the returned future is never polled.
    ///
    /// NOTE: This function itself is *not* `async`: the check and the registration happen
    /// eagerly, under one lock, before the caller gets to await anything.
    pub fn resolve<F, Fut>(&self, key: &str, producer: F) -> BoxFuture<'static, Result<T, ResolveError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResolveError>> + Send + 'static,
    {
        let channel = {
            let mut current_computations = self.current_computations.lock();
            if let Some(channel) = current_computations.get(key) {
                // A concurrent resolution was deduplicated.
                metric!(counter("resolver.singleflight.hit") += 1);
                channel.clone()
            } else {
                metric!(counter("resolver.singleflight.miss") += 1);
                let channel = self.create_channel(key.to_owned(), producer());
                let evicted = current_computations.insert(key.to_owned(), channel.clone());
                debug_assert!(evicted.is_none());
                channel
            }
        };

        let future = channel.unwrap_or_else(|_cancelled| Err(ResolveError::Cancelled));
        Box::pin(future)
    }

    /// Spawns `computation` and returns a shareable channel for its outcome.
    fn create_channel<Fut>(&self, key: String, computation: Fut) -> ComputationChannel<T>
    where
        Fut: Future<Output = Result<T, ResolveError>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let current_computations = Arc::clone(&self.current_computations);
        let remove_computation_token = defer(move || {
            current_computations.lock().remove(&key);
        });

        let channel = async move {
            let result = computation.await;
            // Drop the token first to evict from the map. This ensures that callers either
            // get a channel that will receive data, or they create a new channel.
            remove_computation_token.run();
            sender.send(result).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(channel);

        receiver.shared()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        locator_test::setup();

        let dedup = Deduplicator::<Option<String>>::new();
        let computations = Arc::new(AtomicUsize::new(0));

        let futures: Vec<_> = (0..10)
            .map(|_| {
                let computations = Arc::clone(&computations);
                dedup.resolve("alice", move || {
                    computations.fetch_add(1, Ordering::SeqCst);
                    async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Some("France".to_owned()))
                    }
                })
            })
            .collect();

        assert!(dedup.is_pending("alice"));
        let results = join_all(futures).await;

        assert_eq!(computations.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result, Ok(Some("France".to_owned())));
        }
        assert!(dedup.is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_unregistered() {
        locator_test::setup();

        let dedup = Deduplicator::<Option<String>>::new();
        let first = dedup.resolve("bob", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(ResolveError::QueueFull)
        });
        let second = dedup.resolve("bob", || async { Ok(None) });

        assert_eq!(first.await, Err(ResolveError::QueueFull));
        assert_eq!(second.await, Err(ResolveError::QueueFull));
        assert!(!dedup.is_pending("bob"));

        // the key is free again, so a new computation runs
        let third = dedup.resolve("bob", || async { Ok(None) }).await;
        assert_eq!(third, Ok(None));
    }

    #[tokio::test]
    async fn test_different_keys_do_not_share() {
        locator_test::setup();

        let dedup = Deduplicator::<u32>::new();
        let a = dedup.resolve("a", || async { Ok(1) });
        let b = dedup.resolve("b", || async { Ok(2) });
        assert_eq!(dedup.len(), 2);
        assert_eq!((a.await, b.await), (Ok(1), Ok(2)));
    }

    #[tokio::test]
    async fn test_panicking_computation_is_cancelled() {
        locator_test::setup();

        async fn explode() -> Result<u32, ResolveError> {
            panic!("computation exploded")
        }

        let dedup = Deduplicator::<u32>::new();
        let result = dedup.resolve("boom", explode).await;
        assert_eq!(result, Err(ResolveError::Cancelled));
        assert!(!dedup.is_pending("boom"));
    }
}
