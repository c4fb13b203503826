use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::config::CacheConfig;
use crate::utils::Timestamp;

use super::{CacheEntry, UsageAggregator};

/// The outcome of looking a key up in the [`TtlCache`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheLookup {
    /// An unexpired entry.
    Hit(CacheEntry),
    /// There is no entry for this key.
    Miss,
    /// There was an entry, but it expired. It has been removed from the cache.
    Expired(CacheEntry),
}

/// Key to [`CacheEntry`] map with differentiated expiry for positive and negative answers.
///
/// This never fails. Expired entries are evicted lazily on read, there is no background task
/// involved.
#[derive(Debug, Clone)]
pub struct TtlCache {
    entries: HashMap<String, CacheEntry>,
    positive_ttl: Duration,
    negative_ttl: Duration,
}

impl TtlCache {
    pub fn new(config: &CacheConfig) -> Self {
        // A zero TTL would create entries that are expired the moment they are written.
        let min_ttl = Duration::from_millis(1);
        Self {
            entries: HashMap::new(),
            positive_ttl: config.positive_ttl.max(min_ttl),
            negative_ttl: config.negative_ttl.max(min_ttl),
        }
    }

    /// Looks up `key`, evicting the entry if it expired at `now`.
    pub fn lookup(&mut self, key: &str, now: Timestamp) -> CacheLookup {
        match self.entries.get(key) {
            None => return CacheLookup::Miss,
            Some(entry) if !entry.is_expired(now) => return CacheLookup::Hit(entry.clone()),
            Some(_) => {}
        }

        match self.entries.remove(key) {
            Some(entry) => {
                tracing::trace!(key, "Evicting expired cache entry");
                CacheLookup::Expired(entry)
            }
            None => CacheLookup::Miss,
        }
    }

    /// Returns the unexpired entry for `key`.
    ///
    /// An expired entry found during the lookup is removed. Callers that keep a
    /// [`UsageAggregator`] in sync should use [`lookup`](Self::lookup) instead, which reports
    /// the eviction.
    pub fn get(&mut self, key: &str, now: Timestamp) -> Option<CacheEntry> {
        match self.lookup(key, now) {
            CacheLookup::Hit(entry) => Some(entry),
            CacheLookup::Miss | CacheLookup::Expired(_) => None,
        }
    }

    /// Stores the answer for `key`, replacing any previous entry.
    ///
    /// Returns the replaced entry, regardless of whether it was expired.
    pub fn put(&mut self, key: String, value: Option<String>, now: Timestamp) -> Option<CacheEntry> {
        let ttl = match value {
            Some(_) => self.positive_ttl,
            None => self.negative_ttl,
        };
        let ttl_millis = Timestamp::try_from(ttl.as_millis()).unwrap_or(Timestamp::MAX);
        let entry = CacheEntry {
            value,
            expires_at: now.saturating_add(ttl_millis),
            cached_at: now,
        };
        self.entries.insert(key, entry)
    }

    /// Replaces the contents of this cache with the unexpired entries of `snapshot`.
    ///
    /// Entries that expired at or before `now` are dropped right away. The survivors are fed
    /// into `usage`. Returns the number of entries loaded.
    pub fn load_from<I>(&mut self, snapshot: I, now: Timestamp, usage: &mut UsageAggregator) -> usize
    where
        I: IntoIterator<Item = (String, CacheEntry)>,
    {
        self.entries.clear();
        usage.clear();

        let mut dropped = 0;
        for (key, entry) in snapshot {
            // Entries written by older or foreign writers may violate the invariant.
            if entry.is_expired(now) || entry.expires_at <= entry.cached_at {
                dropped += 1;
                continue;
            }
            if let Some(value) = &entry.value {
                usage.insert(&key, value);
            }
            self.entries.insert(key, entry);
        }

        tracing::debug!(
            loaded = self.entries.len(),
            dropped,
            "Loaded persisted cache entries"
        );
        self.entries.len()
    }

    /// Removes all entries that expired at `now`, returning them.
    pub fn sweep_expired(&mut self, now: Timestamp) -> Vec<(String, CacheEntry)> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|entry| (key, entry)))
            .collect()
    }

    /// A copy of all entries, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, CacheEntry> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: u64 = 24 * 3600 * 1000;

    fn cache() -> TtlCache {
        TtlCache::new(&CacheConfig {
            positive_ttl: Duration::from_millis(30 * DAY),
            negative_ttl: Duration::from_millis(DAY),
        })
    }

    #[test]
    fn test_get_before_and_after_expiry() {
        let mut cache = cache();
        let now = 1_000;
        cache.put("alice".into(), Some("France".into()), now);

        let entry = cache.get("alice", now + 30 * DAY - 1).unwrap();
        assert_eq!(entry.value.as_deref(), Some("France"));
        assert_eq!(entry.cached_at, now);
        assert_eq!(entry.expires_at, now + 30 * DAY);

        assert_eq!(cache.get("alice", now + 30 * DAY), None);
        // the expired entry was evicted by the read
        assert!(cache.is_empty());
    }

    #[test]
    fn test_negative_expires_first() {
        let mut cache = cache();
        let now = 5_000;
        cache.put("bob".into(), None, now);
        cache.put("carol".into(), Some("Peru".into()), now);

        let bob = cache.get("bob", now).unwrap();
        let carol = cache.get("carol", now).unwrap();
        assert!(bob.expires_at < carol.expires_at);

        let later = now + DAY;
        assert_eq!(cache.get("bob", later), None);
        assert!(cache.get("carol", later).is_some());
    }

    #[test]
    fn test_put_overwrites() {
        let mut cache = cache();
        assert_eq!(cache.put("alice".into(), None, 1), None);
        let previous = cache.put("alice".into(), Some("Chile".into()), 2).unwrap();
        assert_eq!(previous.value, None);

        let entry = cache.get("alice", 3).unwrap();
        assert_eq!(entry.value.as_deref(), Some("Chile"));
        assert_eq!(entry.cached_at, 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lookup_reports_eviction() {
        let mut cache = cache();
        cache.put("alice".into(), Some("France".into()), 0);

        assert_eq!(cache.lookup("nobody", 0), CacheLookup::Miss);
        assert!(matches!(cache.lookup("alice", 1), CacheLookup::Hit(_)));
        match cache.lookup("alice", 30 * DAY) {
            CacheLookup::Expired(entry) => assert_eq!(entry.value.as_deref(), Some("France")),
            other => panic!("unexpected lookup: {other:?}"),
        }
        assert_eq!(cache.lookup("alice", 30 * DAY), CacheLookup::Miss);
    }

    #[test]
    fn test_load_drops_expired() {
        let mut cache = cache();
        let mut usage = UsageAggregator::default();
        let now = 10 * DAY;

        let snapshot = vec![
            (
                "alice".to_owned(),
                CacheEntry {
                    value: Some("France".into()),
                    expires_at: now + 1,
                    cached_at: now - 1,
                },
            ),
            (
                "bob".to_owned(),
                CacheEntry {
                    value: Some("France".into()),
                    expires_at: now,
                    cached_at: now - DAY,
                },
            ),
            (
                "carol".to_owned(),
                CacheEntry {
                    value: None,
                    expires_at: now + DAY,
                    cached_at: now,
                },
            ),
        ];

        assert_eq!(cache.load_from(snapshot, now, &mut usage), 2);
        assert!(cache.get("bob", now).is_none());
        assert!(cache.get("carol", now).is_some());
        assert_eq!(usage.count("France"), 1);
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let mut cache = TtlCache::new(&CacheConfig {
            positive_ttl: Duration::MAX,
            negative_ttl: Duration::from_millis(DAY),
        });
        cache.put("alice".into(), Some("France".into()), 1_000);

        let entry = cache.get("alice", Timestamp::MAX - 1).unwrap();
        assert_eq!(entry.expires_at, Timestamp::MAX);
    }

    #[test]
    fn test_sweep_expired() {
        let mut cache = cache();
        cache.put("a".into(), None, 0);
        cache.put("b".into(), Some("x".into()), 0);

        let swept = cache.sweep_expired(DAY);
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0, "a");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.snapshot().keys().collect::<Vec<_>>(), vec!["b"]);
    }
}
