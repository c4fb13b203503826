//! # Caching infrastructure
//!
//! Remote lookups are slow and rate limited, so every answer the remote side gives us is kept in
//! memory and mirrored to durable storage.
//!
//! ## Cache Layers
//!
//! - The [`TtlCache`] is the authoritative in-memory layer. It is consulted first on every
//!   resolution and answers instantly when it holds an unexpired entry.
//! - The single-flight layer ([`Deduplicator`](crate::singleflight::Deduplicator)) coalesces
//!   concurrent resolutions of the same key that missed the in-memory layer.
//! - The persistence layer ([`PersistenceGateway`](crate::persistence::PersistenceGateway))
//!   writes the in-memory layer to durable storage, debounced and periodically, and loads it
//!   back on startup.
//!
//! ## Expiration
//!
//! Entries holding a value ("positive" entries) live for [`CacheConfig::positive_ttl`].
//! Entries recording that the remote side has no value for a key ("negative" entries) live for
//! the much shorter [`CacheConfig::negative_ttl`], so they get revalidated sooner.
//! Expired entries are evicted lazily when read, in bulk with [`TtlCache::sweep_expired`], and
//! dropped when loading persisted state.
//!
//! Answers that did not come from the remote side, like timeouts or rate limit rejections, are
//! never cached. They are transient and must stay retryable.
//!
//! ## Usage counts
//!
//! The [`UsageAggregator`] counts how many distinct keys currently resolve to each value. It is
//! maintained incrementally alongside the [`TtlCache`] and rebuilt from it on load. Only the
//! counts are ever persisted.
//!
//! [`CacheConfig::positive_ttl`]: crate::config::CacheConfig::positive_ttl
//! [`CacheConfig::negative_ttl`]: crate::config::CacheConfig::negative_ttl

mod aggregate;
mod entry;
mod error;
mod store;

pub use aggregate::UsageAggregator;
pub use entry::CacheEntry;
pub use error::ResolveError;
pub use store::{CacheLookup, TtlCache};
