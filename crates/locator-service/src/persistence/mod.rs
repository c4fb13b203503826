//! Durable storage of the resolver state.
//!
//! Two records are kept: [`CACHE_RECORD`] maps every cached key to its [`CacheEntry`] and
//! [`COUNTS_RECORD`] maps values to the number of keys resolving to them. The key sets behind
//! the counts are never persisted.
//!
//! [`CacheEntry`]: crate::caching::CacheEntry

use std::sync::Arc;

use crate::config::PersistenceConfig;

mod gateway;
mod storage;

pub use gateway::{
    CACHE_RECORD, COUNTS_RECORD, FlushStatus, PersistedState, PersistenceGateway, SnapshotFn,
};
pub use storage::{DurableStorage, FsStorage, MemoryStorage, StorageError};

/// Creates the storage configured in `config`.
///
/// Without a `storage_dir`, state is only kept for the lifetime of the process.
pub fn storage_from_config(config: &PersistenceConfig) -> Arc<dyn DurableStorage> {
    match &config.storage_dir {
        Some(dir) => Arc::new(FsStorage::new(dir.clone())),
        None => Arc::new(MemoryStorage::new()),
    }
}
