//! # Locator service
//!
//! Resolves short opaque keys to a textual value through a slow, rate-limited remote lookup
//! service. Answers are served from an in-memory TTL cache whenever possible, concurrent
//! requests for the same key share a single remote call, remote calls are paced through a
//! bounded FIFO queue with exponential backoff on throttling, and the cache is mirrored to
//! durable storage.
//!
//! The entry point is [`ResolverService`](service::ResolverService).

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod display;
pub mod logging;
pub mod persistence;
pub mod queue;
pub mod remote;
pub mod service;
pub mod singleflight;
pub mod utils;

#[cfg(test)]
mod test;

pub use caching::ResolveError;
pub use service::{LocationInfo, ResolverService};
