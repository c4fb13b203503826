//! The remote lookup service and the ways to talk to it.
//!
//! The resolver only depends on the [`RemoteLookup`] trait. [`HttpLookup`] talks to an HTTP
//! endpoint, [`ChannelLookup`] hands requests to another task and correlates the answers by
//! request id.

use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;

mod channel;
mod http;

pub use channel::{ChannelLookup, LookupRequest, ResponseHandle};
pub use http::HttpLookup;

/// The user agent sent with every HTTP lookup.
pub const USER_AGENT: &str = concat!("locator/", env!("CARGO_PKG_VERSION"));

/// An answer of the remote side.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LookupResponse {
    /// The value for the requested key, `None` if the remote side does not know one.
    pub value: Option<String>,
    /// Whether the remote side refused to answer because we are sending too many requests.
    pub throttled: bool,
    /// When the remote side will accept requests again, if it told us.
    pub reset_at: Option<SystemTime>,
}

impl LookupResponse {
    /// An answer carrying `value`.
    pub fn found(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Default::default()
        }
    }

    /// An answer stating that the remote side has no value for the key.
    pub fn missing() -> Self {
        Self::default()
    }

    /// A throttling signal, optionally with the time at which the remote window resets.
    pub fn throttled(reset_at: Option<SystemTime>) -> Self {
        Self {
            value: None,
            throttled: true,
            reset_at,
        }
    }
}

/// A failure to get any answer out of the remote side.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The request could not be sent or its response not received.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The remote side answered with a status we do not understand.
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
    /// The remote side answered with a body we do not understand.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The lookup could not be addressed, for example because of an invalid base URL.
    #[error("invalid lookup location: {0}")]
    InvalidLocation(String),
    /// The other end of a channel based lookup went away.
    #[error("remote side disconnected")]
    Disconnected,
}

/// The remote side that knows the values for keys.
#[async_trait]
pub trait RemoteLookup: Send + Sync + 'static {
    /// Asks the remote side for the value of `key`.
    ///
    /// Implementations do not need to enforce a deadline, the dispatch queue applies one.
    async fn request(&self, key: &str) -> Result<LookupResponse, RemoteError>;
}
