use std::time::Duration;

use thiserror::Error;

/// An error that prevents a key from being resolved right now.
///
/// Timeouts are not errors, they resolve to an absent value. None of these are cached: they
/// describe the state of the resolver or the remote side, not the key itself, and a later
/// attempt may succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The dispatch queue is at capacity and did not accept the lookup.
    #[error("dispatch queue is full")]
    QueueFull,
    /// The remote side is throttling us. Lookups are rejected until the window lapses.
    #[error("rate limited, retry after {}", humantime::format_duration(*retry_after))]
    RateLimited {
        /// Time left in the current rate limit window.
        retry_after: Duration,
    },
    /// The remote side failed to answer, like connection loss or a 5xx response.
    ///
    /// The attached string contains the reason.
    #[error("lookup failed: {0}")]
    Remote(String),
    /// Remote lookups are switched off.
    #[error("remote lookups are disabled")]
    Disabled,
    /// The lookup was dropped before it settled, usually because the resolver shut down.
    #[error("lookup cancelled")]
    Cancelled,
}

impl ResolveError {
    /// A short name suitable as a metrics tag.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::RateLimited { .. } => "rate_limited",
            Self::Remote(_) => "remote",
            Self::Disabled => "disabled",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ResolveError::RateLimited {
            retry_after: Duration::from_secs(300),
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5m");
        assert_eq!(err.metrics_tag(), "rate_limited");
        assert_eq!(
            ResolveError::Remote("HTTP 502".into()).to_string(),
            "lookup failed: HTTP 502"
        );
    }
}
