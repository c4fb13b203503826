use std::time::Duration;

use tokio::time::Instant;

/// Upper bound of a single backoff window, no matter how often the remote side throttled us.
pub const MAX_BACKOFF: Duration = Duration::from_secs(7 * 24 * 3600);

/// Tracks the rate limit window imposed by the remote side.
///
/// Every throttling signal extends the window exponentially: the n-th consecutive signal waits
/// at least `base * 2^(n-1)`. A window never shrinks while it is active. Once it has lapsed it
/// is cleared together with the signal count, and a clean response also resets the count.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitWindow {
    reset_at: Option<Instant>,
    consecutive_hits: u32,
}

impl RateLimitWindow {
    /// Records a throttling signal and returns the end of the resulting window.
    ///
    /// `reported` is the reset time the remote side told us about, if any. Both it and the
    /// exponential wait are lower bounds, the window ends at the later of the two.
    pub fn signal(&mut self, now: Instant, reported: Option<Instant>, base: Duration) -> Instant {
        self.consecutive_hits = self.consecutive_hits.saturating_add(1);

        let local = now + exponential_backoff(base, self.consecutive_hits);
        let candidate = match reported {
            Some(reported) => reported.max(local),
            None => local,
        };

        let reset_at = match self.reset_at {
            Some(current) => current.max(candidate),
            None => candidate,
        };
        self.reset_at = Some(reset_at);
        reset_at
    }

    /// The time left in the window, `None` if there is no active window at `now`.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.reset_at
            .filter(|reset_at| now < *reset_at)
            .map(|reset_at| reset_at - now)
    }

    /// Clears a window that lapsed at `now`, along with the signal count.
    ///
    /// Returns `true` if a window was cleared.
    pub fn recover(&mut self, now: Instant) -> bool {
        match self.reset_at {
            Some(reset_at) if now >= reset_at => {
                self.reset_at = None;
                self.consecutive_hits = 0;
                true
            }
            _ => false,
        }
    }

    /// Records a clean response from the remote side.
    pub fn record_success(&mut self) {
        self.consecutive_hits = 0;
    }

    pub fn consecutive_hits(&self) -> u32 {
        self.consecutive_hits
    }

    pub fn reset_at(&self) -> Option<Instant> {
        self.reset_at
    }
}

/// `base * 2^(hits - 1)`, capped at [`MAX_BACKOFF`].
pub fn exponential_backoff(base: Duration, hits: u32) -> Duration {
    let exponent = hits.saturating_sub(1).min(31);
    base.saturating_mul(1 << exponent).min(MAX_BACKOFF)
}
