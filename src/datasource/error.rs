//! Shared HTTP error classification and reconnect pacing.

use std::time::Duration;

/// Partition HTTP statuses into recoverable (keep retrying with delay) and
/// unrecoverable (shut the source down permanently). Within 4xx only
/// request-shaped failures are worth retrying; everything outside 4xx is.
pub(crate) fn is_http_error_recoverable(status: u16) -> bool {
    if (400..500).contains(&status) {
        matches!(status, 400 | 408 | 429)
    } else {
        true
    }
}

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff for manual stream restarts (malformed payloads,
/// store write failures). Resets after a healthy read.
pub(crate) struct RetryDelay {
    initial: Duration,
    attempt: u32,
}

impl RetryDelay {
    pub(crate) fn new(initial: Duration) -> Self {
        Self {
            initial,
            attempt: 0,
        }
    }

    pub(crate) fn next(&mut self) -> Duration {
        let delay = self
            .initial
            .checked_mul(1u32 << self.attempt.min(16))
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}
