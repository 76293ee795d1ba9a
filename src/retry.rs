use std::time::Duration;

use tokio::sync::watch;
use tokio::time;

use crate::lounge::{LoungeError, Result};

/// How a failed attempt should be treated by a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout or DNS failure
    Transient,
    /// HTTP 5xx
    Server,
    /// HTTP 404/410, or 400 "Unknown SID": the session has to be rebuilt
    SessionExpired,
    Fatal,
}

impl ErrorClass {
    /// Worth repeating the same request unchanged.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Server)
    }
}

/// Full reconnects (drop session + handshake) allowed per logical call.
pub const MAX_SESSION_RESETS: u32 = 2;

/// Retry budget plus exponential backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Transient and 5xx failures of a dispatch or handshake.
    pub const DISPATCH: RetryPolicy = RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(600),
        max_delay: Duration::from_secs(5),
    };

    /// Session expiry inside one dispatch: reset and handshake again.
    pub const SESSION_RESET: RetryPolicy = RetryPolicy {
        max_retries: MAX_SESSION_RESETS,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };

    /// Soft reconnects of the streaming bind. Never gives up.
    pub const STREAM: RetryPolicy = RetryPolicy {
        max_retries: u32::MAX,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(15),
    };

    /// Idle reachability probing of the selected device.
    pub const REACHABILITY: RetryPolicy = RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_secs(15),
        max_delay: Duration::from_secs(15),
    };

    /// Liveness pings while driving playback.
    pub const LIVENESS: RetryPolicy = RetryPolicy {
        max_retries: 5,
        base_delay: Duration::from_secs(7),
        max_delay: Duration::from_secs(14),
    };

    /// Double `current`, clamped to `max_delay`.
    pub fn grow(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempts: 0,
            current: self.base_delay,
        }
    }
}

/// Stateful walk through a policy's delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
    current: Duration,
}

impl Backoff {
    /// Record a failed attempt. Returns the delay before the next one, or
    /// `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts > self.policy.max_retries {
            return None;
        }
        let delay = self.current;
        self.current = self.policy.grow(self.current);
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = self.policy.base_delay;
    }
}

// ---------------------------------------------------------------------------
// Cancellation helpers
// ---------------------------------------------------------------------------

/// True once shutdown was requested or its sender is gone.
pub fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Resolves when shutdown is requested (or the sender is dropped).
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay` unless shutdown fires first, in which case
/// `Err(Shutdown)` is returned.
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
    tracing::trace!("backoff sleep: {}ms", delay.as_millis());
    tokio::select! {
        _ = time::sleep(delay) => Ok(()),
        _ = shutdown_requested(shutdown) => Err(LoungeError::Shutdown),
    }
}
