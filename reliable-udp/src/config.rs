//! Per-session protocol parameters.

use std::time::Duration;

use thiserror::Error;

/// Parameters fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Sliding-window capacity in packets.  A session allows
    /// [`Config::max_window`] = `window + 1` packets in flight.
    pub window: u32,
    /// Retransmission deadline for an unacknowledged packet.
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window: 1,
            timeout: Duration::from_millis(2000),
        }
    }
}

impl Config {
    pub fn new(window: u32, timeout_ms: u64) -> Self {
        Self {
            window,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Upper bound on in-flight packets.
    pub fn max_window(&self) -> u32 {
        self.window.saturating_add(1)
    }

    /// How often the timer sweep should run: a fifth of the timeout, and
    /// never faster than once a millisecond.
    pub fn sweep_interval(&self) -> Duration {
        (self.timeout / 5).max(Duration::from_millis(1))
    }

    /// How long an endpoint keeps answering a finished peer's
    /// retransmissions before forgetting it.
    pub fn linger(&self) -> Duration {
        self.timeout * LINGER_TIMEOUTS
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.window > MAX_WINDOW {
            return Err(ConfigError::WindowTooLarge(self.window));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// Largest accepted window; keeps `recv_next + max_window` well inside the
/// sequence space.
pub const MAX_WINDOW: u32 = 1 << 16;

/// Finished peers are remembered for this many retransmission timeouts.
const LINGER_TIMEOUTS: u32 = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("window must be at least 1 packet")]
    ZeroWindow,
    #[error("window of {0} packets exceeds the limit of {MAX_WINDOW}")]
    WindowTooLarge(u32),
    #[error("retransmission timeout must be non-zero")]
    ZeroTimeout,
}
