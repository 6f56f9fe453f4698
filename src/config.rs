use std::time::Duration;

use bon::Builder;

use crate::Result;
use crate::error::Error;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_BASE_DELAY_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_JITTER_RATIO: f64 = 0.5;

/// Transport-level settings of a connection manager.
///
/// The retry policy is supplied separately on every `open` call.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Ping/pong liveness probing while open. `None` disables the heartbeat.
    pub heartbeat: Option<HeartbeatConfig>,
    /// How long a single connect attempt may take before it counts as failed
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat: Some(HeartbeatConfig::default()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_DURATION,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(Error::configuration("connect_timeout must be positive"));
        }
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.validate()?;
        }
        Ok(())
    }
}

/// Heartbeat timing.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval for sending ping messages while the channel is open
    pub interval: Duration,
    /// Maximum time to wait for a pong before considering the connection dead
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::configuration("heartbeat interval must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(Error::configuration("heartbeat timeout must be positive"));
        }
        Ok(())
    }
}

/// Reconnection policy attached to one `open` cycle.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use live_channel::config::RetryPolicy;
///
/// let policy = RetryPolicy::builder()
///     .max_attempts(3)
///     .base_delay(Duration::from_millis(100))
///     .max_delay(Duration::from_secs(1))
///     .jitter_ratio(0.0)
///     .build();
///
/// assert!(policy.validate().is_ok());
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Builder)]
pub struct RetryPolicy {
    /// Maximum number of connect attempts per series. `0` means unlimited.
    #[builder(default)]
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for every further retry
    #[builder(default = DEFAULT_BASE_DELAY_DURATION)]
    pub base_delay: Duration,
    /// Upper bound for any retry delay, jitter included
    #[builder(default = DEFAULT_MAX_DELAY_DURATION)]
    pub max_delay: Duration,
    /// Fraction of the delay that is randomized, within `[0, 1]`
    #[builder(default = DEFAULT_JITTER_RATIO)]
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.base_delay.is_zero() {
            return Err(Error::configuration("base_delay must be positive"));
        }
        if self.max_delay < self.base_delay {
            return Err(Error::configuration(format!(
                "max_delay ({:?}) must not be shorter than base_delay ({:?})",
                self.max_delay, self.base_delay
            )));
        }
        // NaN fails the range check too
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(Error::configuration(format!(
                "jitter_ratio must be within [0, 1], got {}",
                self.jitter_ratio
            )));
        }
        Ok(())
    }

    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.max_attempts == 0
    }

    /// Whether another connect attempt may follow `attempts` attempts in the current series.
    #[must_use]
    pub const fn allows_retry_after(&self, attempts: u32) -> bool {
        self.is_unlimited() || attempts < self.max_attempts
    }
}
