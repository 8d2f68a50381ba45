#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use bon::Builder;
use url::Url;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_RECONNECT_DELAY_UNIT_DURATION: Duration = Duration::from_secs(1);

/// Configuration for push channel behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// HTTP(S) origin used to resolve relative connection targets.
    /// Targets that already carry a `ws://`/`wss://` scheme don't need one.
    pub origin: Option<Url>,
    /// Interval between heartbeat frames while connected
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub heartbeat_interval: Duration,
    /// Reconnection pacing configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Configuration for automatic reconnection behavior.
///
/// The schedule is linear: the Nth consecutive attempt waits N delay units.
/// There is no cap and no jitter; the attempt counter resets on every
/// successful open, so the delay only grows for the duration of an outage.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Base unit of the linear backoff schedule
    pub delay_unit: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay_unit: DEFAULT_RECONNECT_DELAY_UNIT_DURATION,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the next dial, given the number of consecutive abnormal
    /// closures observed so far (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_unit.saturating_mul(attempt.saturating_add(1))
    }
}
