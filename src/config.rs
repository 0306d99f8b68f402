// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The set of options recognized by the advancer. The record is immutable
/// within a tick; changes take effect from the next tick.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// The gap between retries after a failed meta-service operation.
    pub backoff_time: Duration,
    /// The period of the tick loop, which is also the deadline of one tick.
    pub tick_duration: Duration,
    /// How stale the cached checkpoint may get before the advancer polls the
    /// stores again instead of relying on pushed flush events.
    pub try_advance_threshold: Duration,
    /// The maximum tolerated checkpoint lag before the task gets auto-paused.
    pub checkpoint_lag_limit: Duration,
    /// When greater than zero, the owner voluntarily steps down after this
    /// interval. Chaos-testing only, keep zero in production.
    pub ownership_cycle_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backoff_time: Duration::from_secs(5),
            tick_duration: Duration::from_secs(12),
            try_advance_threshold: Duration::from_secs(4 * 60),
            checkpoint_lag_limit: Duration::from_secs(48 * 60 * 60),
            ownership_cycle_interval: Duration::ZERO,
        }
    }
}

impl Config {
    /// The poll threshold when some subscription is unhealthy: poll more
    /// aggressively while the streaming path is degraded.
    pub fn degraded_poll_threshold(&self) -> Duration {
        self.try_advance_threshold * 9 / 20
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::Config;

    #[test]
    fn test_degraded_threshold() {
        let cfg = Config::default();
        assert_eq!(cfg.degraded_poll_threshold(), Duration::from_secs(108));
    }
}
