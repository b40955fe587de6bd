use std::cmp::min;
use std::time::Duration;
use crate::config::SenderConfig;

/// Delay between a failed or broken connection and the next connect attempt. The delay starts
///  at an initial value and grows by a factor (in eighths, so 12 is 1.5 and 16 is doubling) with
///  every consecutive failure, up to a maximum. A successful connect resets it.
///
/// With the default configuration initial and maximum delay are identical, i.e. the sender
///  retries at a fixed interval.
pub struct ReconnectBackoff {
    current: Duration,

    config_initial: Duration,
    config_max: Duration,
    config_factor_eighths: u32,
}

impl ReconnectBackoff {
    pub fn new(config: &SenderConfig) -> Self {
        let result = ReconnectBackoff {
            current: config.reconnect_initial_interval,
            config_initial: config.reconnect_initial_interval,
            config_max: config.reconnect_max_interval,
            config_factor_eighths: config.reconnect_factor_eighths,
        };

        assert!(result.config_factor_eighths >= 8);

        result
    }

    /// Returns the delay before the next connect attempt and advances to the delay after that
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let result = self.current;

        let grown = self.current.saturating_mul(self.config_factor_eighths) / 8;
        self.current = min(grown, self.config_max);

        result
    }

    pub fn reset(&mut self) {
        self.current = self.config_initial;
    }
}
