use std::cmp::min;
use std::time::Duration;
use anyhow::bail;

/// Parameters for [ExponentialBackoff]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    /// growth factor per attempt in eighths, i.e. 16 doubles the delay for every retry
    pub factor_eighths: u32,
}

impl BackoffConfig {
    pub fn new(initial: Duration, max: Duration) -> BackoffConfig {
        BackoffConfig {
            initial,
            max,
            factor_eighths: 16,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial.is_zero() {
            bail!("initial backoff delay must not be zero");
        }
        if self.initial > self.max {
            bail!("initial backoff delay {:?} exceeds maximum {:?}", self.initial, self.max);
        }
        if self.factor_eighths < 8 {
            bail!("backoff factor must be at least 8/8");
        }
        Ok(())
    }
}

/// Retransmission delays growing by a configured factor up to a maximum
pub struct ExponentialBackoff {
    next_delay: Duration,
    config: BackoffConfig,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        assert!(config.factor_eighths >= 8);

        ExponentialBackoff {
            next_delay: config.initial,
            config,
        }
    }

    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let result = self.next_delay;
        self.next_delay = self.next_delay.checked_mul(self.config.factor_eighths)
            .map_or(self.config.max, |d| min(d / 8, self.config.max));
        result
    }

    pub fn reset(&mut self) {
        self.next_delay = self.config.initial;
    }
}
