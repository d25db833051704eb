//! Restart backoff

use std::time::Duration;

use rand::Rng;

use crate::config::{BackoffConfig, BackoffKind};

/// Delay curve applied before relaunching a browser
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    kind: BackoffKind,
    initial: Duration,
    max: Duration,
    jitter: bool,
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            kind: config.kind,
            initial: Duration::from_millis(config.initial_ms),
            max: Duration::from_millis(config.max_ms),
            jitter: config.jitter,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = match self.kind {
            BackoffKind::Fixed => self.initial,
            BackoffKind::Exponential => {
                let factor = 1u32 << attempt.min(20);
                self.initial.saturating_mul(factor)
            }
        };
        let capped = base.min(self.max);
        if self.jitter {
            capped.mul_f64(rand::rng().random_range(0.75..=1.0))
        } else {
            capped
        }
    }
}
