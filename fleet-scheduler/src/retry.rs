// SPDX-License-Identifier: MIT

use fleet_model::config::Backoff;
use fleet_model::{ErrorClass, RetryConfig};
use rand::Rng;

/// Outcome of classifying one mission failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDecision {
    pub requeue: bool,
    /// Whether this failure consumes the attempt budget. Validation and
    /// auth failures never do.
    pub count_attempt: bool,
    /// Earliest wall-clock time the next attempt may start, 0 when not
    /// requeueing.
    pub next_attempt_ms: u64,
}

/// Per-failure-class retry schedule for missions. The decision is made
/// once on the leader and travels inside the FailMission command, so
/// jitter here never reaches the replicated apply path.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, jitter: 0.1 }
    }

    /// `attempts` is the number of failed attempts already recorded on
    /// the mission; the failure being classified is attempt
    /// `attempts + 1`.
    pub fn decide(&self, class: ErrorClass, attempts: u32, now_ms: u64) -> RetryDecision {
        let Some(rule) = self.config.rule(class) else {
            return RetryDecision { requeue: false, count_attempt: false, next_attempt_ms: 0 };
        };

        let attempt = attempts + 1;
        if attempt >= rule.max_attempts {
            return RetryDecision { requeue: false, count_attempt: true, next_attempt_ms: 0 };
        }

        let delay_ms = match rule.backoff {
            Backoff::Immediate => 0,
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Exponential { base_ms, cap_ms } => {
                let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
                base_ms.saturating_mul(factor).min(cap_ms)
            }
        };
        RetryDecision {
            requeue: true,
            count_attempt: true,
            next_attempt_ms: now_ms + self.jittered(delay_ms),
        }
    }

    fn jittered(&self, delay_ms: u64) -> u64 {
        if self.jitter <= 0.0 || delay_ms == 0 {
            return delay_ms;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        ((delay_ms as f64) * (1.0 + spread)).max(0.0) as u64
    }
}
