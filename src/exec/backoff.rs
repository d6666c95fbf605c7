//! Backoff policies: pure functions from attempt number to wait duration.

use rand::Rng;
use std::time::Duration;

/// Wait schedule applied between retry attempts.
///
/// The exponential variant jitters each delay into `[delay/2, delay]` so a
/// fleet of failing chunks does not hammer the node in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    Linear {
        min: Duration,
        step: Duration,
        max: Duration,
    },
    Exponential {
        min: Duration,
        max: Duration,
    },
}

impl BackoffPolicy {
    pub fn linear(min: Duration, step: Duration, max: Duration) -> Self {
        Self::Linear { min, step, max }
    }

    pub fn exponential(min: Duration, max: Duration) -> Self {
        Self::Exponential { min, max }
    }

    /// Wait before retrying after attempt `attempt` (1-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Self::Linear { min, step, max } => {
                let steps = (attempt - 1) as u32;
                min.saturating_add(step.saturating_mul(steps)).min(max)
            }
            Self::Exponential { min, max } => {
                let exponent = (attempt - 1).min(u32::MAX as usize) as u32;
                let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
                let delay = min.saturating_mul(multiplier).min(max);
                jitter(delay)
            }
        }
    }
}

fn jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis().min(u128::from(u64::MAX)) as u64;
    if millis < 2 {
        return delay;
    }
    let half = millis / 2;
    Duration::from_millis(half + rand::thread_rng().gen_range(0..=millis - half))
}
