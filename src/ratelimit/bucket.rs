//! Token bucket state and arithmetic.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::rules::EndpointPolicy;

/// Outcome of trying to take one token from a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    /// A token was taken; `remaining` whole tokens are left.
    Consumed { remaining: u64 },
    /// The bucket is empty; the next token arrives after `retry_after`.
    Rejected { retry_after: Duration },
}

impl Consumption {
    pub fn is_consumed(&self) -> bool {
        matches!(self, Consumption::Consumed { .. })
    }
}

/// State of a single token bucket.
///
/// Tokens are refilled lazily and in whole periods: `refill_tokens` arrive at
/// the end of every `refill_period_ms`, never partially. The bucket never
/// holds more than `capacity` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub capacity: u64,
    pub available_tokens: f64,
    pub last_refill_ms: u64,
    pub refill_tokens: u64,
    pub refill_period_ms: u64,
}

impl BucketState {
    /// Create a full bucket for `policy` whose refill clock starts at `now_ms`.
    pub fn new(policy: &EndpointPolicy, now_ms: u64) -> Self {
        Self {
            capacity: policy.capacity,
            available_tokens: policy.capacity as f64,
            last_refill_ms: now_ms,
            refill_tokens: policy.refill_tokens,
            refill_period_ms: policy.refill_period_millis().max(1),
        }
    }

    /// Adopt a possibly different policy, keeping the current token count
    /// within the new capacity.
    pub fn apply_policy(&mut self, policy: &EndpointPolicy) {
        self.capacity = policy.capacity;
        self.refill_tokens = policy.refill_tokens;
        self.refill_period_ms = policy.refill_period_millis().max(1);
        self.clamp();
    }

    /// Credit every whole refill period that elapsed since the last refill.
    pub fn refill(&mut self, now_ms: u64) {
        if now_ms <= self.last_refill_ms {
            return;
        }

        let periods = (now_ms - self.last_refill_ms) / self.refill_period_ms;
        if periods == 0 {
            return;
        }

        let credit = self.refill_tokens as f64 * periods as f64;
        self.available_tokens = (self.available_tokens + credit).min(self.capacity as f64);
        self.last_refill_ms = self
            .last_refill_ms
            .saturating_add(periods.saturating_mul(self.refill_period_ms));
    }

    /// Refill, then try to take one token.
    pub fn try_consume(&mut self, now_ms: u64) -> Consumption {
        self.refill(now_ms);

        if self.available_tokens >= 1.0 {
            self.available_tokens -= 1.0;
            Consumption::Consumed {
                remaining: self.whole_tokens(),
            }
        } else {
            Consumption::Rejected {
                retry_after: self.time_to_next_refill(now_ms),
            }
        }
    }

    /// Time left in the current refill period.
    pub fn time_to_next_refill(&self, now_ms: u64) -> Duration {
        let next = self.last_refill_ms.saturating_add(self.refill_period_ms);
        Duration::from_millis(next.saturating_sub(now_ms).max(1))
    }

    /// Whole tokens currently in the bucket.
    pub fn whole_tokens(&self) -> u64 {
        self.available_tokens.max(0.0).floor() as u64
    }

    /// Whether the bucket would be full at `now_ms`.
    pub fn is_full_at(&self, now_ms: u64) -> bool {
        let mut refilled = *self;
        refilled.refill(now_ms);
        refilled.available_tokens >= refilled.capacity as f64
    }

    fn clamp(&mut self) {
        self.available_tokens = self.available_tokens.clamp(0.0, self.capacity as f64);
    }
}
