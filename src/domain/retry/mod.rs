//! Per-channel retry and backoff policy.
//!
//! The broker's own attempt counter is deliberately left at 1; every retry
//! is scheduled by the dispatcher from these policies so that backoff can
//! differ per channel and retries stay inspectable in the relational log.

use std::collections::HashMap;
use std::time::Duration;

use crate::domain::notification::Channel;

/// Backoff strategy for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Delay doubles per attempt, hard-capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
    /// Constant delay per attempt.
    Fixed { delay_ms: u64 },
}

/// Retry policy for one channel.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Delay before retry attempt `k` (1-indexed among retries).
    ///
    /// Exponential: min(base * 2^(k-1), cap). The cap is hard; no delay ever
    /// exceeds it.
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let attempt = attempt.max(1) as u32;
        let ms = match self.backoff {
            Backoff::Exponential { base_ms, max_ms } => {
                let factor = 2u64.saturating_pow(attempt - 1);
                base_ms.saturating_mul(factor).min(max_ms)
            }
            Backoff::Fixed { delay_ms } => delay_ms,
        };
        Duration::from_millis(ms)
    }
}

/// The per-channel policy table.
#[derive(Debug, Clone)]
pub struct RetryPolicySet {
    policies: HashMap<Channel, RetryPolicy>,
}

impl Default for RetryPolicySet {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            Channel::Email,
            RetryPolicy {
                max_retries: 5,
                backoff: Backoff::Exponential {
                    base_ms: 2_000,
                    max_ms: 300_000,
                },
            },
        );
        policies.insert(
            Channel::Sms,
            RetryPolicy {
                max_retries: 3,
                backoff: Backoff::Exponential {
                    base_ms: 5_000,
                    max_ms: 600_000,
                },
            },
        );
        policies.insert(
            Channel::Push,
            RetryPolicy {
                max_retries: 4,
                backoff: Backoff::Exponential {
                    base_ms: 1_000,
                    max_ms: 120_000,
                },
            },
        );
        policies.insert(
            Channel::Slack,
            RetryPolicy {
                max_retries: 3,
                backoff: Backoff::Fixed { delay_ms: 10_000 },
            },
        );
        policies.insert(
            Channel::Telegram,
            RetryPolicy {
                max_retries: 3,
                backoff: Backoff::Fixed { delay_ms: 10_000 },
            },
        );
        Self { policies }
    }
}

impl RetryPolicySet {
    pub fn for_channel(&self, channel: Channel) -> RetryPolicy {
        // Every channel has a default entry; the fallback only covers a
        // policy table mutated at startup.
        self.policies.get(&channel).copied().unwrap_or(RetryPolicy {
            max_retries: 3,
            backoff: Backoff::Fixed { delay_ms: 10_000 },
        })
    }

    pub fn set(&mut self, channel: Channel, policy: RetryPolicy) {
        self.policies.insert(channel, policy);
    }
}
