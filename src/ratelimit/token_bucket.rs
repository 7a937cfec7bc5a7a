//! Token bucket for the worker pool's job rate limit.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::SystemTime;

/// Token bucket allowing at most `capacity` consumptions per `window_ms`.
///
/// Uses atomic operations for lock-free concurrent access across the worker
/// pool. Tokens refill continuously at `capacity / window_ms` per
/// millisecond up to the bucket capacity.
#[derive(Debug)]
pub struct TokenBucket {
    /// Current number of tokens
    tokens: AtomicU32,
    /// Last refill timestamp (Unix milliseconds)
    last_refill: AtomicI64,
    /// Maximum bucket capacity
    capacity: u32,
    /// Refill window in milliseconds
    window_ms: u64,
}

impl TokenBucket {
    pub fn new(capacity: u32, window_ms: u64) -> Self {
        Self {
            tokens: AtomicU32::new(capacity),
            last_refill: AtomicI64::new(Self::now_millis()),
            capacity,
            window_ms: window_ms.max(1),
        }
    }

    fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    /// Try to consume one token. Returns false when the window budget is
    /// exhausted.
    pub fn try_consume(&self) -> bool {
        let now = Self::now_millis();
        let last = self.last_refill.load(Ordering::Relaxed);
        let elapsed_ms = (now - last).max(0) as u64;

        let tokens_to_add =
            (elapsed_ms.saturating_mul(self.capacity as u64) / self.window_ms) as u32;

        loop {
            let current = self.tokens.load(Ordering::Relaxed);
            let refilled = current.saturating_add(tokens_to_add).min(self.capacity);

            if refilled == 0 {
                return false;
            }

            if self
                .tokens
                .compare_exchange_weak(current, refilled - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                if tokens_to_add > 0 {
                    self.last_refill.store(now, Ordering::Relaxed);
                }
                return true;
            }
            // CAS failed, retry
        }
    }

    /// Currently available tokens, including pending refill.
    pub fn available(&self) -> u32 {
        let now = Self::now_millis();
        let last = self.last_refill.load(Ordering::Relaxed);
        let elapsed_ms = (now - last).max(0) as u64;
        let tokens_to_add =
            (elapsed_ms.saturating_mul(self.capacity as u64) / self.window_ms) as u32;
        self.tokens
            .load(Ordering::Relaxed)
            .saturating_add(tokens_to_add)
            .min(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_budget_exhausts_at_capacity() {
        let bucket = TokenBucket::new(10, 60_000);

        for _ in 0..10 {
            assert!(bucket.try_consume());
        }
        assert!(!bucket.try_consume());
    }

    #[test]
    fn test_refills_within_window() {
        // 100 tokens per 100ms: one token per millisecond
        let bucket = TokenBucket::new(100, 100);

        for _ in 0..100 {
            assert!(bucket.try_consume());
        }
        assert!(!bucket.try_consume());

        std::thread::sleep(Duration::from_millis(20));
        assert!(bucket.try_consume());
    }

    #[test]
    fn test_refill_never_exceeds_capacity() {
        let bucket = TokenBucket::new(5, 10);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(bucket.available(), 5);
    }
}
