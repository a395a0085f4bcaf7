//! Per-tenant token-bucket rate limiter.
//!
//! Lock-free: the token count is a milli-token atomic so fractional refill
//! rates work without floating-point drift in the fast path. `allow()` never
//! blocks; the pipeline answers 429 instead of queueing.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct TokenBucket {
    /// Burst capacity in whole tokens.
    max_tokens: u64,
    /// Refill rate in tokens per nanosecond; 0.0 disables the limiter.
    refill_rate_per_ns: f64,
    /// Current balance scaled by 1000 for sub-token precision.
    tokens_milli: AtomicI64,
    last_refill_ns: AtomicU64,
}

impl TokenBucket {
    /// `qps == 0` builds an unlimited bucket.
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = burst.max(1) as u64;
        Self {
            max_tokens: burst,
            refill_rate_per_ns: qps.max(0.0) / 1_000_000_000.0,
            tokens_milli: AtomicI64::new((burst * 1000) as i64),
            last_refill_ns: AtomicU64::new(now_ns()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0.0, 1)
    }

    pub fn is_unlimited(&self) -> bool {
        self.refill_rate_per_ns == 0.0
    }

    /// Try to take one token. Returns false when rate-limited.
    pub fn allow(&self) -> bool {
        if self.is_unlimited() {
            return true;
        }
        self.refill();
        let prev = self.tokens_milli.fetch_sub(1000, Ordering::AcqRel);
        if prev >= 1000 {
            true
        } else {
            // Didn't actually have a token; put it back.
            self.tokens_milli.fetch_add(1000, Ordering::Release);
            false
        }
    }

    fn refill(&self) {
        let now = now_ns();
        let last = self.last_refill_ns.load(Ordering::Acquire);
        let elapsed = now.saturating_sub(last);
        if elapsed == 0 {
            return;
        }
        let new_milli = (elapsed as f64 * self.refill_rate_per_ns * 1000.0) as i64;
        if new_milli <= 0 {
            return;
        }
        if self
            .last_refill_ns
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let max_milli = (self.max_tokens * 1000) as i64;
            let old = self.tokens_milli.fetch_add(new_milli, Ordering::AcqRel);
            if old + new_milli > max_milli {
                self.tokens_milli.store(max_milli, Ordering::Release);
            }
        }
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
