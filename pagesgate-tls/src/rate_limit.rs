//! ACME rate limiting
//!
//! 🚦 Token buckets guarding the CA-facing budgets.
//!
//! | budget   | capacity | period     | call    |
//! |----------|----------|------------|---------|
//! | order    | 25       | 15 minutes | `take`  |
//! | request  | 5        | 1 second   | `take`  |
//! | failure  | 5        | 1 hour     | `take`  |
//! | per user | 10       | 24 hours   | `ask`   |

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    /// Available tokens
    tokens: f64,
    /// Last refill time
    last_update: Instant,
}

/// Token bucket refilling `capacity` tokens evenly over `period`
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    /// Tokens per second
    refill_rate: f64,
}

impl TokenBucket {
    pub fn new(capacity: u32, period: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_update: Instant::now(),
            }),
            capacity,
            refill_rate: capacity / period.as_secs_f64().max(f64::EPSILON),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_update = now;
    }

    /// Consume a token if one is available; never waits.
    pub fn ask(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Consume a token, sleeping until one is available.
    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate)
            };
            tracing::debug!("🚦 Rate limit reached, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Get remaining tokens
    pub fn remaining(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens as u32
    }
}

/// Per-user buckets, created on first use
pub struct UserLimiter {
    capacity: u32,
    period: Duration,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl UserLimiter {
    pub fn new(capacity: u32, period: Duration) -> Self {
        Self {
            capacity,
            period,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Non-blocking check for `user`
    pub fn ask(&self, user: &str) -> bool {
        let bucket = self
            .buckets
            .lock()
            .entry(user.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(self.capacity, self.period)))
            .clone();
        bucket.ask()
    }
}

/// 🚦 The four ACME budgets
pub struct AcmeLimiters {
    /// When false, `take_*` calls return immediately
    enabled: bool,
    order: TokenBucket,
    request: TokenBucket,
    failure: TokenBucket,
    per_user: UserLimiter,
}

impl AcmeLimiters {
    /// Default budgets
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            // CA allows 300 orders / 3h; 25 per 15 minutes refills more often
            order: TokenBucket::new(25, Duration::from_secs(15 * 60)),
            // CA allows 20 requests / s
            request: TokenBucket::new(5, Duration::from_secs(1)),
            failure: TokenBucket::new(5, Duration::from_secs(60 * 60)),
            per_user: UserLimiter::new(10, Duration::from_secs(24 * 60 * 60)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn take_order(&self) {
        if self.enabled {
            self.order.take().await;
        }
    }

    pub async fn take_request(&self) {
        if self.enabled {
            self.request.take().await;
        }
    }

    pub async fn take_failure(&self) {
        if self.enabled {
            self.failure.take().await;
            tracing::debug!("🚦 {} ACME failure(s) left this hour", self.failure.remaining());
        }
    }

    /// Per-user daily budget
    pub fn ask_user(&self, user: &str) -> bool {
        !self.enabled || self.per_user.ask(user)
    }
}
