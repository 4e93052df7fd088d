//! Token-bucket rate limiter for outbound API calls.
//!
//! Refill is computed lazily on every call (`elapsed * rate`, capped at
//! capacity), so there is no background ticker. Waiters queue on a fair async
//! mutex that stays held while they sleep for their refill: once a caller is
//! waiting, the tokens it is waiting for cannot be taken by anyone else.

use std::time::Duration;

use harvest_core::config::{LimiterConfig, LimiterMode};
use harvest_core::error::{HarvestError, Result};
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Float slack so a refill that lands a hair under `cost` doesn't re-sleep.
const EPSILON: f64 = 1e-9;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by every worker of a run.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    mode: LimiterMode,
    jitter: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: f64, refill_rate: f64, mode: LimiterMode) -> Result<Self> {
        if !(capacity.is_finite() && capacity >= 1.0) {
            return Err(HarvestError::QuotaMisconfiguration(format!(
                "bucket capacity must be >= 1, got {capacity}"
            )));
        }
        if !(refill_rate.is_finite() && refill_rate > 0.0) {
            return Err(HarvestError::QuotaMisconfiguration(format!(
                "refill rate must be > 0, got {refill_rate}"
            )));
        }
        if Duration::try_from_secs_f64(capacity / refill_rate).is_err() {
            return Err(HarvestError::QuotaMisconfiguration(format!(
                "refill rate {refill_rate} is too slow to ever refill {capacity} token(s)"
            )));
        }
        Ok(Self {
            capacity,
            refill_rate,
            mode,
            jitter: 0.1,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        Ok(Self::new(config.capacity, config.refill_rate, config.mode)?.with_jitter(config.jitter))
    }

    /// Relative jitter for smooth mode, clamped to [0, 0.5].
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() { jitter.clamp(0.0, 0.5) } else { 0.0 };
        self
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn mode(&self) -> LimiterMode {
        self.mode
    }

    /// Wait until `cost` tokens are available, then take them.
    pub async fn acquire(&self, cost: f64) -> Result<()> {
        self.acquire_inner(cost, None).await
    }

    /// Like [`acquire`](Self::acquire), but gives up with
    /// [`HarvestError::Cancelled`] when `cancel` fires.
    pub async fn acquire_with_cancel(&self, cost: f64, cancel: &CancellationToken) -> Result<()> {
        self.acquire_inner(cost, Some(cancel)).await
    }

    /// Take `cost` tokens if they are available right now.
    ///
    /// Never waits, not even for the bucket mutex. Returns `Ok(false)` when
    /// tokens are short or the mutex is held at that instant: by a caller
    /// sleeping for its refill, or briefly by [`available`](Self::available)
    /// or a granting [`acquire`](Self::acquire). A `false` therefore does not
    /// prove the bucket is empty; callers that need a definite answer should
    /// use [`acquire_with_cancel`](Self::acquire_with_cancel).
    pub async fn try_acquire(&self, cost: f64) -> Result<bool> {
        self.check_cost(cost)?;
        let Ok(mut state) = self.state.try_lock() else {
            return Ok(false);
        };
        self.refill(&mut state);
        if state.tokens + EPSILON >= cost {
            state.tokens = (state.tokens - cost).max(0.0);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Current token count after refill. Diagnostics only.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }

    async fn acquire_inner(&self, cost: f64, cancel: Option<&CancellationToken>) -> Result<()> {
        self.check_cost(cost)?;

        let mut state = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(cancelled()),
                guard = self.state.lock() => guard,
            },
            None => self.state.lock().await,
        };

        loop {
            self.refill(&mut state);
            if state.tokens + EPSILON >= cost {
                state.tokens = (state.tokens - cost).max(0.0);
                tracing::debug!(
                    "limiter grants {cost} token(s), {:.3} left of {}",
                    state.tokens,
                    self.capacity
                );
                return Ok(());
            }

            let wait = refill_wait(cost - state.tokens, self.refill_rate);
            tracing::debug!("⏳ limiter sleeping for {:.3}s", wait.as_secs_f64());
            match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(cancelled()),
                    _ = tokio::time::sleep(wait) => {}
                },
                None => tokio::time::sleep(wait).await,
            }
        }
    }

    fn check_cost(&self, cost: f64) -> Result<()> {
        if !(cost.is_finite() && cost > 0.0) {
            return Err(HarvestError::QuotaMisconfiguration(format!(
                "token cost must be > 0, got {cost}"
            )));
        }
        if cost > self.capacity {
            return Err(HarvestError::QuotaMisconfiguration(format!(
                "cost {cost} exceeds bucket capacity {}",
                self.capacity
            )));
        }
        Ok(())
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        let added = elapsed * self.effective_rate();
        state.tokens = (state.tokens + added).min(self.capacity);
        state.last_refill = now;
    }

    fn effective_rate(&self) -> f64 {
        match self.mode {
            LimiterMode::Strict => self.refill_rate,
            LimiterMode::Smooth if self.jitter > 0.0 => {
                let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
                self.refill_rate * (1.0 + factor)
            }
            LimiterMode::Smooth => self.refill_rate,
        }
    }
}

/// Time to refill `missing` tokens, saturating instead of overflowing.
fn refill_wait(missing: f64, refill_rate: f64) -> Duration {
    Duration::try_from_secs_f64(missing.max(0.0) / refill_rate).unwrap_or(Duration::MAX)
}

fn cancelled() -> HarvestError {
    HarvestError::Cancelled("rate limiter wait".into())
}
