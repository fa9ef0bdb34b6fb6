//! Requests-per-second token bucket, shared by all VUs of a run.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct BucketState {
  tokens: f64,
  last_refill: Instant,
}

/// Continuous-refill token bucket. `rate` tokens per second accumulate up
/// to a one-second burst; `take` reports how long the caller must wait for
/// the next token.
pub struct RpsLimiter {
  rate: f64,
  state: Mutex<BucketState>,
}

impl RpsLimiter {
  /// Returns `None` for a non-positive rate (unlimited).
  pub fn new(rate: f64) -> Option<Self> {
    if rate <= 0.0 {
      return None;
    }
    Some(Self {
      rate,
      state: Mutex::new(BucketState {
        tokens: rate,
        last_refill: Instant::now(),
      }),
    })
  }

  pub fn rate(&self) -> f64 {
    self.rate
  }

  /// Takes one token, returning how long to sleep before acting. Zero means
  /// a token was immediately available.
  pub fn take(&self) -> Duration {
    let mut state = self.state.lock();
    let now = Instant::now();
    let elapsed = now.duration_since(state.last_refill).as_secs_f64();
    state.tokens = (state.tokens + elapsed * self.rate).min(self.rate);
    state.last_refill = now;

    state.tokens -= 1.0;
    if state.tokens >= 0.0 {
      Duration::ZERO
    } else {
      Duration::from_secs_f64(-state.tokens / self.rate)
    }
  }
}

#[cfg(test)]
mod limiter_tests {
  use super::*;

  #[test]
  fn unlimited1() {
    assert!(RpsLimiter::new(0.0).is_none());
    assert!(RpsLimiter::new(-1.0).is_none());
  }

  #[test]
  fn burst_then_wait1() {
    let limiter = RpsLimiter::new(2.0).unwrap();
    // The initial burst covers the first `rate` tokens.
    assert_eq!(limiter.take(), Duration::ZERO);
    assert_eq!(limiter.take(), Duration::ZERO);
    // Next takers owe time.
    assert!(limiter.take() > Duration::ZERO);
  }
}
