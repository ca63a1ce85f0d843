//! Re-running storage work that failed in a retryable way.

use std::time::{Duration, Instant};

use rand::Rng;
use rocket::tokio::time;

/// Upper bound on how many times the backoff delay doubles.
const MAX_DOUBLINGS: u32 = 6;

/// How hard to keep re-running an operation after retryable failures.
///
/// A re-run is allowed while either the attempt budget or the time window is
/// not yet used up. Under heavy write contention (MongoDB write conflicts) a
/// few immediate re-runs are not enough, so the window keeps going for a while
/// and the jittered, exponentially growing pause spreads the contenders out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retries: u32,
    window: Duration,
    base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(retries: u32, window: Duration, base_delay: Duration) -> Self {
        Self {
            retries,
            window,
            base_delay,
        }
    }

    /// Exactly `retries` re-runs, back to back.
    #[cfg(test)]
    pub const fn attempts(retries: u32) -> Self {
        Self::new(retries, Duration::ZERO, Duration::ZERO)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Whether another re-run may follow, given how many have already run and
    /// when the first attempt started.
    pub fn allows(&self, reruns: u32, started: Instant) -> bool {
        reruns < self.retries || started.elapsed() < self.window
    }

    /// Pause before re-run number `rerun` (counting from 1).
    ///
    /// Drawn uniformly from the upper half of `base_delay * 2^(rerun - 1)`,
    /// with the doubling capped.
    pub fn delay(&self, rerun: u32) -> Duration {
        let doublings = rerun.saturating_sub(1).min(MAX_DOUBLINGS);
        let ceiling = (self.base_delay * 2u32.pow(doublings)).as_micros() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(ceiling / 2..=ceiling))
    }

    /// Sleep before re-run number `rerun`.
    pub async fn back_off(&self, rerun: u32) {
        let delay = self.delay(rerun);
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
    }
}
