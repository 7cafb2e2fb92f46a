//! Randomized retry timer
//!
//! Spreads update retries between a minimum and a maximum interval so that
//! re-sends to many nodes do not line up.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct RetryTimer {
    /// Last time the timer was reset
    last_reset: Instant,

    /// Current timeout duration
    timeout: Duration,

    min: Duration,
    max: Duration,
}

impl RetryTimer {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            last_reset: Instant::now(),
            timeout: Self::random_timeout(min, max),
            min,
            max,
        }
    }

    /// Restart the timer with a new random timeout
    pub fn reset(&mut self) {
        self.last_reset = Instant::now();
        self.timeout = Self::random_timeout(self.min, self.max);
    }

    pub fn is_elapsed(&self) -> bool {
        self.last_reset.elapsed() >= self.timeout
    }

    pub fn time_remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.last_reset.elapsed())
    }

    /// Instant at which the timer fires
    pub fn deadline(&self) -> Instant {
        self.last_reset + self.timeout
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn random_timeout(min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let mut rng = rand::thread_rng();
        let millis = rng.gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(millis)
    }
}
