use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter.
///
/// Delay `n` (zero-based) is `base * 2^n`, capped at `cap`, then reduced by a
/// random fraction of at most `jitter` so that retries from many loops do not
/// line up.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: 0.2,
            attempts: 0,
        }
    }

    /// Sets the jitter fraction, clamped to `[0, 1]`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, without jitter.
    pub fn peek(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempts.min(31));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Records a failed attempt and returns how long to wait.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.peek();
        self.attempts = self.attempts.saturating_add(1);
        if self.jitter == 0.0 {
            return delay;
        }
        let cut = rand::rng().random_range(0.0..=self.jitter);
        delay.mul_f64(1.0 - cut)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
