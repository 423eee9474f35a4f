//! Exponential backoff with positive jitter
//!
//! `delay(n) = min(max, initial * multiplier^n * (1 + U[0, jitter)))`.
//! With `multiplier > 1 + jitter` successive delays strictly increase until
//! they reach `max`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(attempt.min(64) as i32);
        let jitter = base * self.jitter * rand::random::<f64>();
        let secs = (base + jitter).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}
