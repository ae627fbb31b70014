use rand::Rng;
use std::time::Duration;

const DEFAULT_BASE: Duration = Duration::from_millis(500);
const DEFAULT_MAX: Duration = Duration::from_secs(30);

/// Exponential delay between retries of a failed folder pass.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_MAX, true)
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    /// `attempt` counts retries already made; jitter draws uniformly up to the capped delay.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let capped = self
            .base
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max);
        if !self.jitter {
            return capped;
        }
        let capped_ms = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rng.gen_range(0..=capped_ms))
    }
}
