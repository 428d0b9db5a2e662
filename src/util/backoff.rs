use rand::Rng;

pub const INITIAL_DELAY_MILLIS: u64 = 500;
pub const MAX_BACKOFF_MILLIS: u64 = 5 * 60 * 1_000;

/// Reconnect pacing: the first failure retries immediately, every later
/// failure doubles a delay ceiling (capped at [`MAX_BACKOFF_MILLIS`]) and
/// sleeps a random span between half the ceiling and the ceiling. The
/// random spread keeps a fleet of clients from reconnecting in lockstep
/// after a shared outage.
#[derive(Debug)]
pub struct Backoff {
    initial_millis: u64,
    failure_count: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_DELAY_MILLIS)
    }
}

impl Backoff {
    pub fn new(initial_millis: u64) -> Self {
        Self {
            initial_millis,
            failure_count: 0,
        }
    }

    /// Forget past failures; the next attempt goes out immediately.
    pub fn reset(&mut self) {
        self.failure_count = 0;
    }

    /// Records a failed attempt and returns the delay before the next one.
    pub fn next_delay_millis(&mut self) -> u64 {
        let failures = self.failure_count;
        self.failure_count = self.failure_count.saturating_add(1);
        if failures == 0 {
            return 0;
        }
        jittered_delay(self.ceiling_for(failures), &mut rand::thread_rng())
    }

    fn ceiling_for(&self, failures: u32) -> u64 {
        // Doubling count bounded so the multiplication stays well inside
        // u64; the cap takes over long before the bound matters.
        let doublings = failures.saturating_sub(1).min(20);
        self.initial_millis
            .saturating_mul(1u64 << doublings)
            .min(MAX_BACKOFF_MILLIS)
    }
}

fn jittered_delay<R: Rng + ?Sized>(ceiling: u64, rng: &mut R) -> u64 {
    if ceiling == 0 {
        return 0;
    }
    rng.gen_range(ceiling / 2..=ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn first_failure_retries_immediately() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.next_delay_millis(), 0);
    }

    #[test]
    fn reset_restores_immediate_retry() {
        let mut backoff = Backoff::default();
        backoff.next_delay_millis();
        backoff.next_delay_millis();
        backoff.reset();
        assert_eq!(backoff.next_delay_millis(), 0);
    }

    #[test]
    fn ceilings_double_until_the_cap() {
        let backoff = Backoff::default();
        assert_eq!(backoff.ceiling_for(1), INITIAL_DELAY_MILLIS);
        assert_eq!(backoff.ceiling_for(2), INITIAL_DELAY_MILLIS * 2);
        assert_eq!(backoff.ceiling_for(5), INITIAL_DELAY_MILLIS * 16);
        assert_eq!(backoff.ceiling_for(60), MAX_BACKOFF_MILLIS);
        assert_eq!(backoff.ceiling_for(u32::MAX), MAX_BACKOFF_MILLIS);
    }

    #[test]
    fn delays_stay_within_the_jitter_window() {
        let mut rng = StdRng::seed_from_u64(11);
        for failures in 1..12 {
            let ceiling = Backoff::default().ceiling_for(failures);
            let delay = jittered_delay(ceiling, &mut rng);
            assert!(delay >= ceiling / 2 && delay <= ceiling);
        }
    }

    #[test]
    fn successive_failures_never_shrink_the_window() {
        let backoff = Backoff::default();
        let mut previous = 0;
        for failures in 1..40 {
            let ceiling = backoff.ceiling_for(failures);
            assert!(ceiling >= previous);
            assert!(ceiling <= MAX_BACKOFF_MILLIS);
            previous = ceiling;
        }
    }
}
