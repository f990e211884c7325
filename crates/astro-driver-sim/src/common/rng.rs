//! Seeded RNG shared by noise generation and error injection.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Thread-safe, optionally seeded random source.
pub struct MockRng {
    inner: parking_lot::Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// `None` seeds from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: parking_lot::Mutex::new(rng),
        }
    }

    /// True with probability `rate` (clamped to 0..=1).
    pub fn should_fail(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().gen::<f64>() < rate
    }

    /// Uniform in [0, 1).
    pub fn next_f64(&self) -> f64 {
        self.inner.lock().gen()
    }

    pub fn next_u64(&self) -> u64 {
        self.inner.lock().gen()
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRng").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let a = MockRng::new(Some(42));
        let b = MockRng::new(Some(42));
        assert_eq!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn extreme_rates() {
        let rng = MockRng::new(Some(42));
        assert!((0..100).all(|_| !rng.should_fail(0.0)));
        assert!((0..100).all(|_| rng.should_fail(1.0)));
    }

    #[test]
    fn failure_rate_is_roughly_honoured() {
        let rng = MockRng::new(Some(3));
        let failures = (0..10_000).filter(|_| rng.should_fail(0.25)).count();
        assert!((2200..2800).contains(&failures), "{failures}");
    }
}
