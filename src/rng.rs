//! Process-wide seedable RNG.
//!
//! The weighted coin toss at unresolvable extension forks is the engine's
//! only source of nondeterminism. It lives behind this one abstraction so
//! tests can pin the seed and replay a run.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Mutex;

#[derive(Debug)]
pub struct CoinToss {
    rng: Mutex<ChaCha8Rng>,
    tosses: Mutex<u64>,
}

impl CoinToss {
    /// Seeded when given, otherwise from OS entropy.
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            tosses: Mutex::new(0),
        }
    }

    /// Picks an index with probability proportional to its weight. Zero
    /// total weight degrades to the first index.
    #[must_use]
    pub fn weighted_pick(&self, weights: &[u32]) -> usize {
        let total: u64 = weights.iter().map(|&w| u64::from(w)).sum();
        *self
            .tosses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) += 1;
        if total == 0 {
            return 0;
        }
        let mut roll = self
            .rng
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .gen_range(0..total);
        for (i, &w) in weights.iter().enumerate() {
            let w = u64::from(w);
            if roll < w {
                return i;
            }
            roll -= w;
        }
        weights.len() - 1
    }

    /// How many tosses the run has made.
    #[must_use]
    pub fn toss_count(&self) -> u64 {
        *self
            .tosses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_tosses_replay() {
        let a = CoinToss::new(Some(42));
        let b = CoinToss::new(Some(42));
        let weights = [3, 1, 7, 2];
        for _ in 0..50 {
            assert_eq!(a.weighted_pick(&weights), b.weighted_pick(&weights));
        }
        assert_eq!(a.toss_count(), 50);
    }

    #[test]
    fn zero_weights_pick_first() {
        let rng = CoinToss::new(Some(1));
        assert_eq!(rng.weighted_pick(&[0, 0, 0]), 0);
    }

    #[test]
    fn heavy_weight_dominates() {
        let rng = CoinToss::new(Some(7));
        let weights = [1, 10_000];
        let picks: Vec<usize> = (0..100).map(|_| rng.weighted_pick(&weights)).collect();
        let ones = picks.iter().filter(|&&p| p == 1).count();
        assert!(ones > 90);
    }
}
