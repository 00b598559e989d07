//! Ground truth for simulation.
//!
//! The oracle decides what every slave does each round and knows the true
//! global sum to judge the master's estimate against:
//! - Update draws from a fixed update set (seeded)
//! - The exact sum of the slaves' local values
//! - The tolerance check applied after each round

use distsum_core::master::saturating_sum;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Update set used by the reference session: mostly small increments.
pub const DEFAULT_UPDATE_SET: [i64; 9] = [1, 1, 1, 1, 2, 2, -1, -1, -2];

/// The oracle - draws updates and computes ground truth.
pub struct UpdateOracle {
    /// Seed for update draws (separate from fault injection)
    seed: u64,

    rng: ChaCha8Rng,

    /// Candidate deltas; repeats weight the draw
    update_set: Vec<i64>,

    /// Updates drawn so far
    draws: u64,
}

impl UpdateOracle {
    /// Creates a new oracle.
    ///
    /// An empty update set draws 0 every time.
    pub fn new(seed: u64, update_set: Vec<i64>) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            update_set,
            draws: 0,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn draws(&self) -> u64 {
        self.draws
    }

    /// Draws the next delta.
    pub fn next_update(&mut self) -> i64 {
        self.draws += 1;
        self.update_set.choose(&mut self.rng).copied().unwrap_or(0)
    }

    /// Draws one delta per slave, in slave order.
    pub fn next_round(&mut self, slaves: usize) -> Vec<i64> {
        (0..slaves).map(|_| self.next_update()).collect()
    }

    /// The exact global sum, saturated at the `i64` bounds the same way the
    /// master's estimate is.
    pub fn true_sum(values: impl IntoIterator<Item = i64>) -> i64 {
        saturating_sum(values)
    }
}

/// `|estimate - truth| / |truth|`; 0 when both are 0, infinite when only
/// the truth is 0.
pub fn relative_error(true_sum: i64, estimate: i64) -> f64 {
    let diff = (estimate as f64 - true_sum as f64).abs();
    if diff == 0.0 {
        0.0
    } else if true_sum == 0 {
        f64::INFINITY
    } else {
        diff / (true_sum as f64).abs()
    }
}

/// True when `estimate` lies within `tolerance × |truth|` of the truth.
///
/// With a tolerance of 0.5 and a positive truth this is exactly
/// `0.5 × truth <= estimate <= 1.5 × truth`.
pub fn within_tolerance(true_sum: i64, estimate: i64, tolerance: f64) -> bool {
    relative_error(true_sum, estimate) <= tolerance
}
