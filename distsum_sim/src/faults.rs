//! Store fault injection.

use distsum_env::StoreController;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tracing::debug;

/// Takes the shared store offline for whole rounds at a seeded rate.
pub struct FaultInjector {
    /// Absent for backends without an availability switch
    controller: Option<Arc<dyn StoreController>>,

    rng: ChaCha8Rng,

    /// Probability that a round runs with the store offline (0.0 - 1.0)
    outage_rate: f64,

    /// Rounds rolled offline so far
    outages: u64,
}

impl FaultInjector {
    pub fn new(seed: u64, controller: Option<Arc<dyn StoreController>>, outage_rate: f64) -> Self {
        Self {
            controller,
            rng: ChaCha8Rng::seed_from_u64(seed),
            outage_rate: outage_rate.clamp(0.0, 1.0),
            outages: 0,
        }
    }

    /// Decides availability for the next round and applies it.
    ///
    /// Returns whether the store is reachable.
    pub fn roll(&mut self) -> bool {
        let Some(controller) = &self.controller else {
            return true;
        };
        if self.outage_rate <= 0.0 {
            return true;
        }

        let available = !self.rng.gen_bool(self.outage_rate);
        controller.set_available(available);
        if !available {
            self.outages += 1;
            debug!(outages = self.outages, "store offline for this round");
        }
        available
    }

    /// Brings the store back online.
    pub fn heal(&self) {
        if let Some(controller) = &self.controller {
            controller.set_available(true);
        }
    }

    pub fn is_available(&self) -> bool {
        self.controller.as_ref().map_or(true, |c| c.is_available())
    }

    pub fn outages(&self) -> u64 {
        self.outages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distsum_env::MemoryStore;

    #[test]
    fn test_no_controller_is_always_available() {
        let mut faults = FaultInjector::new(1, None, 1.0);
        assert!(faults.roll());
        assert!(faults.is_available());
        assert_eq!(faults.outages(), 0);
    }

    #[test]
    fn test_full_outage_rate_takes_store_offline() {
        let store = MemoryStore::shared();
        let mut faults = FaultInjector::new(1, Some(store.clone()), 1.0);

        assert!(!faults.roll());
        assert!(!store.is_available());
        assert_eq!(faults.outages(), 1);

        faults.heal();
        assert!(store.is_available());
    }

    #[test]
    fn test_outages_are_deterministic() {
        let rolls = |seed| {
            let store = MemoryStore::shared();
            let mut faults = FaultInjector::new(seed, Some(store), 0.3);
            (0..100).map(|_| faults.roll()).collect::<Vec<_>>()
        };
        assert_eq!(rolls(9), rolls(9));
    }
}
