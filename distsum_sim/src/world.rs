//! SimWorld - one complete distsum session.

use crate::context::SimContext;
use crate::error::SimError;
use crate::faults::FaultInjector;
use crate::oracle::{UpdateOracle, DEFAULT_UPDATE_SET};

use distsum_core::{Channel, Constraint, Master, ProtocolConfig, Slave};
use distsum_env::{MemoryStore, ParticipantId, ReplicatedStore, SledStore, StoreController};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// The store type every participant in a world talks through.
pub type DynStore = dyn ReplicatedStore;

/// Which store implementation backs the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreBackend {
    /// Shared in-memory map; supports outage injection
    Memory,
    /// Temporary sled database
    Sled,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreBackend::Memory),
            "sled" => Ok(StoreBackend::Sled),
            _ => Err(format!("Unknown store backend: {}", s)),
        }
    }
}

/// Configuration for a simulation session.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of slaves to spawn
    pub num_slaves: usize,

    /// Every slave starts with this value
    pub initial_value: i64,

    /// Every slave gets the constraint [constraint_min, constraint_max]
    pub constraint_min: i64,
    pub constraint_max: i64,

    /// Deltas the oracle draws from
    pub update_set: Vec<i64>,

    /// Store implementation
    pub store: StoreBackend,

    /// Probability that a round runs with the store offline
    pub outage_rate: f64,

    /// Channel and runtime tunables
    pub protocol: ProtocolConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_slaves: 4,
            initial_value: 10,
            constraint_min: 9,
            constraint_max: 11,
            update_set: DEFAULT_UPDATE_SET.to_vec(),
            store: StoreBackend::Memory,
            outage_rate: 0.0,
            protocol: ProtocolConfig::default(),
        }
    }
}

/// The SimWorld - container for one session.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Update draws and ground truth
    pub oracle: UpdateOracle,

    /// Store fault injection
    pub faults: FaultInjector,

    /// The replicated store every channel writes through
    store: Arc<DynStore>,

    /// The master, registered on its own channel
    pub master: Arc<Master<DynStore>>,

    /// Slaves in spawn order
    pub slaves: Vec<Arc<Slave<DynStore>>>,
}

impl SimWorld {
    /// Creates a world with its store and master; slaves come later.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        // Derive separate seeds for different subsystems
        let context_seed = config.seed;
        let update_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let fault_seed = config.seed.wrapping_mul(0x517cc1b727220a95);

        let (store, controller): (Arc<DynStore>, Option<Arc<dyn StoreController>>) = match config.store {
            StoreBackend::Memory => {
                let memory = MemoryStore::shared();
                let store: Arc<DynStore> = memory.clone();
                let controller: Arc<dyn StoreController> = memory;
                (store, Some(controller))
            }
            StoreBackend::Sled => {
                let store: Arc<DynStore> = Arc::new(SledStore::open_temp()?);
                (store, None)
            }
        };

        let master = Self::build_master(&store, &config.protocol)?;

        Ok(Self {
            context: SimContext::shared(context_seed),
            oracle: UpdateOracle::new(update_seed, config.update_set.clone()),
            faults: FaultInjector::new(fault_seed, controller, config.outage_rate),
            store,
            master,
            slaves: Vec::new(),
            config,
        })
    }

    fn build_master(store: &Arc<DynStore>, protocol: &ProtocolConfig) -> Result<Arc<Master<DynStore>>, SimError> {
        let channel = Arc::new(Channel::with_config(store.clone(), protocol));
        let master = Arc::new(Master::new(channel));
        master.channel().register(master.id().clone(), master.clone())?;
        Ok(master)
    }

    /// The constraint every slave is created with.
    pub fn constraint(&self) -> Result<Constraint, SimError> {
        Ok(Constraint::new(self.config.constraint_min, self.config.constraint_max)?)
    }

    /// Spawns the configured slaves, registers them, and seeds the master.
    ///
    /// Each slave gets its own channel handle over the shared store, the
    /// way each process would hold its own replica.
    pub fn spawn_slaves(&mut self) -> Result<Vec<ParticipantId>, SimError> {
        let constraint = self.constraint()?;
        let mut ids = Vec::with_capacity(self.config.num_slaves);

        for i in 1..=self.config.num_slaves {
            let id = ParticipantId::new(i.to_string())?;
            let channel = Arc::new(Channel::with_config(self.store.clone(), &self.config.protocol));
            let slave = Arc::new(Slave::new(id.clone(), self.config.initial_value, constraint, channel)?);
            slave.channel().register(id.clone(), slave.clone())?;

            self.slaves.push(slave);
            ids.push(id);
        }

        self.seed_master(&self.master);
        info!(slaves = ids.len(), constraint = %constraint, "session bootstrapped");
        Ok(ids)
    }

    /// Seeds a master with every slave's current value and constraint.
    pub fn seed_master(&self, master: &Master<DynStore>) {
        let values: HashMap<ParticipantId, i64> = self
            .slaves
            .iter()
            .map(|s| (s.id().clone(), s.local_value()))
            .collect();
        let constraints: HashMap<ParticipantId, Constraint> = self
            .slaves
            .iter()
            .map(|s| (s.id().clone(), s.constraint()))
            .collect();

        master.set_local_values(values);
        master.set_constraints(constraints);
    }

    /// Replaces the master with a fresh instance, as after a crash.
    ///
    /// The new master is seeded with `stale_values` instead of the truth.
    pub fn restart_master(&mut self, stale_values: HashMap<ParticipantId, i64>) -> Result<(), SimError> {
        self.master.channel().unregister(self.master.id())?;
        let master = Self::build_master(&self.store, &self.config.protocol)?;
        self.seed_master(&master);
        master.set_local_values(stale_values);
        self.master = master;
        Ok(())
    }

    /// Exact sum of every slave's local value.
    pub fn true_sum(&self) -> i64 {
        UpdateOracle::true_sum(self.slaves.iter().map(|s| s.local_value()))
    }

    /// Delivers pending GETs to every slave.
    pub fn pump_slaves(&self) -> Result<usize, SimError> {
        let mut handled = 0;
        for slave in &self.slaves {
            handled += slave.channel().pump()?;
        }
        Ok(handled)
    }

    pub fn store(&self) -> &Arc<DynStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_slaves_seeds_master() {
        let config = SimConfig {
            num_slaves: 3,
            ..Default::default()
        };
        let mut world = SimWorld::new(config).unwrap();
        let ids = world.spawn_slaves().unwrap();

        assert_eq!(ids.len(), 3);
        assert_eq!(world.true_sum(), 30);
        assert_eq!(world.master.global_sum(), 30);
        assert_eq!(world.master.participants(), ids);
        assert_eq!(world.master.channel().members().unwrap().len(), 4);
    }

    #[test]
    fn test_restart_master_uses_stale_view() {
        let mut world = SimWorld::new(SimConfig::default()).unwrap();
        let ids = world.spawn_slaves().unwrap();

        let stale = ids.iter().map(|id| (id.clone(), 9)).collect();
        world.restart_master(stale).unwrap();
        assert_eq!(world.master.global_sum(), 36);

        world.master.request_values().unwrap();
        world.pump_slaves().unwrap();
        world.master.drain().unwrap();
        assert_eq!(world.master.global_sum(), world.true_sum());
    }

    #[test]
    fn test_sled_backend_bootstraps() {
        let config = SimConfig {
            store: StoreBackend::Sled,
            num_slaves: 2,
            ..Default::default()
        };
        let mut world = SimWorld::new(config).unwrap();
        world.spawn_slaves().unwrap();

        world.slaves[0].update(1).unwrap();
        world.master.drain().unwrap();
        assert_eq!(world.master.global_sum(), 21);
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("sled".parse::<StoreBackend>(), Ok(StoreBackend::Sled));
        assert_eq!("Memory".parse::<StoreBackend>(), Ok(StoreBackend::Memory));
        assert!("redis".parse::<StoreBackend>().is_err());
    }
}
