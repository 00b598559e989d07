//! End-to-end sessions: one shared store, one master, a handful of slaves.

use distsum_core::{Channel, Constraint, Master, MessageType, ParticipantId, Slave, UpdateOutcome};
use distsum_env::{MemoryStore, SledStore};
use std::collections::HashMap;
use std::sync::Arc;

fn pid(id: &str) -> ParticipantId {
    ParticipantId::new(id).unwrap()
}

#[test]
fn single_slave_walkthrough() {
    let store = MemoryStore::shared();
    let master = Arc::new(Master::new(Arc::new(Channel::new(store.clone()))));
    master
        .channel()
        .register(master.id().clone(), master.clone())
        .unwrap();

    let constraint = Constraint::new(9, 11).unwrap();
    let slave_channel = Arc::new(Channel::new(store.clone()));
    let slave = Arc::new(Slave::new(pid("1"), 10, constraint, slave_channel.clone()).unwrap());
    slave_channel.register(pid("1"), slave.clone()).unwrap();

    master.set_local_values(HashMap::from([(pid("1"), slave.local_value())]));
    master.set_constraints(HashMap::from([(pid("1"), slave.constraint())]));
    assert_eq!(master.global_sum(), 10);

    // 10 + 1 = 11 is accepted
    assert_eq!(slave.update(1).unwrap(), UpdateOutcome::Applied { value: 11 });
    assert_eq!(master.drain().unwrap(), 1);
    assert_eq!(master.global_sum(), 11);

    // 11 + 1 = 12 violates [9, 11]
    assert_eq!(
        slave.update(1).unwrap(),
        UpdateOutcome::Rejected { attempted: 12, constraint }
    );
    assert_eq!(slave.local_value(), 11);
    assert_eq!(master.drain().unwrap(), 1);
    assert_eq!(master.global_sum(), 11);
    assert_eq!(master.violations(&pid("1")).map(|v| v.count), Some(1));
}

#[test]
fn master_tolerates_interleaved_senders() {
    let store = MemoryStore::shared();
    let master = Master::new(Arc::new(Channel::new(store.clone())));
    let constraint = Constraint::new(0, 100).unwrap();

    let slaves: Vec<Slave<MemoryStore>> = (1..=4)
        .map(|i| {
            let channel = Arc::new(Channel::new(store.clone()));
            Slave::new(pid(&i.to_string()), 50, constraint, channel).unwrap()
        })
        .collect();

    master.set_local_values(slaves.iter().map(|s| (s.id().clone(), s.local_value())).collect());

    for round in 0..5 {
        for (i, slave) in slaves.iter().enumerate() {
            let delta = if (round + i) % 2 == 0 { 3 } else { -2 };
            slave.update(delta).unwrap();
        }
    }
    master.drain().unwrap();

    let true_sum: i64 = slaves.iter().map(|s| s.local_value()).sum();
    assert_eq!(master.global_sum(), true_sum);
    for slave in &slaves {
        assert_eq!(master.local_value(slave.id()), Some(slave.local_value()));
    }
}

#[test]
fn announce_bootstraps_an_unseeded_master() {
    let store = MemoryStore::shared();
    let master = Master::new(Arc::new(Channel::new(store.clone())));
    let slave = Slave::new(
        pid("a"),
        4,
        Constraint::new(0, 8).unwrap(),
        Arc::new(Channel::new(store)),
    )
    .unwrap();

    slave.announce().unwrap();
    assert_eq!(master.drain().unwrap(), 2);
    assert_eq!(master.constraint(&pid("a")), Some(slave.constraint()));
    assert_eq!(master.global_sum(), 4);
}

#[test]
fn session_over_sled() {
    let store = Arc::new(SledStore::open_temp().unwrap());
    let master = Master::new(Arc::new(Channel::new(store.clone())));
    let slave = Slave::new(
        pid("1"),
        0,
        Constraint::new(-5, 5).unwrap(),
        Arc::new(Channel::new(store.clone())),
    )
    .unwrap();

    slave.update(-3).unwrap();
    slave.update(-3).unwrap();
    assert_eq!(master.drain().unwrap(), 2);
    assert_eq!(master.global_sum(), -3);

    // Nothing left behind once delivered
    let leftover = master.channel().receive(master.id()).unwrap();
    assert_eq!(leftover.message_type(), MessageType::Null);
}
