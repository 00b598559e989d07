//! The aggregation engine: last-known value per slave, summed on demand.

use crate::channel::{Channel, Participant};
use crate::constraint::Constraint;
use crate::error::ProtocolError;
use crate::message::{Message, MessageBody};
use distsum_env::{ParticipantId, ReplicatedStore};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Adds up `values`, clamping the result to `i64::MIN..=i64::MAX`.
///
/// Every value fits its constraint, but many slaves near the edge of wide
/// constraints can still push the total past `i64`. The sum is taken in
/// `i128` so the result only saturates once, at the end.
pub fn saturating_sum(values: impl IntoIterator<Item = i64>) -> i64 {
    let total: i128 = values.into_iter().map(i128::from).sum();
    i64::try_from(total).unwrap_or(if total < 0 { i64::MIN } else { i64::MAX })
}

/// Rejected update attempts seen from one slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ViolationRecord {
    pub count: u64,
    pub last_attempted: i64,
}

/// Point-in-time copy of the master's view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateSnapshot {
    pub local_values: BTreeMap<ParticipantId, i64>,
    pub constraints: BTreeMap<ParticipantId, Constraint>,
    pub violations: BTreeMap<ParticipantId, ViolationRecord>,
    pub global_sum: i64,
    pub processed: u64,
}

#[derive(Default)]
struct AggregateView {
    local_values: HashMap<ParticipantId, i64>,
    constraints: HashMap<ParticipantId, Constraint>,
    violations: HashMap<ParticipantId, ViolationRecord>,
    processed: u64,
}

/// The master keeps the best-known value of every slave.
///
/// It never holds a "true" global sum. Each REPLY overwrites the sender's
/// entry (last write per key wins), and [`Master::global_sum`] adds up
/// whatever the view holds at that instant. Slaves keep moving while their
/// reports are in flight, so the result is an estimate.
pub struct Master<S: ReplicatedStore + ?Sized> {
    id: ParticipantId,
    channel: Arc<Channel<S>>,
    view: RwLock<AggregateView>,
}

impl<S: ReplicatedStore + ?Sized> Master<S> {
    pub fn new(channel: Arc<Channel<S>>) -> Self {
        Self {
            id: ParticipantId::master(),
            channel,
            view: RwLock::new(AggregateView::default()),
        }
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn channel(&self) -> &Arc<Channel<S>> {
        &self.channel
    }

    /// Seeds the last-known values, replacing the current mapping.
    ///
    /// Must run before aggregation starts, otherwise a slave that has not
    /// reported yet is silently missing from the sum.
    pub fn set_local_values(&self, values: HashMap<ParticipantId, i64>) {
        self.view.write().local_values = values;
    }

    /// Seeds the declared constraints, replacing the current mapping.
    pub fn set_constraints(&self, constraints: HashMap<ParticipantId, Constraint>) {
        self.view.write().constraints = constraints;
    }

    /// Applies one message to the view.
    pub fn on_message(&self, message: &Message) {
        let from = message.from();
        let mut view = self.view.write();

        match message.body() {
            MessageBody::Reply { value } => {
                if let Some(constraint) = view.constraints.get(from) {
                    if !constraint.contains(*value) {
                        warn!(slave = %from, value, %constraint, "reported value outside declared constraint");
                    }
                }
                trace!(slave = %from, value, "reply");
                view.local_values.insert(from.clone(), *value);
            }
            MessageBody::Constraint { constraint } => {
                debug!(slave = %from, %constraint, "constraint declared");
                view.constraints.insert(from.clone(), *constraint);
            }
            MessageBody::ConstraintViolation {
                attempted,
                constraint,
            } => {
                debug!(slave = %from, attempted, %constraint, "constraint violation");
                let record = view
                    .violations
                    .entry(from.clone())
                    .or_insert(ViolationRecord {
                        count: 0,
                        last_attempted: *attempted,
                    });
                record.count += 1;
                record.last_attempted = *attempted;
            }
            MessageBody::Get | MessageBody::Null => {
                trace!("ignoring {}", message);
                return;
            }
        }

        view.processed += 1;
    }

    /// Sum of the last-known values.
    ///
    /// A slave that never reported contributes 0; so does an id the master
    /// has never heard of. Saturates at the `i64` bounds, see
    /// [`saturating_sum`].
    pub fn global_sum(&self) -> i64 {
        saturating_sum(self.view.read().local_values.values().copied())
    }

    pub fn local_value(&self, id: &ParticipantId) -> Option<i64> {
        self.view.read().local_values.get(id).copied()
    }

    pub fn constraint(&self, id: &ParticipantId) -> Option<Constraint> {
        self.view.read().constraints.get(id).copied()
    }

    pub fn violations(&self, id: &ParticipantId) -> Option<ViolationRecord> {
        self.view.read().violations.get(id).copied()
    }

    /// Number of messages that changed the view.
    pub fn processed(&self) -> u64 {
        self.view.read().processed
    }

    /// Every slave the view knows about, in id order.
    pub fn participants(&self) -> Vec<ParticipantId> {
        let view = self.view.read();
        view.local_values
            .keys()
            .chain(view.constraints.keys())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        let view = self.view.read();
        AggregateSnapshot {
            local_values: view.local_values.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            constraints: view.constraints.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            violations: view.violations.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            global_sum: saturating_sum(view.local_values.values().copied()),
            processed: view.processed,
        }
    }

    /// Applies every pending message in the master's inbox.
    ///
    /// Returns the number of messages drained.
    pub fn drain(&self) -> Result<usize, ProtocolError> {
        let mut drained = 0;
        loop {
            let message = self.channel.receive(&self.id)?;
            if message.is_empty() {
                return Ok(drained);
            }
            self.on_message(&message);
            drained += 1;
        }
    }

    /// Sends GET to every known slave so stale entries get refreshed.
    ///
    /// Targets are the view's participants plus every member registered in
    /// the store. Returns the number of requests sent.
    pub fn request_values(&self) -> Result<usize, ProtocolError> {
        let mut targets: BTreeSet<ParticipantId> = self.participants().into_iter().collect();
        targets.extend(self.channel.members()?);
        targets.remove(&self.id);

        for target in &targets {
            self.channel.send_to(target, &Message::get(self.id.clone()))?;
        }
        debug!(count = targets.len(), "reconciliation requests sent");
        Ok(targets.len())
    }
}

impl<S: ReplicatedStore + ?Sized> Participant for Master<S> {
    fn id(&self) -> &ParticipantId {
        &self.id
    }

    fn on_message(&self, message: Message) -> Result<(), ProtocolError> {
        Master::on_message(self, &message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slave::{Slave, UpdateOutcome};
    use distsum_env::MemoryStore;

    fn pid(id: &str) -> ParticipantId {
        ParticipantId::new(id).unwrap()
    }

    fn master() -> Master<MemoryStore> {
        Master::new(Arc::new(Channel::new(MemoryStore::shared())))
    }

    #[test]
    fn test_reply_overwrites_last_known_value() {
        let m = master();
        m.on_message(&Message::reply(pid("1"), 10));
        m.on_message(&Message::reply(pid("2"), 5));
        m.on_message(&Message::reply(pid("1"), 11));

        assert_eq!(m.local_value(&pid("1")), Some(11));
        assert_eq!(m.global_sum(), 16);
        assert_eq!(m.processed(), 3);
    }

    #[test]
    fn test_constraint_message_does_not_touch_values() {
        let m = master();
        let c = Constraint::new(9, 11).unwrap();
        m.on_message(&Message::constraint(pid("1"), c));

        assert_eq!(m.constraint(&pid("1")), Some(c));
        assert_eq!(m.local_value(&pid("1")), None);
        assert_eq!(m.global_sum(), 0);
        assert_eq!(m.participants(), vec![pid("1")]);
    }

    #[test]
    fn test_violation_is_tracked_not_applied() {
        let m = master();
        let c = Constraint::new(9, 11).unwrap();
        m.set_local_values(HashMap::from([(pid("1"), 11)]));

        m.on_message(&Message::violation(pid("1"), 12, c));
        m.on_message(&Message::violation(pid("1"), 13, c));

        assert_eq!(m.global_sum(), 11);
        assert_eq!(
            m.violations(&pid("1")),
            Some(ViolationRecord { count: 2, last_attempted: 13 })
        );
    }

    #[test]
    fn test_get_and_null_are_ignored() {
        let m = master();
        m.on_message(&Message::get(pid("1")));
        m.on_message(&Message::empty());
        assert_eq!(m.processed(), 0);
        assert!(m.participants().is_empty());
    }

    #[test]
    fn test_unknown_participant_contributes_zero() {
        let m = master();
        m.set_local_values(HashMap::from([(pid("1"), 4), (pid("2"), 6)]));
        assert_eq!(m.global_sum(), 10);
        assert_eq!(m.local_value(&pid("3")), None);
    }

    #[test]
    fn test_global_sum_saturates_instead_of_overflowing() {
        let store = MemoryStore::shared();
        let m = Master::new(Arc::new(Channel::new(store.clone())));
        let wide = Constraint::new(0, i64::MAX).unwrap();

        for id in ["1", "2"] {
            let channel = Arc::new(Channel::new(store.clone()));
            let slave = Slave::new(pid(id), i64::MAX - 1, wide, channel).unwrap();
            assert_eq!(slave.update(1).unwrap(), UpdateOutcome::Applied { value: i64::MAX });
        }

        assert_eq!(m.drain().unwrap(), 2);
        assert_eq!(m.global_sum(), i64::MAX);
        assert_eq!(m.snapshot().global_sum, i64::MAX);

        m.set_local_values(HashMap::from([(pid("1"), i64::MIN), (pid("2"), -1)]));
        assert_eq!(m.global_sum(), i64::MIN);
    }

    #[test]
    fn test_saturating_sum_is_exact_when_the_total_fits() {
        assert_eq!(saturating_sum([i64::MAX, 1, -2]), i64::MAX - 1);
        assert_eq!(saturating_sum([i64::MIN, i64::MAX]), -1);
        assert_eq!(saturating_sum(std::iter::empty()), 0);
    }

    #[test]
    fn test_reply_outside_constraint_is_applied() {
        let m = master();
        m.set_constraints(HashMap::from([(pid("1"), Constraint::new(9, 11).unwrap())]));
        m.set_local_values(HashMap::from([(pid("1"), 10), (pid("2"), 3)]));

        m.on_message(&Message::reply(pid("1"), 50));

        assert_eq!(m.local_value(&pid("1")), Some(50));
        assert_eq!(m.global_sum(), 53);
        assert_eq!(m.violations(&pid("1")), None);
        assert_eq!(m.processed(), 1);
    }

    #[test]
    fn test_seeding_replaces_view() {
        let m = master();
        let c = Constraint::new(0, 5).unwrap();
        m.set_local_values(HashMap::from([(pid("1"), 1)]));
        m.set_constraints(HashMap::from([(pid("1"), c), (pid("2"), c)]));

        m.set_local_values(HashMap::from([(pid("2"), 2)]));
        assert_eq!(m.local_value(&pid("1")), None);
        assert_eq!(m.global_sum(), 2);
        assert_eq!(m.participants(), vec![pid("1"), pid("2")]);
    }

    #[test]
    fn test_drain_and_reconcile_over_channel() {
        let store = MemoryStore::shared();
        let m = Master::new(Arc::new(Channel::new(store.clone())));

        let slave_channel = Arc::new(Channel::new(store));
        let slave = Arc::new(
            Slave::new(pid("7"), 3, Constraint::new(0, 10).unwrap(), slave_channel.clone()).unwrap(),
        );
        slave_channel.register(pid("7"), slave.clone()).unwrap();

        slave.update(2).unwrap();
        assert_eq!(m.drain().unwrap(), 1);
        assert_eq!(m.global_sum(), 5);

        // Forget the slave, then rediscover it through the membership list
        m.set_local_values(HashMap::new());
        assert_eq!(m.request_values().unwrap(), 1);
        assert_eq!(slave_channel.pump().unwrap(), 1);
        assert_eq!(m.drain().unwrap(), 1);
        assert_eq!(m.local_value(&pid("7")), Some(5));
    }

    #[test]
    fn test_snapshot_matches_view() {
        let m = master();
        m.on_message(&Message::reply(pid("2"), 8));
        m.on_message(&Message::reply(pid("1"), 2));

        let snap = m.snapshot();
        assert_eq!(snap.global_sum, 10);
        assert_eq!(snap.local_values.keys().cloned().collect::<Vec<_>>(), vec![pid("1"), pid("2")]);
        assert_eq!(snap.processed, 2);
    }
}
