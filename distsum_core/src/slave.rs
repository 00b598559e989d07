//! A value-holding participant bound by a constraint.

use crate::channel::{Channel, Participant};
use crate::constraint::Constraint;
use crate::error::ProtocolError;
use crate::message::{Message, MessageBody};
use distsum_env::{ParticipantId, ReplicatedStore};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

/// Result of one [`Slave::update`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The candidate satisfied the constraint and is now the local value
    Applied { value: i64 },

    /// The candidate fell outside the constraint; the value is unchanged.
    /// An overflowing candidate is reported saturated at the `i64` bounds.
    Rejected { attempted: i64, constraint: Constraint },
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }
}

/// A slave owns one integer and the constraint it must satisfy.
///
/// The value only ever changes through [`Slave::update`], and every update
/// reports to the master, accepted or not, so the master can tell a live
/// slave from a silent one.
pub struct Slave<S: ReplicatedStore + ?Sized> {
    id: ParticipantId,
    constraint: Constraint,
    local_value: Mutex<i64>,
    channel: Arc<Channel<S>>,
}

impl<S: ReplicatedStore + ?Sized> Slave<S> {
    /// Creates a slave holding `initial_value`.
    ///
    /// The initial value must satisfy the constraint, and the master's
    /// identity is reserved.
    pub fn new(
        id: ParticipantId,
        initial_value: i64,
        constraint: Constraint,
        channel: Arc<Channel<S>>,
    ) -> Result<Self, ProtocolError> {
        if id.is_master() || id.is_nobody() {
            return Err(ProtocolError::InvalidParticipant(format!(
                "{:?} is reserved",
                id.as_str()
            )));
        }
        if !constraint.contains(initial_value) {
            return Err(ProtocolError::ValueOutOfRange {
                value: initial_value,
                constraint,
            });
        }

        Ok(Self {
            id,
            constraint,
            local_value: Mutex::new(initial_value),
            channel,
        })
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn local_value(&self) -> i64 {
        *self.local_value.lock()
    }

    pub fn constraint(&self) -> Constraint {
        self.constraint
    }

    pub fn channel(&self) -> &Arc<Channel<S>> {
        &self.channel
    }

    /// Applies `delta` if the result satisfies the constraint, then reports.
    ///
    /// Exactly one message goes to the master per call: REPLY with the new
    /// value, or CONSTRAINT_VIOLATION with the rejected candidate. An
    /// addition that overflows is out of range by definition.
    ///
    /// If the report cannot be written the local transition has still
    /// happened and `ChannelUnavailable` is returned; [`Slave::report`]
    /// re-sends the current value.
    pub fn update(&self, delta: i64) -> Result<UpdateOutcome, ProtocolError> {
        // Held through the send so reports leave in application order
        let mut value = self.local_value.lock();

        let (outcome, message) = match value.checked_add(delta) {
            Some(candidate) if self.constraint.contains(candidate) => {
                *value = candidate;
                (
                    UpdateOutcome::Applied { value: candidate },
                    Message::reply(self.id.clone(), candidate),
                )
            }
            candidate => {
                let attempted = candidate.unwrap_or_else(|| value.saturating_add(delta));
                debug!(
                    slave = %self.id,
                    attempted,
                    constraint = %self.constraint,
                    "update rejected"
                );
                (
                    UpdateOutcome::Rejected {
                        attempted,
                        constraint: self.constraint,
                    },
                    Message::violation(self.id.clone(), attempted, self.constraint),
                )
            }
        };

        trace!(slave = %self.id, delta, ?outcome, "update");
        self.channel.send(&message)?;
        Ok(outcome)
    }

    /// Sends the current value to the master as a REPLY.
    pub fn report(&self) -> Result<(), ProtocolError> {
        let value = self.local_value.lock();
        self.channel.send(&Message::reply(self.id.clone(), *value))
    }

    /// Declares the constraint and current value to the master.
    pub fn announce(&self) -> Result<(), ProtocolError> {
        self.channel
            .send(&Message::constraint(self.id.clone(), self.constraint))?;
        self.report()
    }

    /// Polls this slave's inbox and handles everything pending.
    pub fn poll(&self) -> Result<usize, ProtocolError> {
        let mut handled = 0;
        loop {
            let message = self.channel.receive(&self.id)?;
            if message.is_empty() {
                return Ok(handled);
            }
            self.handle(&message)?;
            handled += 1;
        }
    }

    fn handle(&self, message: &Message) -> Result<(), ProtocolError> {
        match message.body() {
            MessageBody::Get => {
                debug!(slave = %self.id, from = %message.from(), "answering GET");
                self.report()
            }
            _ => {
                trace!(slave = %self.id, "ignoring {}", message);
                Ok(())
            }
        }
    }
}

impl<S: ReplicatedStore + ?Sized> Participant for Slave<S> {
    fn id(&self) -> &ParticipantId {
        &self.id
    }

    fn on_message(&self, message: Message) -> Result<(), ProtocolError> {
        self.handle(&message)
    }
}
