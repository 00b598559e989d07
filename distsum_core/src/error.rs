//! Protocol error taxonomy.

use crate::constraint::Constraint;
use distsum_env::{EnvError, ParticipantId};
use thiserror::Error;

/// Errors surfaced by the distsum protocol.
///
/// Constraint violations are not errors: `Slave::update` reports them to the
/// master as a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A participant id was registered twice on one channel
    #[error("Participant {0} is already registered on this channel")]
    DuplicateRegistration(ParticipantId),

    /// The underlying store could not be reached; a report may be lost
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(#[source] EnvError),

    #[error("Invalid constraint: min {min} is greater than max {max}")]
    InvalidConstraint { min: i64, max: i64 },

    #[error("Value {value} lies outside {constraint}")]
    ValueOutOfRange { value: i64, constraint: Constraint },

    #[error("Invalid participant: {0}")]
    InvalidParticipant(String),

    /// A stored message could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),
}

impl ProtocolError {
    /// Returns true for failures the caller should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProtocolError::ChannelUnavailable(_))
    }
}

impl From<EnvError> for ProtocolError {
    fn from(e: EnvError) -> Self {
        match e {
            EnvError::InvalidParticipantId(id) => ProtocolError::InvalidParticipant(id),
            other => ProtocolError::ChannelUnavailable(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_channel_failures_are_transient() {
        let unavailable: ProtocolError = EnvError::unavailable("down").into();
        assert!(unavailable.is_transient());

        let dup = ProtocolError::DuplicateRegistration(ParticipantId::master());
        assert!(!dup.is_transient());

        let invalid: ProtocolError = EnvError::InvalidParticipantId("a/b".into()).into();
        assert_eq!(invalid, ProtocolError::InvalidParticipant("a/b".into()));
    }
}
