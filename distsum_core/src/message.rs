//! The message envelope exchanged between participants.

use crate::constraint::Constraint;
use crate::error::ProtocolError;
use distsum_env::ParticipantId;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Type tag of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// "No message"; only carried by the empty sentinel
    Null,
    /// A slave's current value
    Reply,
    /// A slave's declared constraint
    Constraint,
    /// A rejected update attempt
    ConstraintViolation,
    /// Master asks a slave for its current value
    Get,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Null => "NULL",
            MessageType::Reply => "REPLY",
            MessageType::Constraint => "CONSTRAINT",
            MessageType::ConstraintViolation => "CONSTRAINT_VIOLATION",
            MessageType::Get => "GET",
        };
        f.write_str(name)
    }
}

/// Payload of a message, one variant per [`MessageType`].
///
/// The sender's identity lives on the envelope, so a REPLY carrying
/// `(id, value)` only needs the value here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    Null,
    Reply { value: i64 },
    Constraint { constraint: Constraint },
    /// A rejected update. When `value + delta` overflows, `attempted` holds
    /// the saturated candidate (`i64::MAX` or `i64::MIN`), not the true one.
    ConstraintViolation { attempted: i64, constraint: Constraint },
    Get,
}

impl MessageBody {
    /// Payload-free body for `kind`; numeric fields are zero and bounds
    /// collapse to `[0, 0]`.
    pub fn empty_of(kind: MessageType) -> Self {
        let zero = Constraint::point(0);
        match kind {
            MessageType::Null => MessageBody::Null,
            MessageType::Reply => MessageBody::Reply { value: 0 },
            MessageType::Constraint => MessageBody::Constraint { constraint: zero },
            MessageType::ConstraintViolation => MessageBody::ConstraintViolation {
                attempted: 0,
                constraint: zero,
            },
            MessageType::Get => MessageBody::Get,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Null => MessageType::Null,
            MessageBody::Reply { .. } => MessageType::Reply,
            MessageBody::Constraint { .. } => MessageType::Constraint,
            MessageBody::ConstraintViolation { .. } => MessageType::ConstraintViolation,
            MessageBody::Get => MessageType::Get,
        }
    }
}

/// An immutable envelope: sender, payload and a unique id.
///
/// Every constructor except [`Message::empty`] draws a fresh v4 UUID. The id
/// carries no ordering; it exists for deduplication and tracing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    from: ParticipantId,
    body: MessageBody,
}

impl Message {
    /// Creates a message from `from` carrying `body`.
    pub fn new(from: ParticipantId, body: MessageBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            body,
        }
    }

    /// Creates a message of the given type with an empty body.
    ///
    /// Only GET carries no payload in practice; the typed constructors
    /// below are the normal way to build the others.
    pub fn of_type(from: ParticipantId, kind: MessageType) -> Self {
        Self::new(from, MessageBody::empty_of(kind))
    }

    /// The "no message" sentinel returned by an empty inbox.
    ///
    /// Its nil id can never collide with a generated one, so it compares
    /// unequal to every real message.
    pub fn empty() -> Self {
        Self {
            id: Uuid::nil(),
            from: ParticipantId::nobody(),
            body: MessageBody::Null,
        }
    }

    pub fn reply(from: ParticipantId, value: i64) -> Self {
        Self::new(from, MessageBody::Reply { value })
    }

    pub fn constraint(from: ParticipantId, constraint: Constraint) -> Self {
        Self::new(from, MessageBody::Constraint { constraint })
    }

    pub fn violation(from: ParticipantId, attempted: i64, constraint: Constraint) -> Self {
        Self::new(
            from,
            MessageBody::ConstraintViolation {
                attempted,
                constraint,
            },
        )
    }

    pub fn get(from: ParticipantId) -> Self {
        Self::new(from, MessageBody::Get)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn from(&self) -> &ParticipantId {
        &self.from
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Returns true for the sentinel (or any NULL-typed message).
    pub fn is_empty(&self) -> bool {
        self.body == MessageBody::Null
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Codec(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Codec(e.to_string()))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {:?} ({})", self.message_type(), self.from.as_str(), self.id)
    }
}
