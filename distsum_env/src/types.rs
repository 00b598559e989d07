//! Common types for the distsum environment abstraction.

use crate::error::EnvError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between key segments in the replicated store.
pub(crate) const KEY_SEPARATOR: char = '/';

/// Identity of a participant (the master or one slave).
///
/// Identities double as store key segments, so they must be non-empty and
/// must not contain the key separator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Well-known identity of the master's inbox.
    pub const MASTER: &'static str = "master";

    /// Creates a participant id, validating it as a key segment.
    pub fn new(id: impl Into<String>) -> Result<Self, EnvError> {
        let id = id.into();
        if id.is_empty() || id.contains(KEY_SEPARATOR) {
            return Err(EnvError::InvalidParticipantId(id));
        }
        Ok(Self(id))
    }

    /// Returns the master's well-known identity.
    pub fn master() -> Self {
        Self(Self::MASTER.to_string())
    }

    /// Returns true if this is the master's identity.
    pub fn is_master(&self) -> bool {
        self.0 == Self::MASTER
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The "nobody" identity carried by the empty message sentinel.
    ///
    /// Never valid as a registered participant.
    pub fn nobody() -> Self {
        Self(String::new())
    }

    /// Returns true for the "nobody" identity.
    pub fn is_nobody(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ParticipantId {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = EnvError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        // The sentinel travels through serde too
        if value.is_empty() {
            return Ok(Self::nobody());
        }
        Self::new(value)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

impl AsRef<str> for ParticipantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
