//! Inclusive numeric bounds on a slave's value.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A closed range `[min, max]` bounding a slave's legal value.
///
/// Immutable once built; `min <= max` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawConstraint")]
pub struct Constraint {
    min: i64,
    max: i64,
}

#[derive(Deserialize)]
struct RawConstraint {
    min: i64,
    max: i64,
}

impl TryFrom<RawConstraint> for Constraint {
    type Error = ProtocolError;

    fn try_from(raw: RawConstraint) -> Result<Self, Self::Error> {
        Constraint::new(raw.min, raw.max)
    }
}

impl Constraint {
    /// Creates a constraint, rejecting inverted bounds.
    pub fn new(min: i64, max: i64) -> Result<Self, ProtocolError> {
        if min > max {
            return Err(ProtocolError::InvalidConstraint { min, max });
        }
        Ok(Self { min, max })
    }

    /// The single-value constraint `[value, value]`.
    pub fn point(value: i64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    /// Membership test: `min <= value <= max`.
    pub fn contains(&self, value: i64) -> bool {
        self.min <= value && value <= self.max
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bounds_are_inclusive() {
        let c = Constraint::new(9, 11).unwrap();
        assert!(c.contains(9));
        assert!(c.contains(11));
        assert!(!c.contains(8));
        assert!(!c.contains(12));
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        assert_eq!(
            Constraint::new(5, 4),
            Err(ProtocolError::InvalidConstraint { min: 5, max: 4 })
        );
        assert!(Constraint::new(4, 4).is_ok());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Constraint = serde_json::from_str(r#"{"min":1,"max":3}"#).unwrap();
        assert_eq!(ok, Constraint::new(1, 3).unwrap());
        assert!(serde_json::from_str::<Constraint>(r#"{"min":3,"max":1}"#).is_err());
    }

    proptest! {
        #[test]
        fn prop_contains_matches_bounds(a in -1000i64..1000, b in -1000i64..1000, v in -2000i64..2000) {
            let (min, max) = if a <= b { (a, b) } else { (b, a) };
            let c = Constraint::new(min, max).unwrap();
            prop_assert_eq!(c.contains(v), min <= v && v <= max);
        }
    }
}
