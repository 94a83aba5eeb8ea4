//! Vote values and the transition table both sides derive score deltas from.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid vote value {0}, expected -1, 0 or 1")]
pub struct InvalidVoteValue(pub i64);

/// A single user's vote on a post or comment. On the wire this is the integer -1, 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum VoteValue {
    Down,
    Neutral,
    Up,
}

impl VoteValue {
    pub fn as_i16(self) -> i16 {
        match self {
            VoteValue::Down => -1,
            VoteValue::Neutral => 0,
            VoteValue::Up => 1,
        }
    }
}

impl TryFrom<i64> for VoteValue {
    type Error = InvalidVoteValue;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(VoteValue::Down),
            0 => Ok(VoteValue::Neutral),
            1 => Ok(VoteValue::Up),
            other => Err(InvalidVoteValue(other)),
        }
    }
}

impl TryFrom<i16> for VoteValue {
    type Error = InvalidVoteValue;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        VoteValue::try_from(i64::from(value))
    }
}

impl From<VoteValue> for i64 {
    fn from(value: VoteValue) -> Self {
        i64::from(value.as_i16())
    }
}

/// Outcome of applying a requested vote on top of the previously stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Value the vote record holds afterwards.
    pub stored: VoteValue,
    /// Signed change to apply to the entity's score.
    pub delta: i64,
}

/// The vote state machine.
///
/// `previous` is `None` when the user never voted on the entity. Asking for the value that is
/// already held toggles it off. Switching directly between up and down moves the score by two so
/// that the score always equals the sum of the stored values.
pub fn transition(previous: Option<VoteValue>, requested: VoteValue) -> Transition {
    use VoteValue::*;

    let (stored, delta) = match (previous.unwrap_or(Neutral), requested) {
        (Neutral, Up) => (Up, 1),
        (Neutral, Down) => (Down, -1),
        (Neutral, Neutral) => (Neutral, 0),
        (Up, Up) => (Neutral, -1),
        (Up, Down) => (Down, -2),
        (Up, Neutral) => (Neutral, -1),
        (Down, Up) => (Up, 2),
        (Down, Down) => (Neutral, 1),
        (Down, Neutral) => (Neutral, 1),
    };

    Transition { stored, delta }
}
