//! Types shared by the hyperlocal server and its clients.

pub mod models;
pub mod vote;

pub use models::*;
pub use vote::{InvalidVoteValue, Transition, VoteValue, transition};
