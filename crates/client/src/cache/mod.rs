//! # cache
//!
//! Client-side cache of feed screens with optimistic mutations.
//!
//! The same post or comment is usually cached several times: in the nearby feed, in its detail
//! screen, in the author's own list, or inside a parent's reply preview. Every mutation goes
//! through the [CacheCoordinator], which looks up the affected views in the [ViewRegistry],
//! remembers how the touched entities looked, applies a speculative state, and then either
//! patches in the server's numbers or restores those entities. Nothing else in the views is
//! rolled back.

mod coordinator;
mod mutation;
mod registry;
mod view;

#[cfg(test)]
mod tests;

pub use coordinator::{CacheCoordinator, Merge, Notice, ReadOutcome};
pub use mutation::MutationState;
pub use registry::{MutationKind, Selector, Target, ViewRegistry};
pub use view::{Aggregates, EntityRef, View, ViewKey};
