use std::collections::HashMap;

use hyperlocal_shared::CommentId;

use super::registry::MutationKind;
use super::view::{Aggregates, EntityRef, Removed, View, ViewKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Pending,
    Succeeded,
    Failed,
}

/// An in-flight mutation and what its speculative write changed: the aggregates of the
/// entities it touched, as they were before, and the comments it took out of lists.
///
/// Rolling back restores only those, so whatever else happened to the affected views in the
/// meantime (other mutations settling, fresh loads, appended pages) stays in place.
#[derive(Debug)]
pub(crate) struct Mutation {
    pub id: u64,
    pub kind: MutationKind,
    pub keys: Vec<ViewKey>,
    before: Vec<(EntityRef, Aggregates)>,
    removed: Vec<(ViewKey, Removed)>,
    state: MutationState,
}

impl Mutation {
    pub fn begin(id: u64, kind: MutationKind, keys: Vec<ViewKey>) -> Self {
        Mutation {
            id,
            kind,
            keys,
            before: Vec::new(),
            removed: Vec::new(),
            state: MutationState::Pending,
        }
    }

    pub fn state(&self) -> MutationState {
        self.state
    }

    /// Record the aggregates `entity` had before this mutation. The first record wins.
    pub fn remember(&mut self, entity: EntityRef, aggregates: Aggregates) {
        if self.before.iter().all(|(seen, _)| *seen != entity) {
            self.before.push((entity, aggregates));
        }
    }

    /// Take a comment out of every affected view, keeping its place for a rollback.
    pub fn take_comment(&mut self, views: &mut HashMap<ViewKey, View>, id: CommentId) {
        for key in &self.keys {
            if let Some(view) = views.get_mut(key) {
                for removed in view.take_comment(id) {
                    self.removed.push((*key, removed));
                }
            }
        }
    }

    pub fn succeed(&mut self) {
        self.state = MutationState::Succeeded;
        self.before.clear();
        self.removed.clear();
    }

    /// Undo the speculative write in the affected views that are still cached.
    pub fn rollback(&mut self, views: &mut HashMap<ViewKey, View>) {
        for (key, removed) in self.removed.drain(..) {
            if let Some(view) = views.get_mut(&key) {
                view.restore_comment(removed);
            }
        }
        for (entity, before) in self.before.drain(..) {
            for key in &self.keys {
                if let Some(view) = views.get_mut(key) {
                    view.update(entity, &mut |_| before);
                }
            }
        }
        self.state = MutationState::Failed;
    }
}
