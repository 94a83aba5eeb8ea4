use std::collections::HashMap;

use hyperlocal_shared::{CommentId, PostId};

use super::view::ViewKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    VotePost,
    VoteComment,
    CreateComment,
    DeleteComment,
}

/// The entities a mutation is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub post: PostId,
    /// The comment voted on or deleted.
    pub comment: Option<CommentId>,
    /// Parent of that comment, or of the reply being created.
    pub parent: Option<CommentId>,
}

impl Target {
    pub fn post(post: PostId) -> Self {
        Target {
            post,
            comment: None,
            parent: None,
        }
    }
}

/// Maps a mutation target to one view it may have changed.
pub type Selector = fn(&Target) -> Option<ViewKey>;

/// Declares which cached views each kind of mutation affects. New screens plug in by
/// registering a selector instead of touching the coordinator.
#[derive(Debug, Clone)]
pub struct ViewRegistry {
    selectors: HashMap<MutationKind, Vec<Selector>>,
}

impl ViewRegistry {
    pub fn empty() -> Self {
        ViewRegistry {
            selectors: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: MutationKind, selector: Selector) -> &mut Self {
        self.selectors.entry(kind).or_default().push(selector);
        self
    }

    /// Views affected by a mutation, in registration order and without duplicates.
    pub fn affected(&self, kind: MutationKind, target: &Target) -> Vec<ViewKey> {
        let mut keys = Vec::new();
        for selector in self.selectors.get(&kind).into_iter().flatten() {
            match selector(target) {
                Some(key) if !keys.contains(&key) => keys.push(key),
                _ => {}
            }
        }
        keys
    }
}

impl Default for ViewRegistry {
    /// Every screen the client ships with.
    fn default() -> Self {
        use MutationKind::*;

        let mut registry = ViewRegistry::empty();
        registry
            .register(VotePost, |t| Some(ViewKey::PostDetail(t.post)))
            .register(VotePost, |_| Some(ViewKey::NearbyFeed))
            .register(VotePost, |_| Some(ViewKey::MyPosts));

        registry
            .register(VoteComment, |t| t.comment.map(ViewKey::CommentDetail))
            .register(VoteComment, |t| Some(ViewKey::Comments(t.post)))
            .register(VoteComment, |t| t.parent.map(ViewKey::Replies));

        for kind in [CreateComment, DeleteComment] {
            registry
                .register(kind, |t| Some(ViewKey::PostDetail(t.post)))
                .register(kind, |_| Some(ViewKey::NearbyFeed))
                .register(kind, |_| Some(ViewKey::MyPosts))
                .register(kind, |t| Some(ViewKey::Comments(t.post)))
                .register(kind, |t| t.parent.map(ViewKey::CommentDetail))
                .register(kind, |t| t.parent.map(ViewKey::Replies));
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_votes_reach_thread_views() {
        let registry = ViewRegistry::default();
        let target = Target {
            post: PostId(1),
            comment: Some(CommentId(7)),
            parent: Some(CommentId(3)),
        };

        assert_eq!(
            registry.affected(MutationKind::VoteComment, &target),
            vec![
                ViewKey::CommentDetail(CommentId(7)),
                ViewKey::Comments(PostId(1)),
                ViewKey::Replies(CommentId(3)),
            ]
        );
    }

    #[test]
    fn registered_selectors_extend_and_dedupe() {
        let mut registry = ViewRegistry::empty();
        registry
            .register(MutationKind::VotePost, |_| Some(ViewKey::NearbyFeed))
            .register(MutationKind::VotePost, |_| Some(ViewKey::NearbyFeed))
            .register(MutationKind::VotePost, |_| None);

        assert_eq!(
            registry.affected(MutationKind::VotePost, &Target::post(PostId(2))),
            vec![ViewKey::NearbyFeed]
        );
        assert!(
            registry
                .affected(MutationKind::DeleteComment, &Target::post(PostId(2)))
                .is_empty()
        );
    }
}
