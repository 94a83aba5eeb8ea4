//! # store
//!
//! Storage abstraction for posts, comments and their vote ledgers.
//!
//! Scores and child counts are denormalized aggregates. Every backend maintains them
//! incrementally, in the same atomic unit of work as the ledger or comment write that changes
//! them, and never recomputes them from ledger rows at read time.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use hyperlocal_shared::{
    Comment, CommentCreated, CommentDeleted, CommentId, NewComment, NewPost, Page, Post, PostId,
    VoteResponse, VoteValue,
};

use crate::error::StoreError;
use crate::geo::BoundingBox;
use crate::pagination::Window;

/// Which posts a listing covers.
#[derive(Debug, Clone, PartialEq)]
pub enum PostScope {
    /// Posts inside a bounding box, minus authors the viewer blocked.
    Near(BoundingBox),
    /// Posts written by the given user.
    AuthoredBy(String),
}

/// Which comments a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentScope {
    /// Top-level comments of a post, each with a preview of its best replies.
    TopLevel(PostId),
    Replies(CommentId),
}

/// Number of replies embedded under each top-level comment of a listing.
pub const REPLY_PREVIEW: usize = 3;

#[async_trait]
pub trait Store: Send + Sync {
    /// Round-trip to the backend, for health checks.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn create_post(&self, author: &str, post: &NewPost) -> Result<Post, StoreError>;
    /// Retrieve an active post as seen by `viewer`.
    async fn post(&self, viewer: &str, id: PostId) -> Result<Post, StoreError>;
    /// Soft-delete a post. Only its author may do so; anyone else gets [StoreError::NotFound].
    async fn delete_post(&self, author: &str, id: PostId) -> Result<(), StoreError>;
    async fn list_posts(
        &self,
        viewer: &str,
        scope: &PostScope,
        window: &Window,
    ) -> Result<Page<Post>, StoreError>;

    /// Insert a comment or reply, bumping the post's `comments_count` and, for replies, the
    /// parent's `replies_count` in the same transaction.
    async fn create_comment(
        &self,
        author: &str,
        post: PostId,
        comment: &NewComment,
    ) -> Result<CommentCreated, StoreError>;
    async fn comment(&self, viewer: &str, id: CommentId) -> Result<Comment, StoreError>;
    /// Soft-delete a comment. Deleting a top-level comment takes its replies with it, and the
    /// post's `comments_count` drops by everything removed.
    async fn delete_comment(&self, author: &str, id: CommentId)
    -> Result<CommentDeleted, StoreError>;
    async fn list_comments(
        &self,
        viewer: &str,
        scope: CommentScope,
        window: &Window,
    ) -> Result<Page<Comment>, StoreError>;

    /// Apply `value` to the user's vote on a post, see [hyperlocal_shared::transition].
    async fn vote_post(
        &self,
        user: &str,
        id: PostId,
        value: VoteValue,
    ) -> Result<VoteResponse<Post>, StoreError>;
    async fn vote_comment(
        &self,
        user: &str,
        id: CommentId,
        value: VoteValue,
    ) -> Result<VoteResponse<Comment>, StoreError>;

    /// Hide everything `blocked` writes from `blocker`'s listings. Blocking twice is a no-op.
    async fn block_user(&self, blocker: &str, blocked: &str) -> Result<(), StoreError>;
}

pub const MAX_CONTENT_CHARS: usize = 2000;

/// Trimmed post or comment body, rejected when empty or too long.
pub(crate) fn validate_content(content: &str) -> Result<String, StoreError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(StoreError::validation("content must not be empty"));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(StoreError::validation(format!(
            "content must be at most {MAX_CONTENT_CHARS} characters"
        )));
    }
    Ok(content.to_string())
}
