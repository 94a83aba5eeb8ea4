//! Database rows and their conversion into the wire types.

use chrono::{DateTime, Utc};
use hyperlocal_shared::{
    Comment, CommentId, InvalidVoteValue, Post, PostId, VoteRecord, VoteValue,
};

use crate::pagination::SortKey;

#[derive(Debug, sqlx::FromRow)]
pub struct PostRow {
    pub id: i64,
    pub author_id: String,
    pub content: String,
    pub lat: f64,
    pub lon: f64,
    pub score: i64,
    pub comments_count: i64,
    pub created_at: DateTime<Utc>,
    pub my_vote: Option<i16>,
}

impl TryFrom<PostRow> for Post {
    type Error = InvalidVoteValue;

    fn try_from(row: PostRow) -> Result<Self, Self::Error> {
        Ok(Post {
            id: PostId(row.id),
            author_id: row.author_id,
            content: row.content,
            lat: row.lat,
            lon: row.lon,
            score: row.score,
            comments_count: row.comments_count,
            created_at: row.created_at,
            my_vote: row.my_vote.map(VoteValue::try_from).transpose()?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct CommentRow {
    pub id: i64,
    pub post_id: i64,
    pub parent_comment_id: Option<i64>,
    pub author_id: String,
    pub content: String,
    pub score: i64,
    pub replies_count: i64,
    pub created_at: DateTime<Utc>,
    pub my_vote: Option<i16>,
}

impl TryFrom<CommentRow> for Comment {
    type Error = InvalidVoteValue;

    fn try_from(row: CommentRow) -> Result<Self, Self::Error> {
        Ok(Comment {
            id: CommentId(row.id),
            post_id: PostId(row.post_id),
            parent_comment_id: row.parent_comment_id.map(CommentId),
            author_id: row.author_id,
            content: row.content,
            score: row.score,
            replies_count: row.replies_count,
            created_at: row.created_at,
            my_vote: row.my_vote.map(VoteValue::try_from).transpose()?,
            replies: Vec::new(),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct VoteRow {
    pub id: i64,
    pub entity_id: i64,
    pub user_id: String,
    pub value: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<VoteRow> for VoteRecord {
    type Error = InvalidVoteValue;

    fn try_from(row: VoteRow) -> Result<Self, Self::Error> {
        Ok(VoteRecord {
            id: row.id,
            entity_id: row.entity_id,
            user_id: row.user_id,
            value: VoteValue::try_from(row.value)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// The sort columns of a cursor row.
#[derive(Debug, sqlx::FromRow)]
pub struct KeyRow {
    pub id: i64,
    pub score: i64,
    pub created_at: DateTime<Utc>,
}

impl From<KeyRow> for SortKey {
    fn from(row: KeyRow) -> Self {
        SortKey {
            score: row.score,
            created_at: row.created_at,
            id: row.id,
        }
    }
}

pub fn post_key(post: &Post) -> SortKey {
    SortKey {
        score: post.score,
        created_at: post.created_at,
        id: post.id.0,
    }
}

pub fn comment_key(comment: &Comment) -> SortKey {
    SortKey {
        score: comment.score,
        created_at: comment.created_at,
        id: comment.id.0,
    }
}
