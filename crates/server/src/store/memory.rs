//! In-memory backend.
//!
//! Every operation runs under one lock, which plays the role of the transaction: a vote's
//! ledger write and score change, or a comment and its counters, are never observable apart.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use hyperlocal_shared::{
    Comment, CommentCounters, CommentCreated, CommentDeleted, CommentId, NewComment, NewPost,
    Page, Post, PostCounters, PostId, SortMode, VoteRecord, VoteResponse, VoteValue, transition,
};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::{CommentScope, PostScope, REPLY_PREVIEW, Store, validate_content};
use crate::error::StoreError;
use crate::geo::check_coordinates;
use crate::models::{comment_key, post_key};
use crate::pagination::{SortKey, Window, seal};

#[derive(Debug)]
struct Stored<T> {
    entity: T,
    deleted: bool,
}

type Ledger = HashMap<(String, i64), VoteRecord>;

#[derive(Debug, Default)]
struct State {
    posts: BTreeMap<i64, Stored<Post>>,
    comments: BTreeMap<i64, Stored<Comment>>,
    post_votes: Ledger,
    comment_votes: Ledger,
    blocks: HashSet<(String, String)>,
    last_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn blocked(&self, viewer: &str, author: &str) -> bool {
        self.blocks.contains(&(viewer.to_owned(), author.to_owned()))
    }

    fn active_post(&self, id: i64) -> Option<&Post> {
        self.posts
            .get(&id)
            .filter(|p| !p.deleted)
            .map(|p| &p.entity)
    }

    /// An active comment whose post is active too.
    fn active_comment(&self, id: i64) -> Option<&Comment> {
        self.comments
            .get(&id)
            .filter(|c| !c.deleted)
            .map(|c| &c.entity)
            .filter(|c| self.active_post(c.post_id.0).is_some())
    }

    fn post_for(&self, viewer: &str, post: &Post) -> Post {
        Post {
            my_vote: my_vote(&self.post_votes, viewer, post.id.0),
            ..post.clone()
        }
    }

    fn comment_for(&self, viewer: &str, comment: &Comment) -> Comment {
        Comment {
            my_vote: my_vote(&self.comment_votes, viewer, comment.id.0),
            ..comment.clone()
        }
    }

    fn visible_comments(&self, viewer: &str, scope: CommentScope) -> Vec<Comment> {
        self.comments
            .values()
            .filter(|c| !c.deleted)
            .map(|c| &c.entity)
            .filter(|c| match scope {
                CommentScope::TopLevel(post) => c.post_id == post && c.parent_comment_id.is_none(),
                CommentScope::Replies(parent) => c.parent_comment_id == Some(parent),
            })
            .filter(|c| !self.blocked(viewer, &c.author_id))
            .map(|c| self.comment_for(viewer, c))
            .collect()
    }
}

/// Record `value` in `ledger` and return the stored record with the score delta. `fresh_id` is
/// used if the user never voted on this entity before.
fn record_vote(
    ledger: &mut Ledger,
    last_id: &mut i64,
    user: &str,
    id: i64,
    value: VoteValue,
) -> (VoteRecord, i64) {
    let key = (user.to_owned(), id);
    let previous = ledger.get(&key).map(|v| v.value);
    let step = transition(previous, value);
    debug!(?previous, stored = ?step.stored, delta = step.delta, "vote transition");

    let now = Utc::now();
    let record = ledger.entry(key).or_insert_with(|| {
        *last_id += 1;
        VoteRecord {
            id: *last_id,
            entity_id: id,
            user_id: user.to_owned(),
            value: VoteValue::Neutral,
            created_at: now,
            updated_at: now,
        }
    });
    record.value = step.stored;
    record.updated_at = now;

    (record.clone(), step.delta)
}

fn my_vote(ledger: &Ledger, viewer: &str, id: i64) -> Option<VoteValue> {
    ledger.get(&(viewer.to_owned(), id)).map(|v| v.value)
}

/// Keyset-paginate rows already restricted to the listing's scope.
fn paginate<T>(
    mut rows: Vec<T>,
    key: impl Fn(&T) -> SortKey,
    window: &Window,
) -> Page<T> {
    let sort = window.sort;
    if let Some(cursor) = window.cursor {
        let Some(cursor) = rows.iter().map(&key).find(|k| k.id == cursor) else {
            debug!(cursor, "stale cursor, ending pagination");
            return Page::empty();
        };
        rows.retain(|row| key(row).follows(&cursor, sort));
    }

    rows.sort_by(|a, b| key(a).cmp_in(&key(b), sort));
    rows.truncate(usize::try_from(window.fetch_size()).unwrap_or(usize::MAX));
    seal(rows, window.limit)
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    #[instrument(skip(self, post))]
    async fn create_post(&self, author: &str, post: &NewPost) -> Result<Post, StoreError> {
        let content = validate_content(&post.content)?;
        check_coordinates(post.lat, post.lon)?;

        let mut state = self.state.lock().await;
        let id = state.next_id();
        let created = Post {
            id: PostId(id),
            author_id: author.to_owned(),
            content,
            lat: post.lat,
            lon: post.lon,
            score: 0,
            comments_count: 0,
            created_at: Utc::now(),
            my_vote: None,
        };
        state.posts.insert(
            id,
            Stored {
                entity: created.clone(),
                deleted: false,
            },
        );
        Ok(created)
    }

    async fn post(&self, viewer: &str, id: PostId) -> Result<Post, StoreError> {
        let state = self.state.lock().await;
        let post = state.active_post(id.0).ok_or(StoreError::NotFound)?;
        Ok(state.post_for(viewer, post))
    }

    #[instrument(skip(self))]
    async fn delete_post(&self, author: &str, id: PostId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.posts.get_mut(&id.0) {
            Some(post) if !post.deleted && post.entity.author_id == author => {
                post.deleted = true;
                Ok(())
            }
            _ => Err(StoreError::NotFound),
        }
    }

    #[instrument(skip(self))]
    async fn list_posts(
        &self,
        viewer: &str,
        scope: &PostScope,
        window: &Window,
    ) -> Result<Page<Post>, StoreError> {
        let state = self.state.lock().await;
        let rows = state
            .posts
            .values()
            .filter(|p| !p.deleted)
            .map(|p| &p.entity)
            .filter(|p| match scope {
                PostScope::Near(bbox) => {
                    bbox.contains(p.lat, p.lon) && !state.blocked(viewer, &p.author_id)
                }
                PostScope::AuthoredBy(author) => &p.author_id == author,
            })
            .map(|p| state.post_for(viewer, p))
            .collect();

        Ok(paginate(rows, post_key, window))
    }

    #[instrument(skip(self, comment))]
    async fn create_comment(
        &self,
        author: &str,
        post: PostId,
        comment: &NewComment,
    ) -> Result<CommentCreated, StoreError> {
        let content = validate_content(&comment.content)?;

        let mut state = self.state.lock().await;
        if state.active_post(post.0).is_none() {
            return Err(StoreError::NotFound);
        }
        if let Some(parent) = comment.parent_comment_id {
            let parent = state
                .active_comment(parent.0)
                .ok_or_else(|| StoreError::validation("parent comment not found"))?;
            if parent.post_id != post || parent.parent_comment_id.is_some() {
                return Err(StoreError::validation(
                    "replies must answer a top-level comment of the same post",
                ));
            }
        }

        let id = state.next_id();
        let created = Comment {
            id: CommentId(id),
            post_id: post,
            parent_comment_id: comment.parent_comment_id,
            author_id: author.to_owned(),
            content,
            score: 0,
            replies_count: 0,
            created_at: Utc::now(),
            my_vote: None,
            replies: Vec::new(),
        };
        state.comments.insert(
            id,
            Stored {
                entity: created.clone(),
                deleted: false,
            },
        );

        let post = match state.posts.get_mut(&post.0) {
            Some(stored) => {
                stored.entity.comments_count += 1;
                PostCounters {
                    id: post,
                    comments_count: stored.entity.comments_count,
                }
            }
            None => return Err(StoreError::NotFound),
        };
        let parent = match comment.parent_comment_id {
            Some(parent) => match state.comments.get_mut(&parent.0) {
                Some(stored) => {
                    stored.entity.replies_count += 1;
                    Some(CommentCounters {
                        id: parent,
                        replies_count: stored.entity.replies_count,
                    })
                }
                None => return Err(StoreError::validation("parent comment not found")),
            },
            None => None,
        };

        Ok(CommentCreated {
            comment: created,
            post,
            parent,
        })
    }

    async fn comment(&self, viewer: &str, id: CommentId) -> Result<Comment, StoreError> {
        let state = self.state.lock().await;
        let comment = state.active_comment(id.0).ok_or(StoreError::NotFound)?;
        Ok(state.comment_for(viewer, comment))
    }

    #[instrument(skip(self))]
    async fn delete_comment(
        &self,
        author: &str,
        id: CommentId,
    ) -> Result<CommentDeleted, StoreError> {
        let mut state = self.state.lock().await;
        let target = state
            .active_comment(id.0)
            .filter(|c| c.author_id == author)
            .ok_or(StoreError::NotFound)?;
        let (post_id, parent_id) = (target.post_id, target.parent_comment_id);

        let mut removed = 0;
        for stored in state.comments.values_mut() {
            let cascades = parent_id.is_none() && stored.entity.parent_comment_id == Some(id);
            if !stored.deleted && (stored.entity.id == id || cascades) {
                stored.deleted = true;
                removed += 1;
            }
        }

        let post = state
            .posts
            .get_mut(&post_id.0)
            .map(|stored| {
                stored.entity.comments_count -= removed;
                PostCounters {
                    id: post_id,
                    comments_count: stored.entity.comments_count,
                }
            })
            .ok_or(StoreError::NotFound)?;
        let parent = parent_id.and_then(|parent| {
            state.comments.get_mut(&parent.0).map(|stored| {
                stored.entity.replies_count -= 1;
                CommentCounters {
                    id: parent,
                    replies_count: stored.entity.replies_count,
                }
            })
        });

        Ok(CommentDeleted {
            post,
            parent,
            removed,
        })
    }

    #[instrument(skip(self))]
    async fn list_comments(
        &self,
        viewer: &str,
        scope: CommentScope,
        window: &Window,
    ) -> Result<Page<Comment>, StoreError> {
        let state = self.state.lock().await;
        let parent_exists = match scope {
            CommentScope::TopLevel(post) => state.active_post(post.0).is_some(),
            CommentScope::Replies(parent) => state
                .active_comment(parent.0)
                .is_some_and(|c| c.parent_comment_id.is_none()),
        };
        if !parent_exists {
            return Err(StoreError::NotFound);
        }

        let mut page = paginate(state.visible_comments(viewer, scope), comment_key, window);

        if let CommentScope::TopLevel(_) = scope {
            let preview = Window {
                sort: SortMode::Top,
                cursor: None,
                limit: REPLY_PREVIEW as i64,
            };
            for comment in &mut page.items {
                let replies = state.visible_comments(viewer, CommentScope::Replies(comment.id));
                comment.replies = paginate(replies, comment_key, &preview).items;
            }
        }

        Ok(page)
    }

    #[instrument(skip(self))]
    async fn vote_post(
        &self,
        user: &str,
        id: PostId,
        value: VoteValue,
    ) -> Result<VoteResponse<Post>, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.active_post(id.0).is_none() {
            return Err(StoreError::NotFound);
        }

        let (vote, delta) =
            record_vote(&mut state.post_votes, &mut state.last_id, user, id.0, value);
        let post = {
            let stored = state.posts.get_mut(&id.0).ok_or(StoreError::NotFound)?;
            stored.entity.score += delta;
            stored.entity.clone()
        };
        let entity = state.post_for(user, &post);

        Ok(VoteResponse { vote, entity })
    }

    #[instrument(skip(self))]
    async fn vote_comment(
        &self,
        user: &str,
        id: CommentId,
        value: VoteValue,
    ) -> Result<VoteResponse<Comment>, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.active_comment(id.0).is_none() {
            return Err(StoreError::NotFound);
        }

        let (vote, delta) =
            record_vote(&mut state.comment_votes, &mut state.last_id, user, id.0, value);
        let comment = {
            let stored = state.comments.get_mut(&id.0).ok_or(StoreError::NotFound)?;
            stored.entity.score += delta;
            stored.entity.clone()
        };
        let entity = state.comment_for(user, &comment);

        Ok(VoteResponse { vote, entity })
    }

    async fn block_user(&self, blocker: &str, blocked: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .blocks
            .insert((blocker.to_owned(), blocked.to_owned()));
        Ok(())
    }
}
