use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hyperlocal_shared::{
    Comment, CommentCounters, CommentCreated, CommentDeleted, CommentId, FeedQuery, ListQuery,
    NewComment, Post, PostId, VoteResponse, VoteValue, transition,
};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::mutation::Mutation;
use super::registry::{MutationKind, Target, ViewRegistry};
use super::view::{Aggregates, Cached, EntityRef, View, ViewKey};
use crate::api::{Api, ApiError};

/// Transient message for the user, sent whenever a mutation is rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: MutationKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Stored,
    /// A mutation touched the view while the read was in flight, its result was dropped.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Replace,
    /// Add the fetched pages after the ones already cached.
    Append,
}

impl Merge {
    fn for_cursor(cursor: Option<i64>) -> Self {
        match cursor {
            Some(_) => Merge::Append,
            None => Merge::Replace,
        }
    }
}

type Views = HashMap<ViewKey, View>;

struct InflightRead {
    id: u64,
    abort: AbortHandle,
}

#[derive(Default)]
struct Inner {
    views: Views,
    reads: HashMap<ViewKey, Vec<InflightRead>>,
    /// Bumped on every cancellation so a read that finished just before being aborted is
    /// still discarded.
    epochs: HashMap<ViewKey, u64>,
    pending: HashMap<u64, MutationKind>,
    last_id: u64,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    fn epoch(&self, key: ViewKey) -> u64 {
        self.epochs.get(&key).copied().unwrap_or(0)
    }

    fn cancel_reads(&mut self, key: ViewKey) -> usize {
        *self.epochs.entry(key).or_default() += 1;
        let reads = self.reads.remove(&key).unwrap_or_default();
        for read in &reads {
            read.abort.abort();
        }
        reads.len()
    }

    fn forget_read(&mut self, key: ViewKey, id: u64) {
        if let Some(reads) = self.reads.get_mut(&key) {
            reads.retain(|read| read.id != id);
            if reads.is_empty() {
                self.reads.remove(&key);
            }
        }
    }
}

/// Keeps every cached view of posts and comments coherent while votes and comment writes are
/// applied optimistically.
///
/// Cache state lives behind a synchronous lock that is only ever held between awaits, so the
/// read cancellation and the speculative write of a mutation happen as one step.
pub struct CacheCoordinator {
    api: Arc<dyn Api>,
    registry: ViewRegistry,
    inner: Mutex<Inner>,
    notices: Option<mpsc::UnboundedSender<Notice>>,
}

impl CacheCoordinator {
    pub fn new(api: Arc<dyn Api>) -> Self {
        Self::with_registry(api, ViewRegistry::default())
    }

    pub fn with_registry(api: Arc<dyn Api>, registry: ViewRegistry) -> Self {
        CacheCoordinator {
            api,
            registry,
            inner: Mutex::new(Inner::default()),
            notices: None,
        }
    }

    /// Subscribe to rollback notices. A later call replaces the earlier receiver.
    pub fn notices(&mut self) -> mpsc::UnboundedReceiver<Notice> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.notices = Some(tx);
        rx
    }

    pub fn api(&self) -> &Arc<dyn Api> {
        &self.api
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ===== Views =====

    pub fn view(&self, key: ViewKey) -> Option<View> {
        self.lock().views.get(&key).cloned()
    }

    pub fn insert_view(&self, key: ViewKey, view: View) {
        self.lock().views.insert(key, view);
    }

    pub fn evict(&self, key: ViewKey) -> Option<View> {
        self.lock().views.remove(&key)
    }

    /// Every cached copy of an entity, across all views.
    pub fn copies_of(&self, entity: EntityRef) -> Vec<(ViewKey, Aggregates)> {
        let inner = self.lock();
        let mut copies: Vec<_> = inner
            .views
            .iter()
            .flat_map(|(key, view)| view.copies(entity).into_iter().map(|copy| (*key, copy)))
            .collect();
        copies.sort_by_key(|(key, _)| *key);
        copies
    }

    pub fn pending_mutations(&self) -> usize {
        self.lock().pending.len()
    }

    // ===== Reads =====

    /// Abort every in-flight read of `key`. Mutations are never affected.
    pub fn cancel_reads(&self, key: ViewKey) -> usize {
        self.lock().cancel_reads(key)
    }

    /// Run `fetch` as a cancellable read for `key` and store its result.
    pub async fn refetch<F>(
        &self,
        key: ViewKey,
        merge: Merge,
        fetch: F,
    ) -> Result<ReadOutcome, ApiError>
    where
        F: Future<Output = Result<View, ApiError>> + Send + 'static,
    {
        let (task, read_id, epoch) = {
            let mut inner = self.lock();
            let task = tokio::spawn(fetch);
            let id = inner.next_id();
            inner.reads.entry(key).or_default().push(InflightRead {
                id,
                abort: task.abort_handle(),
            });
            (task, id, inner.epoch(key))
        };

        let joined = task.await;

        let mut inner = self.lock();
        inner.forget_read(key, read_id);
        let view = match joined {
            Ok(result) => result?,
            Err(err) if err.is_cancelled() => {
                debug!(?key, "Read cancelled");
                return Ok(ReadOutcome::Cancelled);
            }
            Err(err) => return Err(ApiError::Task(err.to_string())),
        };
        if inner.epoch(key) != epoch {
            debug!(?key, "Dropped stale read");
            return Ok(ReadOutcome::Cancelled);
        }

        let views = &mut inner.views;
        match views.get_mut(&key) {
            Some(current) if merge == Merge::Append => current.extend(view),
            _ => {
                views.insert(key, view);
            }
        }
        Ok(ReadOutcome::Stored)
    }

    pub async fn load_feed(&self, query: FeedQuery) -> Result<ReadOutcome, ApiError> {
        let api = self.api.clone();
        let merge = Merge::for_cursor(query.cursor);
        self.refetch(ViewKey::NearbyFeed, merge, async move {
            Ok(View::Posts(vec![api.nearby_posts(&query).await?]))
        })
        .await
    }

    pub async fn load_my_posts(&self, query: ListQuery) -> Result<ReadOutcome, ApiError> {
        let api = self.api.clone();
        let merge = Merge::for_cursor(query.cursor);
        self.refetch(ViewKey::MyPosts, merge, async move {
            Ok(View::Posts(vec![api.my_posts(&query).await?]))
        })
        .await
    }

    pub async fn load_post(&self, id: PostId) -> Result<ReadOutcome, ApiError> {
        let api = self.api.clone();
        self.refetch(ViewKey::PostDetail(id), Merge::Replace, async move {
            Ok(View::Post(api.post(id).await?))
        })
        .await
    }

    pub async fn load_comments(
        &self,
        post: PostId,
        query: ListQuery,
    ) -> Result<ReadOutcome, ApiError> {
        let api = self.api.clone();
        let merge = Merge::for_cursor(query.cursor);
        self.refetch(ViewKey::Comments(post), merge, async move {
            Ok(View::Comments(vec![api.comments(post, &query).await?]))
        })
        .await
    }

    pub async fn load_comment(&self, id: CommentId) -> Result<ReadOutcome, ApiError> {
        let api = self.api.clone();
        self.refetch(ViewKey::CommentDetail(id), Merge::Replace, async move {
            Ok(View::Comment(api.comment(id).await?))
        })
        .await
    }

    pub async fn load_replies(
        &self,
        id: CommentId,
        query: ListQuery,
    ) -> Result<ReadOutcome, ApiError> {
        let api = self.api.clone();
        let merge = Merge::for_cursor(query.cursor);
        self.refetch(ViewKey::Replies(id), merge, async move {
            Ok(View::Comments(vec![api.replies(id, &query).await?]))
        })
        .await
    }

    // ===== Mutations =====

    /// Vote on a post. Repeating the current vote withdraws it.
    pub async fn vote_post(
        &self,
        id: PostId,
        value: VoteValue,
    ) -> Result<VoteResponse<Post>, ApiError> {
        let entity = EntityRef::Post(id);
        self.mutate(
            MutationKind::VotePost,
            Target::post(id),
            |views, mutation| speculate_vote(views, mutation, entity, value),
            self.api.vote_post(id, value),
            |views, keys, response: &VoteResponse<Post>| {
                overwrite(views, keys, entity, response.entity.aggregates())
            },
        )
        .await
    }

    /// Vote on a comment or reply, wherever it is cached.
    pub async fn vote_comment(
        &self,
        comment: &Comment,
        value: VoteValue,
    ) -> Result<VoteResponse<Comment>, ApiError> {
        let entity = EntityRef::Comment(comment.id);
        let target = Target {
            post: comment.post_id,
            comment: Some(comment.id),
            parent: comment.parent_comment_id,
        };
        self.mutate(
            MutationKind::VoteComment,
            target,
            |views, mutation| speculate_vote(views, mutation, entity, value),
            self.api.vote_comment(comment.id, value),
            |views, keys, response: &VoteResponse<Comment>| {
                overwrite(views, keys, entity, response.entity.aggregates())
            },
        )
        .await
    }

    /// Add a comment or reply. Cached counters move ahead of the server; the new comment itself
    /// shows up once the affected lists are reloaded.
    pub async fn create_comment(
        &self,
        post: PostId,
        comment: NewComment,
    ) -> Result<CommentCreated, ApiError> {
        let parent = comment.parent_comment_id;
        let target = Target {
            post,
            comment: None,
            parent,
        };
        self.mutate(
            MutationKind::CreateComment,
            target,
            |views, mutation| {
                shift_children(views, mutation, EntityRef::Post(post), 1);
                if let Some(parent) = parent {
                    shift_children(views, mutation, EntityRef::Comment(parent), 1);
                }
            },
            self.api.create_comment(post, &comment),
            |views, keys, created: &CommentCreated| {
                settle_counters(views, keys, created.post.comments_count, &created.parent, post)
            },
        )
        .await
    }

    /// Delete a comment, removing it and its replies from cached lists right away.
    pub async fn delete_comment(&self, comment: &Comment) -> Result<CommentDeleted, ApiError> {
        let id = comment.id;
        let post = comment.post_id;
        let parent = comment.parent_comment_id;
        let target = Target {
            post,
            comment: Some(id),
            parent,
        };
        self.mutate(
            MutationKind::DeleteComment,
            target,
            |views, mutation| {
                let replies = match parent {
                    Some(_) => 0,
                    None => first_copy(views, &mutation.keys, EntityRef::Comment(id))
                        .map_or(0, |copy| copy.children),
                };
                shift_children(views, mutation, EntityRef::Post(post), -(1 + replies));
                if let Some(parent) = parent {
                    shift_children(views, mutation, EntityRef::Comment(parent), -1);
                }
                mutation.take_comment(views, id);
            },
            self.api.delete_comment(id),
            |views, keys, deleted: &CommentDeleted| {
                settle_counters(views, keys, deleted.post.comments_count, &deleted.parent, post)
            },
        )
        .await
    }

    async fn mutate<T>(
        &self,
        kind: MutationKind,
        target: Target,
        speculate: impl FnOnce(&mut Views, &mut Mutation),
        call: impl Future<Output = Result<T, ApiError>>,
        settle: impl FnOnce(&mut Views, &[ViewKey], &T),
    ) -> Result<T, ApiError> {
        let keys = self.registry.affected(kind, &target);
        let mut mutation = {
            let mut inner = self.lock();
            let id = inner.next_id();
            let mut mutation = Mutation::begin(id, kind, keys);
            for key in &mutation.keys {
                inner.cancel_reads(*key);
            }
            speculate(&mut inner.views, &mut mutation);
            inner.pending.insert(id, kind);
            mutation
        };
        debug!(
            id = mutation.id,
            ?kind,
            state = ?mutation.state(),
            views = mutation.keys.len(),
            "Applied speculative update"
        );

        let result = call.await;

        let mut inner = self.lock();
        inner.pending.remove(&mutation.id);
        match result {
            Ok(response) => {
                settle(&mut inner.views, &mutation.keys, &response);
                mutation.succeed();
                debug!(id = mutation.id, ?kind, state = ?mutation.state(), "Patched server state");
                Ok(response)
            }
            Err(err) => {
                mutation.rollback(&mut inner.views);
                drop(inner);
                warn!(id = mutation.id, ?kind, error = %err, "Mutation failed, cached entities restored");
                self.notify(Notice {
                    kind: mutation.kind,
                    message: rollback_message(kind, &err),
                });
                Err(err)
            }
        }
    }

    fn notify(&self, notice: Notice) {
        if let Some(notices) = &self.notices {
            // Nobody listening is fine.
            let _ = notices.send(notice);
        }
    }
}

fn rollback_message(kind: MutationKind, err: &ApiError) -> String {
    let action = match kind {
        MutationKind::VotePost | MutationKind::VoteComment => "Vote",
        MutationKind::CreateComment => "Comment",
        MutationKind::DeleteComment => "Delete",
    };
    if err.is_not_found() {
        format!("{} failed: it was deleted", action)
    } else {
        format!("{} failed, please try again", action)
    }
}

// ===== Cache patches =====

fn first_copy(views: &Views, keys: &[ViewKey], entity: EntityRef) -> Option<Aggregates> {
    keys.iter()
        .filter_map(|key| views.get(key))
        .flat_map(|view| view.copies(entity))
        .next()
}

/// Write the same aggregates into every copy of `entity` in the affected views.
fn overwrite(views: &mut Views, keys: &[ViewKey], entity: EntityRef, next: Aggregates) {
    for key in keys {
        if let Some(view) = views.get_mut(key) {
            view.update(entity, &mut |_| next);
        }
    }
}

/// Derive the speculative vote from the first cached copy, with the same transition table the
/// server applies.
fn speculate_vote(
    views: &mut Views,
    mutation: &mut Mutation,
    entity: EntityRef,
    value: VoteValue,
) {
    let Some(current) = first_copy(views, &mutation.keys, entity) else {
        return;
    };
    mutation.remember(entity, current);
    let step = transition(current.my_vote, value);
    let next = Aggregates {
        score: current.score + step.delta,
        my_vote: Some(step.stored),
        ..current
    };
    overwrite(views, &mutation.keys, entity, next);
}

fn shift_children(views: &mut Views, mutation: &mut Mutation, entity: EntityRef, delta: i64) {
    if let Some(current) = first_copy(views, &mutation.keys, entity) {
        mutation.remember(entity, current);
        let children = (current.children + delta).max(0);
        set_children(views, &mutation.keys, entity, children);
    }
}

fn set_children(views: &mut Views, keys: &[ViewKey], entity: EntityRef, children: i64) {
    for key in keys {
        if let Some(view) = views.get_mut(key) {
            view.update(entity, &mut |copy| Aggregates { children, ..copy });
        }
    }
}

fn settle_counters(
    views: &mut Views,
    keys: &[ViewKey],
    comments_count: i64,
    parent: &Option<CommentCounters>,
    post: PostId,
) {
    set_children(views, keys, EntityRef::Post(post), comments_count);
    if let Some(parent) = parent {
        set_children(views, keys, EntityRef::Comment(parent.id), parent.replies_count);
    }
}
