use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use hyperlocal_shared::{
    Comment, CommentCounters, CommentCreated, CommentDeleted, CommentId, FeedQuery, ListQuery,
    NewComment, NewPost, Page, Post, PostCounters, PostId, VoteRecord, VoteResponse, VoteValue,
    transition,
};
use tokio::sync::{Notify, oneshot};

use super::*;
use crate::api::{Api, ApiError};

// ===== Fake backend =====

#[derive(Default)]
struct FakeApi {
    posts: Mutex<HashMap<PostId, Post>>,
    comments: Mutex<HashMap<CommentId, Comment>>,
    votes: Mutex<HashMap<EntityRef, VoteValue>>,
    fail: AtomicBool,
    hold: AtomicBool,
    release: Notify,
}

impl FakeApi {
    /// Every mutation passes through here before touching state.
    async fn gate(&self) -> Result<(), ApiError> {
        if self.hold.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 503,
                body: "storage transaction failed, retry".into(),
            });
        }
        Ok(())
    }

    fn record(
        &self,
        entity: EntityRef,
        entity_id: i64,
        requested: VoteValue,
    ) -> (VoteRecord, i64) {
        let mut votes = self.votes.lock().unwrap();
        let step = transition(votes.get(&entity).copied(), requested);
        votes.insert(entity, step.stored);
        let record = VoteRecord {
            id: 1,
            entity_id,
            user_id: "me".into(),
            value: step.stored,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        (record, step.delta)
    }
}

fn not_found() -> ApiError {
    ApiError::Status {
        status: 404,
        body: "Not found".into(),
    }
}

fn page<T>(items: Vec<T>) -> Page<T> {
    Page {
        items,
        has_more: false,
    }
}

#[async_trait]
impl Api for FakeApi {
    async fn nearby_posts(&self, _query: &FeedQuery) -> Result<Page<Post>, ApiError> {
        let mut posts: Vec<_> = self.posts.lock().unwrap().values().cloned().collect();
        posts.sort_by_key(|post| std::cmp::Reverse(post.id));
        Ok(page(posts))
    }

    async fn my_posts(&self, query: &ListQuery) -> Result<Page<Post>, ApiError> {
        let feed = FeedQuery {
            lat: 0.0,
            lon: 0.0,
            distance: None,
            cursor: query.cursor,
            limit: query.limit,
            sort: query.sort,
        };
        self.nearby_posts(&feed).await
    }

    async fn post(&self, id: PostId) -> Result<Post, ApiError> {
        self.posts.lock().unwrap().get(&id).cloned().ok_or_else(not_found)
    }

    async fn create_post(&self, _post: &NewPost) -> Result<Post, ApiError> {
        Err(ApiError::Status {
            status: 501,
            body: "not scripted".into(),
        })
    }

    async fn comments(&self, post: PostId, _query: &ListQuery) -> Result<Page<Comment>, ApiError> {
        let comments = self.comments.lock().unwrap();
        Ok(page(
            comments
                .values()
                .filter(|c| c.post_id == post && c.parent_comment_id.is_none())
                .cloned()
                .collect(),
        ))
    }

    async fn comment(&self, id: CommentId) -> Result<Comment, ApiError> {
        self.comments.lock().unwrap().get(&id).cloned().ok_or_else(not_found)
    }

    async fn replies(
        &self,
        id: CommentId,
        _query: &ListQuery,
    ) -> Result<Page<Comment>, ApiError> {
        let comments = self.comments.lock().unwrap();
        Ok(page(
            comments
                .values()
                .filter(|c| c.parent_comment_id == Some(id))
                .cloned()
                .collect(),
        ))
    }

    async fn create_comment(
        &self,
        post: PostId,
        new: &NewComment,
    ) -> Result<CommentCreated, ApiError> {
        self.gate().await?;
        let mut posts = self.posts.lock().unwrap();
        let mut comments = self.comments.lock().unwrap();

        let id = CommentId(comments.keys().map(|id| id.0).max().unwrap_or(0) + 1);
        let mut comment = sample_comment(id.0, post, new.parent_comment_id, 0);
        comment.content = new.content.clone();
        comments.insert(id, comment.clone());

        let owner = posts.get_mut(&post).ok_or_else(not_found)?;
        owner.comments_count += 1;
        let post_counters = PostCounters {
            id: post,
            comments_count: owner.comments_count,
        };
        let parent = match new.parent_comment_id {
            Some(parent) => {
                let parent = comments.get_mut(&parent).ok_or_else(not_found)?;
                parent.replies_count += 1;
                Some(CommentCounters {
                    id: parent.id,
                    replies_count: parent.replies_count,
                })
            }
            None => None,
        };
        Ok(CommentCreated {
            comment,
            post: post_counters,
            parent,
        })
    }

    async fn delete_comment(&self, id: CommentId) -> Result<CommentDeleted, ApiError> {
        self.gate().await?;
        let mut posts = self.posts.lock().unwrap();
        let mut comments = self.comments.lock().unwrap();

        let comment = comments.remove(&id).ok_or_else(not_found)?;
        let before = comments.len();
        comments.retain(|_, c| c.parent_comment_id != Some(id));
        let removed = 1 + (before - comments.len()) as i64;

        let owner = posts.get_mut(&comment.post_id).ok_or_else(not_found)?;
        owner.comments_count -= removed;
        let parent = match comment.parent_comment_id {
            Some(parent) => {
                let parent = comments.get_mut(&parent).ok_or_else(not_found)?;
                parent.replies_count -= 1;
                Some(CommentCounters {
                    id: parent.id,
                    replies_count: parent.replies_count,
                })
            }
            None => None,
        };
        Ok(CommentDeleted {
            post: PostCounters {
                id: owner.id,
                comments_count: owner.comments_count,
            },
            parent,
            removed,
        })
    }

    async fn vote_post(
        &self,
        id: PostId,
        value: VoteValue,
    ) -> Result<VoteResponse<Post>, ApiError> {
        self.gate().await?;
        let (vote, delta) = self.record(EntityRef::Post(id), id.0, value);
        let mut posts = self.posts.lock().unwrap();
        let post = posts.get_mut(&id).ok_or_else(not_found)?;
        post.score += delta;
        post.my_vote = Some(vote.value);
        Ok(VoteResponse {
            vote,
            entity: post.clone(),
        })
    }

    async fn vote_comment(
        &self,
        id: CommentId,
        value: VoteValue,
    ) -> Result<VoteResponse<Comment>, ApiError> {
        self.gate().await?;
        let (vote, delta) = self.record(EntityRef::Comment(id), id.0, value);
        let mut comments = self.comments.lock().unwrap();
        let comment = comments.get_mut(&id).ok_or_else(not_found)?;
        comment.score += delta;
        comment.my_vote = Some(vote.value);
        Ok(VoteResponse {
            vote,
            entity: comment.clone(),
        })
    }

    async fn block_user(&self, _user: &str) -> Result<(), ApiError> {
        Ok(())
    }
}

// ===== Fixture =====

fn sample_post(id: i64, score: i64, comments_count: i64) -> Post {
    Post {
        id: PostId(id),
        author_id: "me".into(),
        content: format!("post {id}"),
        lat: 48.85,
        lon: 2.35,
        score,
        comments_count,
        created_at: Utc::now(),
        my_vote: None,
    }
}

fn sample_comment(id: i64, post: PostId, parent: Option<CommentId>, replies: i64) -> Comment {
    Comment {
        id: CommentId(id),
        post_id: post,
        parent_comment_id: parent,
        author_id: "neighbor".into(),
        content: format!("comment {id}"),
        score: 0,
        replies_count: replies,
        created_at: Utc::now(),
        my_vote: None,
        replies: Vec::new(),
    }
}

const POST: PostId = PostId(1);
const TOP: CommentId = CommentId(10);
const REPLY: CommentId = CommentId(11);

/// Post 1 (score 5) with comment 10 and its replies 11 and 12, plus an unrelated post 2.
/// Post 1 is cached in the feed, the own-posts list and its detail screen; reply 11 sits in the
/// comment list preview, the reply list and its own detail screen.
fn fixture() -> (Arc<FakeApi>, CacheCoordinator) {
    let api = Arc::new(FakeApi::default());
    let post = sample_post(1, 5, 3);
    let other = sample_post(2, 0, 0);
    let top = sample_comment(10, POST, None, 2);
    let reply = sample_comment(11, POST, Some(TOP), 0);
    let second = sample_comment(12, POST, Some(TOP), 0);

    api.posts
        .lock()
        .unwrap()
        .extend([(post.id, post.clone()), (other.id, other.clone())]);
    api.comments.lock().unwrap().extend([
        (top.id, top.clone()),
        (reply.id, reply.clone()),
        (second.id, second.clone()),
    ]);

    let coordinator = CacheCoordinator::new(api.clone());
    coordinator.insert_view(
        ViewKey::NearbyFeed,
        View::Posts(vec![page(vec![other, post.clone()])]),
    );
    coordinator.insert_view(ViewKey::MyPosts, View::Posts(vec![page(vec![post.clone()])]));
    coordinator.insert_view(ViewKey::PostDetail(POST), View::Post(post));

    let mut previewed = top;
    previewed.replies = vec![reply.clone(), second.clone()];
    coordinator.insert_view(ViewKey::Comments(POST), View::Comments(vec![page(vec![previewed])]));
    coordinator.insert_view(
        ViewKey::Replies(TOP),
        View::Comments(vec![page(vec![reply.clone(), second])]),
    );
    coordinator.insert_view(ViewKey::CommentDetail(REPLY), View::Comment(reply));

    (api, coordinator)
}

fn scores(coordinator: &CacheCoordinator, entity: EntityRef) -> Vec<i64> {
    coordinator
        .copies_of(entity)
        .into_iter()
        .map(|(_, copy)| copy.score)
        .collect()
}

fn children(coordinator: &CacheCoordinator, entity: EntityRef) -> Vec<i64> {
    coordinator
        .copies_of(entity)
        .into_iter()
        .map(|(_, copy)| copy.children)
        .collect()
}

fn assert_consistent(coordinator: &CacheCoordinator, entity: EntityRef) {
    let copies = coordinator.copies_of(entity);
    assert!(
        copies.windows(2).all(|pair| pair[0].1 == pair[1].1),
        "copies disagree: {copies:?}"
    );
}

fn all_views(coordinator: &CacheCoordinator) -> Vec<Option<View>> {
    [
        ViewKey::NearbyFeed,
        ViewKey::MyPosts,
        ViewKey::PostDetail(POST),
        ViewKey::Comments(POST),
        ViewKey::Replies(TOP),
        ViewKey::CommentDetail(REPLY),
        ViewKey::CommentDetail(TOP),
    ]
    .into_iter()
    .map(|key| coordinator.view(key))
    .collect()
}

async fn wait_for_pending(coordinator: &CacheCoordinator, expected: usize) {
    for _ in 0..1000 {
        if coordinator.pending_mutations() == expected {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("never reached {expected} pending mutations");
}

// ===== Votes =====

#[tokio::test]
async fn speculative_vote_reaches_every_view_while_pending() {
    let (api, coordinator) = fixture();
    let coordinator = Arc::new(coordinator);
    api.hold.store(true, Ordering::SeqCst);

    let task = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.vote_post(POST, VoteValue::Up).await }
    });
    wait_for_pending(&coordinator, 1).await;

    assert_eq!(scores(&coordinator, EntityRef::Post(POST)), vec![6, 6, 6]);
    assert_consistent(&coordinator, EntityRef::Post(POST));

    api.release.notify_one();
    let response = task.await.unwrap().unwrap();

    assert_eq!(response.entity.score, 6);
    assert_eq!(response.vote.value, VoteValue::Up);
    assert_eq!(coordinator.pending_mutations(), 0);
    assert_eq!(scores(&coordinator, EntityRef::Post(POST)), vec![6, 6, 6]);
}

#[tokio::test]
async fn success_patches_server_numbers_and_keeps_other_entities() {
    let (api, coordinator) = fixture();
    // Other people voted since the views were cached.
    api.posts.lock().unwrap().get_mut(&POST).unwrap().score = 9;

    coordinator.vote_post(POST, VoteValue::Up).await.unwrap();

    assert_eq!(scores(&coordinator, EntityRef::Post(POST)), vec![10, 10, 10]);
    for (_, copy) in coordinator.copies_of(EntityRef::Post(POST)) {
        assert_eq!(copy.my_vote, Some(VoteValue::Up));
    }
    let feed = coordinator.view(ViewKey::NearbyFeed).unwrap();
    assert_eq!(feed.posts().len(), 2);
    assert_eq!(scores(&coordinator, EntityRef::Post(PostId(2))), vec![0]);
}

#[tokio::test]
async fn repeated_and_switched_votes_follow_the_transition_table() {
    let (_api, coordinator) = fixture();

    coordinator.vote_post(POST, VoteValue::Down).await.unwrap();
    assert_eq!(scores(&coordinator, EntityRef::Post(POST)), vec![4, 4, 4]);

    coordinator.vote_post(POST, VoteValue::Up).await.unwrap();
    assert_eq!(scores(&coordinator, EntityRef::Post(POST)), vec![6, 6, 6]);

    coordinator.vote_post(POST, VoteValue::Up).await.unwrap();
    assert_eq!(scores(&coordinator, EntityRef::Post(POST)), vec![5, 5, 5]);
    for (_, copy) in coordinator.copies_of(EntityRef::Post(POST)) {
        assert_eq!(copy.my_vote, Some(VoteValue::Neutral));
    }
}

#[tokio::test]
async fn failure_restores_every_view_and_sends_a_notice() {
    let (api, mut coordinator) = fixture();
    let mut notices = coordinator.notices();
    coordinator.evict(ViewKey::PostDetail(POST));
    let before = all_views(&coordinator);
    api.fail.store(true, Ordering::SeqCst);

    let err = coordinator.vote_post(POST, VoteValue::Up).await.unwrap_err();

    assert!(matches!(err, ApiError::Status { status: 503, .. }));
    assert_eq!(all_views(&coordinator), before);
    assert!(coordinator.view(ViewKey::PostDetail(POST)).is_none());
    assert_eq!(coordinator.pending_mutations(), 0);

    let notice = notices.try_recv().unwrap();
    assert_eq!(notice.kind, MutationKind::VotePost);
    assert!(notices.try_recv().is_err());
}

#[tokio::test]
async fn failed_vote_keeps_other_posts_settled_meanwhile() {
    let (api, coordinator) = fixture();
    let coordinator = Arc::new(coordinator);
    let other = PostId(2);
    coordinator.load_post(other).await.unwrap();
    api.hold.store(true, Ordering::SeqCst);

    let failing = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.vote_post(POST, VoteValue::Up).await }
    });
    wait_for_pending(&coordinator, 1).await;

    api.hold.store(false, Ordering::SeqCst);
    coordinator.vote_post(other, VoteValue::Up).await.unwrap();
    assert_eq!(scores(&coordinator, EntityRef::Post(other)), vec![1, 1]);

    api.fail.store(true, Ordering::SeqCst);
    api.release.notify_one();
    assert!(failing.await.unwrap().is_err());

    assert_eq!(scores(&coordinator, EntityRef::Post(POST)), vec![5, 5, 5]);
    assert_eq!(scores(&coordinator, EntityRef::Post(other)), vec![1, 1]);
    assert_consistent(&coordinator, EntityRef::Post(other));
    for (_, copy) in coordinator.copies_of(EntityRef::Post(other)) {
        assert_eq!(copy.my_vote, Some(VoteValue::Up));
    }
}

#[tokio::test]
async fn rollback_keeps_views_loaded_while_pending() {
    let (api, coordinator) = fixture();
    let coordinator = Arc::new(coordinator);
    coordinator.evict(ViewKey::PostDetail(POST));
    api.hold.store(true, Ordering::SeqCst);
    api.fail.store(true, Ordering::SeqCst);

    let failing = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.vote_post(POST, VoteValue::Up).await }
    });
    wait_for_pending(&coordinator, 1).await;
    assert_eq!(scores(&coordinator, EntityRef::Post(POST)), vec![6, 6]);

    coordinator.load_post(POST).await.unwrap();
    let more = FeedQuery {
        lat: 48.85,
        lon: 2.35,
        distance: None,
        cursor: Some(2),
        limit: None,
        sort: None,
    };
    coordinator.load_feed(more).await.unwrap();

    api.release.notify_one();
    assert!(failing.await.unwrap().is_err());

    assert!(coordinator.view(ViewKey::PostDetail(POST)).is_some());
    let Some(View::Posts(pages)) = coordinator.view(ViewKey::NearbyFeed) else {
        panic!("feed not cached");
    };
    assert_eq!(pages.len(), 2);
    assert_eq!(scores(&coordinator, EntityRef::Post(POST)), vec![5, 5, 5, 5]);
    assert_consistent(&coordinator, EntityRef::Post(POST));
}

#[tokio::test]
async fn comment_vote_updates_nested_previews() {
    let (_api, coordinator) = fixture();
    let reply = coordinator.view(ViewKey::CommentDetail(REPLY)).unwrap().comments()[0].clone();

    coordinator.vote_comment(&reply, VoteValue::Up).await.unwrap();

    assert_eq!(scores(&coordinator, EntityRef::Comment(REPLY)), vec![1, 1, 1]);
    assert_consistent(&coordinator, EntityRef::Comment(REPLY));
    assert_eq!(scores(&coordinator, EntityRef::Comment(CommentId(12))), vec![0, 0]);
}

// ===== Reads =====

#[tokio::test]
async fn mutation_cancels_an_in_flight_read() {
    let (_api, coordinator) = fixture();
    let coordinator = Arc::new(coordinator);
    let stale = sample_post(1, 5, 3);
    let (started_tx, started_rx) = oneshot::channel();
    let gate = Arc::new(Notify::new());

    let read = tokio::spawn({
        let coordinator = coordinator.clone();
        let gate = gate.clone();
        async move {
            coordinator
                .refetch(ViewKey::PostDetail(POST), Merge::Replace, async move {
                    let _ = started_tx.send(());
                    gate.notified().await;
                    Ok(View::Post(stale))
                })
                .await
        }
    });
    started_rx.await.unwrap();

    coordinator.vote_post(POST, VoteValue::Up).await.unwrap();
    gate.notify_one();

    assert_eq!(read.await.unwrap().unwrap(), ReadOutcome::Cancelled);
    assert_eq!(scores(&coordinator, EntityRef::Post(POST)), vec![6, 6, 6]);
}

#[tokio::test]
async fn cancelling_a_read_leaves_the_mutation_alone() {
    let (api, coordinator) = fixture();
    let coordinator = Arc::new(coordinator);
    api.hold.store(true, Ordering::SeqCst);

    let vote = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.vote_post(POST, VoteValue::Up).await }
    });
    wait_for_pending(&coordinator, 1).await;

    let (started_tx, started_rx) = oneshot::channel();
    let read = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            coordinator
                .refetch(ViewKey::NearbyFeed, Merge::Replace, async move {
                    let _ = started_tx.send(());
                    std::future::pending::<()>().await;
                    Ok(View::Posts(Vec::new()))
                })
                .await
        }
    });
    started_rx.await.unwrap();

    assert_eq!(coordinator.cancel_reads(ViewKey::NearbyFeed), 1);
    assert_eq!(read.await.unwrap().unwrap(), ReadOutcome::Cancelled);
    assert_eq!(coordinator.pending_mutations(), 1);

    api.release.notify_one();
    vote.await.unwrap().unwrap();
    assert_eq!(scores(&coordinator, EntityRef::Post(POST)), vec![6, 6, 6]);
}

#[tokio::test]
async fn paged_loads_append_and_fresh_loads_replace() {
    let (_api, coordinator) = fixture();
    let query = FeedQuery {
        lat: 48.85,
        lon: 2.35,
        distance: None,
        cursor: None,
        limit: None,
        sort: None,
    };

    assert_eq!(coordinator.load_feed(query.clone()).await.unwrap(), ReadOutcome::Stored);
    let more = FeedQuery {
        cursor: Some(2),
        ..query.clone()
    };
    coordinator.load_feed(more).await.unwrap();
    let Some(View::Posts(pages)) = coordinator.view(ViewKey::NearbyFeed) else {
        panic!("feed not cached");
    };
    assert_eq!(pages.len(), 2);

    coordinator.load_feed(query).await.unwrap();
    let Some(View::Posts(pages)) = coordinator.view(ViewKey::NearbyFeed) else {
        panic!("feed not cached");
    };
    assert_eq!(pages.len(), 1);
}

// ===== Comments =====

#[tokio::test]
async fn create_reply_bumps_counters_everywhere() {
    let (_api, coordinator) = fixture();

    let created = coordinator
        .create_comment(
            POST,
            NewComment {
                content: "same here".into(),
                parent_comment_id: Some(TOP),
            },
        )
        .await
        .unwrap();

    assert_eq!(created.post.comments_count, 4);
    assert_eq!(children(&coordinator, EntityRef::Post(POST)), vec![4, 4, 4]);
    assert_eq!(children(&coordinator, EntityRef::Comment(TOP)), vec![3]);
}

#[tokio::test]
async fn deleting_a_thread_is_speculative_and_rolls_back() {
    let (api, mut coordinator) = fixture();
    let mut notices = coordinator.notices();
    let coordinator = Arc::new(coordinator);
    let before = all_views(&coordinator);
    let top = coordinator.view(ViewKey::Comments(POST)).unwrap().comments()[0].clone();
    api.hold.store(true, Ordering::SeqCst);
    api.fail.store(true, Ordering::SeqCst);

    let delete = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.delete_comment(&top).await }
    });
    wait_for_pending(&coordinator, 1).await;

    let comments = coordinator.view(ViewKey::Comments(POST)).unwrap();
    assert!(comments.comments().is_empty());
    assert_eq!(children(&coordinator, EntityRef::Post(POST)), vec![0, 0, 0]);

    api.release.notify_one();
    assert!(delete.await.unwrap().is_err());
    assert_eq!(all_views(&coordinator), before);
    assert_eq!(notices.recv().await.unwrap().kind, MutationKind::DeleteComment);
}

#[tokio::test]
async fn deleting_a_reply_settles_on_server_counts() {
    let (_api, coordinator) = fixture();
    let reply = coordinator.view(ViewKey::CommentDetail(REPLY)).unwrap().comments()[0].clone();

    let deleted = coordinator.delete_comment(&reply).await.unwrap();

    assert_eq!(deleted.removed, 1);
    assert_eq!(children(&coordinator, EntityRef::Post(POST)), vec![2, 2, 2]);
    assert_eq!(children(&coordinator, EntityRef::Comment(TOP)), vec![1]);
    let comments = coordinator.view(ViewKey::Comments(POST)).unwrap();
    assert_eq!(comments.comments()[0].replies.len(), 1);
    let replies = coordinator.view(ViewKey::Replies(TOP)).unwrap();
    assert!(replies.comments().iter().all(|c| c.id != REPLY));
}
