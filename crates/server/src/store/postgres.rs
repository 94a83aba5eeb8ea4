//! Postgres backend.
//!
//! Counter writes are relative (`SET score = score + $1`) and run in the same transaction as the
//! ledger or comment write they belong to; the row lock taken by the `UPDATE` serializes
//! concurrent writers to one entity.

use async_trait::async_trait;
use hyperlocal_shared::{
    Comment, CommentCounters, CommentCreated, CommentDeleted, CommentId, NewComment, NewPost,
    Page, Post, PostCounters, PostId, VoteRecord, VoteResponse, VoteValue, transition,
};
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder, postgres::PgPoolOptions};
use tracing::{debug, instrument};

use super::{CommentScope, PostScope, REPLY_PREVIEW, Store, validate_content};
use crate::error::StoreError;
use crate::geo::check_coordinates;
use crate::models::{CommentRow, KeyRow, PostRow, VoteRow};
use crate::pagination::{KeyPart, SortKey, Window, keyset_binds, keyset_columns, order_by, seal};

const POST_COLUMNS: &str = "SELECT p.id, p.author_id, p.content, p.lat, p.lon, p.score, \
     p.comments_count, p.created_at, v.value AS my_vote \
     FROM posts p LEFT JOIN post_votes v ON v.post_id = p.id AND v.user_id = ";

const COMMENT_COLUMNS: &str = "SELECT c.id, c.post_id, c.parent_comment_id, c.author_id, \
     c.content, c.score, c.replies_count, c.created_at, v.value AS my_vote \
     FROM comments c JOIN posts p ON p.id = c.post_id AND NOT p.deleted \
     LEFT JOIN comment_votes v ON v.comment_id = c.id AND v.user_id = ";

/// The two kinds of votable entity and the tables backing them.
#[derive(Debug, Clone, Copy)]
enum Votable {
    Post,
    Comment,
}

impl Votable {
    fn table(self) -> &'static str {
        match self {
            Votable::Post => "posts",
            Votable::Comment => "comments",
        }
    }

    fn ledger(self) -> &'static str {
        match self {
            Votable::Post => "post_votes",
            Votable::Comment => "comment_votes",
        }
    }

    fn foreign_key(self) -> &'static str {
        match self {
            Votable::Post => "post_id",
            Votable::Comment => "comment_id",
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CommentRef {
    post_id: i64,
    parent_comment_id: Option<i64>,
    author_id: String,
}

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let db = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .map_err(|err| StoreError::Database(err.into()))?;

        Ok(Self { db })
    }

    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn post_is_active(&self, id: i64) -> Result<bool, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM posts WHERE id = $1 AND NOT deleted)")
                .bind(id)
                .fetch_one(&self.db)
                .await?,
        )
    }

    async fn comment_ref(&self, id: i64) -> Result<Option<CommentRef>, StoreError> {
        Ok(sqlx::query_as(
            "SELECT c.post_id, c.parent_comment_id, c.author_id FROM comments c \
             JOIN posts p ON p.id = c.post_id AND NOT p.deleted \
             WHERE c.id = $1 AND NOT c.deleted",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?)
    }

    /// Upsert the ledger row and move the entity's score, all in one transaction.
    #[instrument(skip(self))]
    async fn apply_vote(
        &self,
        kind: Votable,
        user: &str,
        id: i64,
        value: VoteValue,
    ) -> Result<(VoteRecord, sqlx::Transaction<'static, Postgres>), StoreError> {
        let (table, ledger, fk) = (kind.table(), kind.ledger(), kind.foreign_key());
        let mut tx = self.db.begin().await.map_err(StoreError::AggregationFailed)?;

        // A fresh row is created neutral so that the lookup below always finds one to lock.
        let created: Option<i64> = sqlx::query_scalar(&format!(
            "INSERT INTO {ledger} ({fk}, user_id, value) VALUES ($1, $2, 0) \
             ON CONFLICT (user_id, {fk}) DO NOTHING RETURNING id"
        ))
        .bind(id)
        .bind(user)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::AggregationFailed)?;

        let previous = match created {
            Some(_) => None,
            None => {
                let value: i16 = sqlx::query_scalar(&format!(
                    "SELECT value FROM {ledger} WHERE user_id = $1 AND {fk} = $2 FOR UPDATE"
                ))
                .bind(user)
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(StoreError::AggregationFailed)?;
                Some(VoteValue::try_from(value)?)
            }
        };

        let step = transition(previous, value);
        debug!(?previous, stored = ?step.stored, delta = step.delta, "vote transition");

        let vote: VoteRow = sqlx::query_as(&format!(
            "UPDATE {ledger} SET value = $3, updated_at = NOW() \
             WHERE user_id = $1 AND {fk} = $2 \
             RETURNING id, {fk} AS entity_id, user_id, value, created_at, updated_at"
        ))
        .bind(user)
        .bind(id)
        .bind(step.stored.as_i16())
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::AggregationFailed)?;

        let updated = sqlx::query(&format!(
            "UPDATE {table} SET score = score + $1 WHERE id = $2 AND NOT deleted"
        ))
        .bind(step.delta)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::AggregationFailed)?;

        if updated.rows_affected() == 0 {
            // Deleted since the existence check; dropping `tx` rolls the ledger write back.
            return Err(StoreError::NotFound);
        }

        Ok((VoteRecord::try_from(vote)?, tx))
    }
}

async fn fetch_post<'e>(
    exec: impl PgExecutor<'e>,
    viewer: &str,
    id: i64,
) -> Result<Option<Post>, StoreError> {
    let mut qb = QueryBuilder::<Postgres>::new(POST_COLUMNS);
    qb.push_bind(viewer.to_owned())
        .push(" WHERE NOT p.deleted AND p.id = ")
        .push_bind(id);

    let row = qb.build_query_as::<PostRow>().fetch_optional(exec).await?;
    Ok(row.map(Post::try_from).transpose()?)
}

async fn fetch_comment<'e>(
    exec: impl PgExecutor<'e>,
    viewer: &str,
    id: i64,
) -> Result<Option<Comment>, StoreError> {
    let mut qb = QueryBuilder::<Postgres>::new(COMMENT_COLUMNS);
    qb.push_bind(viewer.to_owned())
        .push(" WHERE NOT c.deleted AND c.id = ")
        .push_bind(id);

    let row = qb.build_query_as::<CommentRow>().fetch_optional(exec).await?;
    Ok(row.map(Comment::try_from).transpose()?)
}

fn push_not_blocked(qb: &mut QueryBuilder<'_, Postgres>, viewer: &str, alias: &str) {
    qb.push(format!(
        " AND NOT EXISTS (SELECT 1 FROM blocks b WHERE b.blocked_id = {alias}.author_id \
         AND b.blocker_id = "
    ))
    .push_bind(viewer.to_owned())
    .push(")");
}

fn push_post_scope(qb: &mut QueryBuilder<'_, Postgres>, viewer: &str, scope: &PostScope) {
    match scope {
        PostScope::Near(bbox) => {
            qb.push(" AND p.lat BETWEEN ")
                .push_bind(bbox.lat_min)
                .push(" AND ")
                .push_bind(bbox.lat_max);
            if bbox.wraps() {
                qb.push(" AND (p.lon >= ")
                    .push_bind(bbox.lon_min)
                    .push(" OR p.lon <= ")
                    .push_bind(bbox.lon_max)
                    .push(")");
            } else {
                qb.push(" AND p.lon BETWEEN ")
                    .push_bind(bbox.lon_min)
                    .push(" AND ")
                    .push_bind(bbox.lon_max);
            }
            push_not_blocked(qb, viewer, "p");
        }
        PostScope::AuthoredBy(author) => {
            qb.push(" AND p.author_id = ").push_bind(author.clone());
        }
    }
}

fn push_comment_scope(qb: &mut QueryBuilder<'_, Postgres>, viewer: &str, scope: CommentScope) {
    match scope {
        CommentScope::TopLevel(post) => {
            qb.push(" AND c.post_id = ")
                .push_bind(post.0)
                .push(" AND c.parent_comment_id IS NULL");
        }
        CommentScope::Replies(parent) => {
            qb.push(" AND c.parent_comment_id = ").push_bind(parent.0);
        }
    }
    push_not_blocked(qb, viewer, "c");
}

fn push_keyset(qb: &mut QueryBuilder<'_, Postgres>, window: &Window, alias: &str, key: &SortKey) {
    let (columns, op) = keyset_columns(window.sort, alias);
    qb.push(format!(" AND {columns} {op} ("));
    let mut values = qb.separated(", ");
    for part in keyset_binds(window.sort) {
        match part {
            KeyPart::Score => values.push_bind(key.score),
            KeyPart::CreatedAt => values.push_bind(key.created_at),
            KeyPart::Id => values.push_bind(key.id),
        };
    }
    values.push_unseparated(")");
}

fn push_page(qb: &mut QueryBuilder<'_, Postgres>, window: &Window, alias: &str) {
    qb.push(" ORDER BY ")
        .push(order_by(window.sort, alias))
        .push(" LIMIT ")
        .push_bind(window.fetch_size());
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }

    #[instrument(skip(self, post))]
    async fn create_post(&self, author: &str, post: &NewPost) -> Result<Post, StoreError> {
        let content = validate_content(&post.content)?;
        check_coordinates(post.lat, post.lon)?;

        let row: PostRow = sqlx::query_as(
            "INSERT INTO posts (author_id, content, lat, lon) VALUES ($1, $2, $3, $4) \
             RETURNING id, author_id, content, lat, lon, score, comments_count, created_at, \
             NULL::SMALLINT AS my_vote",
        )
        .bind(author)
        .bind(content)
        .bind(post.lat)
        .bind(post.lon)
        .fetch_one(&self.db)
        .await?;

        Ok(Post::try_from(row)?)
    }

    async fn post(&self, viewer: &str, id: PostId) -> Result<Post, StoreError> {
        fetch_post(&self.db, viewer, id.0)
            .await?
            .ok_or(StoreError::NotFound)
    }

    #[instrument(skip(self))]
    async fn delete_post(&self, author: &str, id: PostId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE posts SET deleted = TRUE WHERE id = $1 AND author_id = $2 AND NOT deleted",
        )
        .bind(id.0)
        .bind(author)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_posts(
        &self,
        viewer: &str,
        scope: &PostScope,
        window: &Window,
    ) -> Result<Page<Post>, StoreError> {
        let cursor = match window.cursor {
            Some(id) => {
                let mut qb = QueryBuilder::<Postgres>::new(
                    "SELECT p.id, p.score, p.created_at FROM posts p WHERE NOT p.deleted AND p.id = ",
                );
                qb.push_bind(id);
                push_post_scope(&mut qb, viewer, scope);

                match qb.build_query_as::<KeyRow>().fetch_optional(&self.db).await? {
                    Some(row) => Some(SortKey::from(row)),
                    None => {
                        debug!(cursor = id, "stale cursor, ending pagination");
                        return Ok(Page::empty());
                    }
                }
            }
            None => None,
        };

        let mut qb = QueryBuilder::<Postgres>::new(POST_COLUMNS);
        qb.push_bind(viewer.to_owned()).push(" WHERE NOT p.deleted");
        push_post_scope(&mut qb, viewer, scope);
        if let Some(key) = &cursor {
            push_keyset(&mut qb, window, "p", key);
        }
        push_page(&mut qb, window, "p");

        let posts = qb
            .build_query_as::<PostRow>()
            .fetch_all(&self.db)
            .await?
            .into_iter()
            .map(Post::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(seal(posts, window.limit))
    }

    #[instrument(skip(self, comment))]
    async fn create_comment(
        &self,
        author: &str,
        post: PostId,
        comment: &NewComment,
    ) -> Result<CommentCreated, StoreError> {
        let content = validate_content(&comment.content)?;
        if !self.post_is_active(post.0).await? {
            return Err(StoreError::NotFound);
        }

        if let Some(parent) = comment.parent_comment_id {
            let parent = self
                .comment_ref(parent.0)
                .await?
                .ok_or_else(|| StoreError::validation("parent comment not found"))?;
            if parent.post_id != post.0 || parent.parent_comment_id.is_some() {
                return Err(StoreError::validation(
                    "replies must answer a top-level comment of the same post",
                ));
            }
        }

        let mut tx = self.db.begin().await.map_err(StoreError::AggregationFailed)?;

        let row: CommentRow = sqlx::query_as(
            "INSERT INTO comments (post_id, parent_comment_id, author_id, content) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, post_id, parent_comment_id, author_id, content, score, \
             replies_count, created_at, NULL::SMALLINT AS my_vote",
        )
        .bind(post.0)
        .bind(comment.parent_comment_id.map(|id| id.0))
        .bind(author)
        .bind(content)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::AggregationFailed)?;

        let (post_id, comments_count): (i64, i64) = sqlx::query_as(
            "UPDATE posts SET comments_count = comments_count + 1 \
             WHERE id = $1 AND NOT deleted RETURNING id, comments_count",
        )
        .bind(post.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::AggregationFailed)?
        .ok_or(StoreError::NotFound)?;

        let parent = match comment.parent_comment_id {
            Some(parent) => {
                let (id, replies_count): (i64, i64) = sqlx::query_as(
                    "UPDATE comments SET replies_count = replies_count + 1 \
                     WHERE id = $1 AND NOT deleted RETURNING id, replies_count",
                )
                .bind(parent.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::AggregationFailed)?
                .ok_or_else(|| StoreError::validation("parent comment not found"))?;
                Some(CommentCounters {
                    id: CommentId(id),
                    replies_count,
                })
            }
            None => None,
        };

        tx.commit().await.map_err(StoreError::AggregationFailed)?;

        Ok(CommentCreated {
            comment: Comment::try_from(row)?,
            post: PostCounters {
                id: PostId(post_id),
                comments_count,
            },
            parent,
        })
    }

    async fn comment(&self, viewer: &str, id: CommentId) -> Result<Comment, StoreError> {
        fetch_comment(&self.db, viewer, id.0)
            .await?
            .ok_or(StoreError::NotFound)
    }

    #[instrument(skip(self))]
    async fn delete_comment(
        &self,
        author: &str,
        id: CommentId,
    ) -> Result<CommentDeleted, StoreError> {
        let target = self.comment_ref(id.0).await?.ok_or(StoreError::NotFound)?;
        if target.author_id != author {
            return Err(StoreError::NotFound);
        }

        let mut tx = self.db.begin().await.map_err(StoreError::AggregationFailed)?;

        let deleted = sqlx::query("UPDATE comments SET deleted = TRUE WHERE id = $1 AND NOT deleted")
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::AggregationFailed)?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        let cascaded = match target.parent_comment_id {
            None => sqlx::query(
                "UPDATE comments SET deleted = TRUE WHERE parent_comment_id = $1 AND NOT deleted",
            )
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::AggregationFailed)?
            .rows_affected(),
            Some(_) => 0,
        };
        let removed = 1 + cascaded as i64;

        let (post_id, comments_count): (i64, i64) = sqlx::query_as(
            "UPDATE posts SET comments_count = comments_count - $1 WHERE id = $2 \
             RETURNING id, comments_count",
        )
        .bind(removed)
        .bind(target.post_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::AggregationFailed)?;

        let parent = match target.parent_comment_id {
            Some(parent) => {
                let (id, replies_count): (i64, i64) = sqlx::query_as(
                    "UPDATE comments SET replies_count = replies_count - 1 WHERE id = $1 \
                     RETURNING id, replies_count",
                )
                .bind(parent)
                .fetch_one(&mut *tx)
                .await
                .map_err(StoreError::AggregationFailed)?;
                Some(CommentCounters {
                    id: CommentId(id),
                    replies_count,
                })
            }
            None => None,
        };

        tx.commit().await.map_err(StoreError::AggregationFailed)?;

        Ok(CommentDeleted {
            post: PostCounters {
                id: PostId(post_id),
                comments_count,
            },
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
        let parent_exists = match scope {
            CommentScope::TopLevel(post) => self.post_is_active(post.0).await?,
            CommentScope::Replies(parent) => self
                .comment_ref(parent.0)
                .await?
                .is_some_and(|c| c.parent_comment_id.is_none()),
        };
        if !parent_exists {
            return Err(StoreError::NotFound);
        }

        let cursor = match window.cursor {
            Some(id) => {
                let mut qb = QueryBuilder::<Postgres>::new(
                    "SELECT c.id, c.score, c.created_at FROM comments c \
                     WHERE NOT c.deleted AND c.id = ",
                );
                qb.push_bind(id);
                push_comment_scope(&mut qb, viewer, scope);

                match qb.build_query_as::<KeyRow>().fetch_optional(&self.db).await? {
                    Some(row) => Some(SortKey::from(row)),
                    None => {
                        debug!(cursor = id, "stale cursor, ending pagination");
                        return Ok(Page::empty());
                    }
                }
            }
            None => None,
        };

        let mut qb = QueryBuilder::<Postgres>::new(COMMENT_COLUMNS);
        qb.push_bind(viewer.to_owned()).push(" WHERE NOT c.deleted");
        push_comment_scope(&mut qb, viewer, scope);
        if let Some(key) = &cursor {
            push_keyset(&mut qb, window, "c", key);
        }
        push_page(&mut qb, window, "c");

        let comments = qb
            .build_query_as::<CommentRow>()
            .fetch_all(&self.db)
            .await?
            .into_iter()
            .map(Comment::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let mut page = seal(comments, window.limit);

        if let CommentScope::TopLevel(_) = scope {
            self.attach_reply_previews(viewer, &mut page.items).await?;
        }

        Ok(page)
    }

    async fn vote_post(
        &self,
        user: &str,
        id: PostId,
        value: VoteValue,
    ) -> Result<VoteResponse<Post>, StoreError> {
        if !self.post_is_active(id.0).await? {
            return Err(StoreError::NotFound);
        }

        let (vote, mut tx) = self.apply_vote(Votable::Post, user, id.0, value).await?;
        let entity = fetch_post(&mut *tx, user, id.0)
            .await?
            .ok_or(StoreError::NotFound)?;
        tx.commit().await.map_err(StoreError::AggregationFailed)?;

        Ok(VoteResponse { vote, entity })
    }

    async fn vote_comment(
        &self,
        user: &str,
        id: CommentId,
        value: VoteValue,
    ) -> Result<VoteResponse<Comment>, StoreError> {
        if self.comment_ref(id.0).await?.is_none() {
            return Err(StoreError::NotFound);
        }

        let (vote, mut tx) = self.apply_vote(Votable::Comment, user, id.0, value).await?;
        let entity = fetch_comment(&mut *tx, user, id.0)
            .await?
            .ok_or(StoreError::NotFound)?;
        tx.commit().await.map_err(StoreError::AggregationFailed)?;

        Ok(VoteResponse { vote, entity })
    }

    async fn block_user(&self, blocker: &str, blocked: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO blocks (blocker_id, blocked_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(blocker)
        .bind(blocked)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

impl PgStore {
    /// Fill each top-level comment's `replies` with its best replies, in `top` order.
    async fn attach_reply_previews(
        &self,
        viewer: &str,
        comments: &mut [Comment],
    ) -> Result<(), StoreError> {
        if comments.is_empty() {
            return Ok(());
        }
        let parents: Vec<i64> = comments.iter().map(|c| c.id.0).collect();

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT * FROM (SELECT c.id, c.post_id, c.parent_comment_id, c.author_id, c.content, \
             c.score, c.replies_count, c.created_at, v.value AS my_vote, \
             ROW_NUMBER() OVER (PARTITION BY c.parent_comment_id \
             ORDER BY c.score DESC, c.created_at DESC, c.id DESC) AS preview_rank \
             FROM comments c LEFT JOIN comment_votes v ON v.comment_id = c.id AND v.user_id = ",
        );
        qb.push_bind(viewer.to_owned())
            .push(" WHERE NOT c.deleted AND c.parent_comment_id = ANY(")
            .push_bind(parents)
            .push(")");
        push_not_blocked(&mut qb, viewer, "c");
        qb.push(") previews WHERE preview_rank <= ")
            .push_bind(REPLY_PREVIEW as i64)
            .push(" ORDER BY parent_comment_id, preview_rank");

        let replies = qb.build_query_as::<CommentRow>().fetch_all(&self.db).await?;
        for row in replies {
            let reply = Comment::try_from(row)?;
            if let Some(parent) = comments
                .iter_mut()
                .find(|c| Some(c.id) == reply.parent_comment_id)
            {
                parent.replies.push(reply);
            }
        }
        Ok(())
    }
}
