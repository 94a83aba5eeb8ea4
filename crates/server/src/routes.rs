use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
};
use hyperlocal_shared::{
    Comment, CommentCreated, CommentDeleted, CommentId, FeedQuery, ListQuery, NewComment, NewPost,
    Page, Post, PostId, VoteRequest, VoteResponse,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::Authenticator;
use crate::error::AppError;
use crate::geo::{BoundingBox, Distance};
use crate::pagination::Limits;
use crate::store::{CommentScope, PostScope, Store};

// ===== App State =====

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub auth: Authenticator,
    pub limits: Limits,
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/posts", get(nearby_posts).post(create_post))
        .route("/posts/:id", get(get_post).delete(delete_post))
        .route("/posts/:id/vote", post(vote_post))
        .route(
            "/posts/:id/comments",
            get(list_comments).post(create_comment),
        )
        .route("/comments/:id", get(get_comment).delete(delete_comment))
        .route("/comments/:id/replies", get(list_replies))
        .route("/comments/:id/vote", post(vote_comment))
        .route("/users/me/posts", get(my_posts))
        .route("/users/:id/block", put(block_user))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Handlers =====

async fn root() -> &'static str {
    "Hyperlocal feed backend - Use /health to check status"
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(_) => Json(serde_json::json!({
            "status": "ok",
            "database": "connected"
        })),
        Err(_) => Json(serde_json::json!({
            "status": "error",
            "database": "disconnected"
        })),
    }
}

async fn nearby_posts(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<FeedQuery>, QueryRejection>,
) -> Result<Json<Page<Post>>, AppError> {
    let user_id = state.auth.verify(&headers).await?;
    let Query(query) = query?;

    let distance = query
        .distance
        .map(Distance::try_from)
        .transpose()?
        .unwrap_or_default();
    let bbox = BoundingBox::for_distance(query.lat, query.lon, distance)?;
    let window = state.limits.window(&query.list())?;

    let page = state
        .store
        .list_posts(&user_id, &PostScope::Near(bbox), &window)
        .await?;
    Ok(Json(page))
}

async fn my_posts(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Page<Post>>, AppError> {
    let user_id = state.auth.verify(&headers).await?;
    let Query(query) = query?;
    let window = state.limits.window(&query)?;

    let scope = PostScope::AuthoredBy(user_id.clone());
    Ok(Json(state.store.list_posts(&user_id, &scope, &window).await?))
}

async fn create_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<NewPost>, JsonRejection>,
) -> Result<(StatusCode, Json<Post>), AppError> {
    let user_id = state.auth.verify(&headers).await?;
    let Json(new_post) = payload?;

    let post = state.store.create_post(&user_id, &new_post).await?;
    tracing::info!(post_id = %post.id, "post created");
    Ok((StatusCode::CREATED, Json(post)))
}

async fn get_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Post>, AppError> {
    let user_id = state.auth.verify(&headers).await?;
    Ok(Json(state.store.post(&user_id, PostId(id)).await?))
}

async fn delete_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let user_id = state.auth.verify(&headers).await?;
    state.store.delete_post(&user_id, PostId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn vote_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Result<Json<VoteResponse<Post>>, AppError> {
    let user_id = state.auth.verify(&headers).await?;
    let Json(vote_req) = payload?;

    let response = state
        .store
        .vote_post(&user_id, PostId(id), vote_req.value)
        .await?;
    Ok(Json(response))
}

async fn list_comments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Page<Comment>>, AppError> {
    let user_id = state.auth.verify(&headers).await?;
    let Query(query) = query?;
    let window = state.limits.window(&query)?;

    let page = state
        .store
        .list_comments(&user_id, CommentScope::TopLevel(PostId(id)), &window)
        .await?;
    Ok(Json(page))
}

async fn create_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    payload: Result<Json<NewComment>, JsonRejection>,
) -> Result<(StatusCode, Json<CommentCreated>), AppError> {
    let user_id = state.auth.verify(&headers).await?;
    let Json(new_comment) = payload?;

    let created = state
        .store
        .create_comment(&user_id, PostId(id), &new_comment)
        .await?;
    tracing::info!(comment_id = %created.comment.id, post_id = id, "comment created");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Comment>, AppError> {
    let user_id = state.auth.verify(&headers).await?;
    Ok(Json(state.store.comment(&user_id, CommentId(id)).await?))
}

async fn delete_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<CommentDeleted>, AppError> {
    let user_id = state.auth.verify(&headers).await?;

    let deleted = state.store.delete_comment(&user_id, CommentId(id)).await?;
    tracing::info!(comment_id = id, removed = deleted.removed, "comment deleted");
    Ok(Json(deleted))
}

async fn list_replies(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Page<Comment>>, AppError> {
    let user_id = state.auth.verify(&headers).await?;
    let Query(query) = query?;
    let window = state.limits.window(&query)?;

    let page = state
        .store
        .list_comments(&user_id, CommentScope::Replies(CommentId(id)), &window)
        .await?;
    Ok(Json(page))
}

async fn vote_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Result<Json<VoteResponse<Comment>>, AppError> {
    let user_id = state.auth.verify(&headers).await?;
    let Json(vote_req) = payload?;

    let response = state
        .store
        .vote_comment(&user_id, CommentId(id), vote_req.value)
        .await?;
    Ok(Json(response))
}

async fn block_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(blocked): Path<String>,
) -> Result<StatusCode, AppError> {
    let user_id = state.auth.verify(&headers).await?;
    if blocked == user_id {
        return Err(AppError::BadRequest("Cannot block yourself".into()));
    }

    state.store.block_user(&user_id, &blocked).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::store::MemoryStore;

    fn app() -> Router {
        router(AppState {
            store: Arc::new(MemoryStore::new()),
            auth: Authenticator::TrustedHeader,
            limits: Limits::default(),
        })
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            request = request.header("X-User-Id", user);
        }
        let request = match body {
            Some(body) => request
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn publish(app: &Router, user: &str) -> i64 {
        let (status, body) = send(
            app,
            Method::POST,
            "/posts",
            Some(user),
            Some(json!({"content": "coffee here is great", "lat": 40.0, "lon": -3.7})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn voting_twice_toggles_off() {
        let app = app();
        let id = publish(&app, "alice").await;
        let uri = format!("/posts/{id}/vote");

        let (status, body) = send(&app, Method::POST, &uri, Some("bob"), Some(json!({"value": 1}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["entity"]["score"], 1);
        assert_eq!(body["entity"]["myVote"], 1);
        assert_eq!(body["vote"]["value"], 1);

        let (_, body) = send(&app, Method::POST, &uri, Some("bob"), Some(json!({"value": 1}))).await;
        assert_eq!(body["entity"]["score"], 0);
        assert_eq!(body["vote"]["value"], 0);
    }

    #[tokio::test]
    async fn malformed_votes_are_rejected() {
        let app = app();
        let id = publish(&app, "alice").await;
        let uri = format!("/posts/{id}/vote");

        let (status, _) = send(&app, Method::POST, &uri, Some("bob"), Some(json!({"value": 2}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::POST, &uri, None, Some(json!({"value": 1}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &app,
            Method::POST,
            "/posts/999/vote",
            Some("bob"),
            Some(json!({"value": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = send(&app, Method::GET, &format!("/posts/{id}"), Some("bob"), None).await;
        assert_eq!(body["score"], 0);
    }

    #[tokio::test]
    async fn feed_validates_distance_and_clamps_limit() {
        let app = app();
        for _ in 0..16 {
            publish(&app, "alice").await;
        }

        let (status, _) = send(&app, Method::GET, "/posts?lat=40&lon=-3.7&distance=300", Some("bob"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::GET, "/posts?lat=40&lon=-3.7&limit=0", Some("bob"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            Method::GET,
            "/posts?lat=40&lon=-3.7&distance=200&limit=3&sort=top",
            Some("bob"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"].as_array().unwrap().len(), 15);
        assert_eq!(body["hasMore"], true);

        let last = body["items"][14]["id"].as_i64().unwrap();
        let (_, body) = send(
            &app,
            Method::GET,
            &format!("/posts?lat=40&lon=-3.7&distance=200&sort=top&cursor={last}"),
            Some("bob"),
            None,
        )
        .await;
        assert_eq!(body["items"].as_array().unwrap().len(), 1);
        assert_eq!(body["hasMore"], false);
    }

    #[tokio::test]
    async fn comment_lifecycle_maintains_counts() {
        let app = app();
        let post = publish(&app, "alice").await;
        let comments = format!("/posts/{post}/comments");

        let (status, body) = send(&app, Method::POST, &comments, Some("bob"), Some(json!({"content": "first"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["post"]["commentsCount"], 1);
        let top = body["comment"]["id"].as_i64().unwrap();

        for _ in 0..3 {
            let (_, body) = send(
                &app,
                Method::POST,
                &comments,
                Some("carol"),
                Some(json!({"content": "reply", "parentCommentId": top})),
            )
            .await;
            assert_eq!(body["comment"]["parentCommentId"], top);
        }

        let (_, body) = send(&app, Method::GET, &comments, Some("alice"), None).await;
        assert_eq!(body["items"][0]["repliesCount"], 3);
        assert_eq!(body["items"][0]["replies"].as_array().unwrap().len(), 3);

        let (status, body) = send(&app, Method::DELETE, &format!("/comments/{top}"), Some("bob"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], 4);
        assert_eq!(body["post"]["commentsCount"], 0);

        let (status, _) = send(&app, Method::GET, &format!("/comments/{top}/replies"), Some("bob"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn my_posts_and_blocking() {
        let app = app();
        let mine = publish(&app, "alice").await;
        publish(&app, "bob").await;

        let (_, body) = send(&app, Method::GET, "/users/me/posts", Some("alice"), None).await;
        let ids: Vec<_> = body["items"].as_array().unwrap().iter().map(|p| p["id"].as_i64()).collect();
        assert_eq!(ids, vec![Some(mine)]);

        let (status, _) = send(&app, Method::PUT, "/users/alice/block", Some("alice"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::PUT, "/users/bob/block", Some("alice"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = send(&app, Method::GET, "/posts?lat=40&lon=-3.7", Some("alice"), None).await;
        assert_eq!(body["items"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn health_reports_storage() {
        let (status, body) = send(&app(), Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"], "connected");
    }
}
