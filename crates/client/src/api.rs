use async_trait::async_trait;
use hyperlocal_shared::{
    Comment, CommentCreated, CommentDeleted, CommentId, FeedQuery, ListQuery, NewComment, NewPost,
    Page, Post, PostId, VoteRequest, VoteResponse, VoteValue,
};
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("API error ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request task failed: {0}")]
    Task(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Status { status: 404, .. })
    }
}

/// The backend operations the client cache drives.
#[async_trait]
pub trait Api: Send + Sync {
    async fn nearby_posts(&self, query: &FeedQuery) -> Result<Page<Post>, ApiError>;
    async fn my_posts(&self, query: &ListQuery) -> Result<Page<Post>, ApiError>;
    async fn post(&self, id: PostId) -> Result<Post, ApiError>;
    async fn create_post(&self, post: &NewPost) -> Result<Post, ApiError>;

    async fn comments(&self, post: PostId, query: &ListQuery) -> Result<Page<Comment>, ApiError>;
    async fn comment(&self, id: CommentId) -> Result<Comment, ApiError>;
    async fn replies(&self, id: CommentId, query: &ListQuery)
    -> Result<Page<Comment>, ApiError>;
    async fn create_comment(
        &self,
        post: PostId,
        comment: &NewComment,
    ) -> Result<CommentCreated, ApiError>;
    async fn delete_comment(&self, id: CommentId) -> Result<CommentDeleted, ApiError>;

    async fn vote_post(&self, id: PostId, value: VoteValue)
    -> Result<VoteResponse<Post>, ApiError>;
    async fn vote_comment(
        &self,
        id: CommentId,
        value: VoteValue,
    ) -> Result<VoteResponse<Comment>, ApiError>;

    async fn block_user(&self, user: &str) -> Result<(), ApiError>;
}

/// How requests identify the user.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// A Supabase access token, sent as `Authorization: Bearer`.
    Bearer(String),
    /// A plain user id for servers running without JWKS verification.
    DevUser(String),
}

pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        HttpApi {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.credentials {
            Credentials::Bearer(token) => builder.header("Authorization", format!("Bearer {}", token)),
            Credentials::DevUser(user) => builder.header("X-User-Id", user),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, path)
    }

    fn post_to(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::POST, path)
    }
}

async fn checked(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await?;
        return Err(ApiError::Status { status, body });
    }
    Ok(response)
}

async fn read<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T, ApiError> {
    let response = checked(request.send().await?).await?;
    Ok(response.json().await?)
}

#[async_trait]
impl Api for HttpApi {
    async fn nearby_posts(&self, query: &FeedQuery) -> Result<Page<Post>, ApiError> {
        read(self.get("/posts").query(query)).await
    }

    async fn my_posts(&self, query: &ListQuery) -> Result<Page<Post>, ApiError> {
        read(self.get("/users/me/posts").query(query)).await
    }

    async fn post(&self, id: PostId) -> Result<Post, ApiError> {
        read(self.get(&format!("/posts/{}", id))).await
    }

    async fn create_post(&self, post: &NewPost) -> Result<Post, ApiError> {
        read(self.post_to("/posts").json(post)).await
    }

    async fn comments(&self, post: PostId, query: &ListQuery) -> Result<Page<Comment>, ApiError> {
        read(self.get(&format!("/posts/{}/comments", post)).query(query)).await
    }

    async fn comment(&self, id: CommentId) -> Result<Comment, ApiError> {
        read(self.get(&format!("/comments/{}", id))).await
    }

    async fn replies(
        &self,
        id: CommentId,
        query: &ListQuery,
    ) -> Result<Page<Comment>, ApiError> {
        read(self.get(&format!("/comments/{}/replies", id)).query(query)).await
    }

    async fn create_comment(
        &self,
        post: PostId,
        comment: &NewComment,
    ) -> Result<CommentCreated, ApiError> {
        read(self.post_to(&format!("/posts/{}/comments", post)).json(comment)).await
    }

    async fn delete_comment(&self, id: CommentId) -> Result<CommentDeleted, ApiError> {
        read(self.request(reqwest::Method::DELETE, &format!("/comments/{}", id))).await
    }

    async fn vote_post(
        &self,
        id: PostId,
        value: VoteValue,
    ) -> Result<VoteResponse<Post>, ApiError> {
        read(
            self.post_to(&format!("/posts/{}/vote", id))
                .json(&VoteRequest { value }),
        )
        .await
    }

    async fn vote_comment(
        &self,
        id: CommentId,
        value: VoteValue,
    ) -> Result<VoteResponse<Comment>, ApiError> {
        read(
            self.post_to(&format!("/comments/{}/vote", id))
                .json(&VoteRequest { value }),
        )
        .await
    }

    async fn block_user(&self, user: &str) -> Result<(), ApiError> {
        let request = self.request(reqwest::Method::PUT, &format!("/users/{}/block", user));
        checked(request.send().await?).await?;
        Ok(())
    }
}
