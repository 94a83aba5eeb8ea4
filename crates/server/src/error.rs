use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use hyperlocal_shared::InvalidVoteValue;
use thiserror::Error;

/// Failures raised by a [`Store`](crate::store::Store) backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The entity does not exist, was soft-deleted, or is not visible to the caller.
    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Validation(String),

    /// A vote or counter transaction failed and was rolled back; the caller may retry.
    #[error("aggregation failed: {0}")]
    AggregationFailed(#[source] sqlx::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        StoreError::Validation(message.into())
    }
}

impl From<InvalidVoteValue> for StoreError {
    fn from(err: InvalidVoteValue) -> Self {
        StoreError::Validation(err.to_string())
    }
}

// ===== HTTP errors =====

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unauthorized - Invalid or missing JWT token")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("Not found")]
    NotFound,

    #[error("Temporarily unavailable, please retry")]
    Unavailable(#[source] sqlx::Error),

    #[error("Database error")]
    Database(#[source] sqlx::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => AppError::NotFound,
            StoreError::Validation(msg) => AppError::BadRequest(msg),
            StoreError::AggregationFailed(err) => AppError::Unavailable(err),
            StoreError::Database(err) => AppError::Database(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unavailable(err) => {
                tracing::warn!("Aggregation failed: {:?}", err);
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Database(err) => {
                tracing::error!("Database error: {:?}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, self.to_string()).into_response()
    }
}
