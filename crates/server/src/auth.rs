use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use supabase_jwt::{Claims, JwksCache};

use crate::error::AppError;

/// How requests are tied to a user id.
#[derive(Clone)]
pub enum Authenticator {
    /// Verify a Supabase-issued bearer token against the project's JWKS.
    Jwks(Arc<JwksCache>),
    /// Trust the `X-User-Id` header. Only for local development and tests.
    TrustedHeader,
}

impl Authenticator {
    pub fn jwks(url: &str) -> Self {
        Authenticator::Jwks(Arc::new(JwksCache::new(url)))
    }

    /// Return the caller's user id.
    pub async fn verify(&self, headers: &HeaderMap) -> Result<String, AppError> {
        match self {
            Authenticator::Jwks(jwks_cache) => verify_jwt(jwks_cache, headers).await,
            Authenticator::TrustedHeader => headers
                .get("X-User-Id")
                .and_then(|h| h.to_str().ok())
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_owned)
                .ok_or(AppError::Unauthorized),
        }
    }
}

async fn verify_jwt(jwks_cache: &Arc<JwksCache>, headers: &HeaderMap) -> Result<String, AppError> {
    let auth_header = headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or(AppError::BadRequest("no auth".into()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(AppError::BadRequest("no bearer".into()))?;

    let is_expired = |exp: i64| Utc::now().timestamp() > exp;

    match Claims::from_token(token, jwks_cache).await {
        Err(_) => {
            tracing::debug!("Rejected bearer token");
            Err(AppError::Unauthorized)
        }
        Ok(claims) if is_expired(claims.exp as i64) => Err(AppError::Unauthorized),
        Ok(claims) => Ok(claims.sub),
    }
}
