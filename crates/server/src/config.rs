use std::{env, fmt::Display, str::FromStr};

use anyhow::{Context, bail};
use tracing::{info, warn};

use crate::pagination::Limits;

pub struct Config {
    pub port: u16,
    /// `None` runs the server on the in-memory store.
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// `None` trusts the `X-User-Id` header instead of verifying JWTs.
    pub jwks_url: Option<String>,
    pub limits: Limits,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let limits = Limits {
            min: try_load("PAGE_LIMIT_MIN", "15")?,
            max: try_load("PAGE_LIMIT_MAX", "25")?,
        };
        if limits.min < 1 || limits.min > limits.max {
            bail!("PAGE_LIMIT_MIN must be between 1 and PAGE_LIMIT_MAX");
        }

        let database_url = optional("DATABASE_URL");
        if database_url.is_none() {
            warn!("DATABASE_URL not set, data lives in memory and is lost on exit");
        }

        let jwks_url = optional("JWKS_URL");
        if jwks_url.is_none() {
            warn!("JWKS_URL not set, trusting the X-User-Id header (development only)");
        }

        Ok(Self {
            port: try_load("PORT", "3000")?,
            database_url,
            max_connections: try_load("DATABASE_MAX_CONNECTIONS", "5")?,
            jwks_url,
            limits,
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn try_load<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: Display,
{
    let raw = optional(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    raw.parse()
        .map_err(|e: T::Err| anyhow::anyhow!("{e}"))
        .with_context(|| format!("invalid {key} value {raw:?}"))
}
