use std::{env, fmt::Display, str::FromStr};

use anyhow::{Context, bail};
use tracing::debug;

/// How the client obtains its identity.
#[derive(Debug, Clone)]
pub enum Login {
    /// An access token handed in through `FEED_TOKEN`.
    Token(String),
    /// `FEED_USER`, sent as `X-User-Id` to a server without JWKS verification.
    DevUser(String),
    /// Discord login through Supabase in the browser.
    Browser { supabase_url: String },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub backend_url: String,
    pub login: Login,
    pub lat: f64,
    pub lon: f64,
    /// Feed radius in meters; the server picks its default when unset.
    pub distance: Option<u32>,
}

impl ClientConfig {
    pub fn load() -> anyhow::Result<Self> {
        let login = if let Some(token) = optional("FEED_TOKEN") {
            Login::Token(token)
        } else if let Some(user) = optional("FEED_USER") {
            Login::DevUser(user)
        } else if let Some(supabase_url) = optional("SUPABASE_URL") {
            Login::Browser { supabase_url }
        } else {
            bail!("set FEED_TOKEN, FEED_USER or SUPABASE_URL to log in");
        };

        let lat: f64 = load_or("FEED_LAT", "48.8566")?;
        let lon: f64 = load_or("FEED_LON", "2.3522")?;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            bail!("FEED_LAT/FEED_LON out of range: {lat}, {lon}");
        }

        let distance = match optional("FEED_DISTANCE") {
            Some(raw) => Some(
                raw.parse()
                    .with_context(|| format!("invalid FEED_DISTANCE value {raw:?}"))?,
            ),
            None => None,
        };

        Ok(ClientConfig {
            backend_url: optional("BACKEND_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            login,
            lat,
            lon,
            distance,
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn load_or<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: Display,
{
    let raw = optional(key).unwrap_or_else(|| {
        debug!("{key} not set, using {default}");
        default.to_string()
    });
    raw.parse()
        .map_err(|e: T::Err| anyhow::anyhow!("invalid {key} value {raw:?}: {e}"))
}
