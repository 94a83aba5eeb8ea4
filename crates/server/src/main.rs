use std::sync::Arc;

use hyperlocal::{
    auth::Authenticator,
    config::Config,
    routes::{AppState, router},
    store::{MemoryStore, PgStore, Store},
};
use tracing_subscriber::EnvFilter;

// ===== Main =====

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .init();

    let config = Config::load()?;

    // Setup storage
    let store: Arc<dyn Store> = match &config.database_url {
        Some(database_url) => {
            Arc::new(PgStore::connect(database_url, config.max_connections).await?)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let auth = match &config.jwks_url {
        Some(url) => Authenticator::jwks(url),
        None => Authenticator::TrustedHeader,
    };

    let state = AppState {
        store,
        auth,
        limits: config.limits,
    };

    let address = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!("Server running on http://{address}");

    axum::serve(listener, router(state)).await?;
    Ok(())
}
