mod config;

use tracing::info;

use palaver_api::state::AppStateInner;
use palaver_gateway::dispatcher::Dispatcher;

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "palaver_server=debug,palaver_api=debug,palaver_gateway=debug,palaver_db=info,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Init database
    let db = palaver_db::Database::open(&config.db_path)?;

    // Shared state
    let state = AppStateInner::new(db, Dispatcher::new(config.broadcast_capacity));
    let app = palaver_api::router(state);

    info!("Palaver log service listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
