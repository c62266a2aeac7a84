use std::sync::Arc;

use agent::cache::LayerCache;
use agent::llm::LlmClient;
use agent::locks::RedisHandles;
use agent::AgentDeps;
use clap::Parser;
use model::map_state::DefaultMapStateProvider;
use notifications::NotificationBus;
use pg::{
    MundiPgPool,
    PostgresConnectionManager,
};
use server::config::ServerConfig;
use server::{
    router,
    AppState,
};
use storage::ObjectStore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("install rustls crypto provider");

    let config = ServerConfig::parse();

    let app_pool = MundiPgPool::new(pg::app_db_config()?, pg::permissive_tls());
    {
        let conn = app_pool.acquire("bootstrap").await?;
        pg::bootstrap::initialize(&conn).await?;
    }

    let bus = NotificationBus::new();
    let _chat_listener = notifications::spawn_chat_listener(bus.clone(), app_pool.clone());

    let deps = Arc::new(AgentDeps {
        manager: Arc::new(PostgresConnectionManager::new(app_pool.clone())),
        app_pool,
        bus,
        store: ObjectStore::from_env().await?,
        redis: RedisHandles::from_env().await?,
        llm: LlmClient::from_env(),
        layer_cache: LayerCache::new(&config.cache_dir)?,
        map_state: Arc::new(DefaultMapStateProvider),
    });

    let app = router(AppState { deps });
    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    tracing::info!("mundi-server listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
