use anyhow::Context;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use semantic_gateway::api::auth::ApiKeyRegistry;
use semantic_gateway::api::routes::create_router;
use semantic_gateway::config::{Config, StoreBackend};
use semantic_gateway::services::database::create_adapter;
use semantic_gateway::services::{
    CatalogRegistry, ConnectionPoolManager, Dispatcher, QueryService, ServiceSettings,
};
use semantic_gateway::storage::{MemoryStore, SharedStore, SqliteStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("Starting semantic gateway on {}", config.server_address());

    let store: Arc<dyn SharedStore> = match config.store.backend {
        StoreBackend::Sqlite => Arc::new(SqliteStore::new(&config.store.path).await.map_err(|e| {
            error!("Failed to open shared store {}: {}", config.store.path, e);
            e
        })?),
        StoreBackend::Memory => {
            warn!("Using in-memory store; cache and rate limits are not shared across processes");
            Arc::new(MemoryStore::new())
        }
    };

    // Source adapters
    let max_pool_size = config.sources.iter().map(|s| s.pool_size).max().unwrap_or(16);
    let pool_manager = ConnectionPoolManager::with_config(max_pool_size, Duration::from_secs(5));
    let mut dispatcher = Dispatcher::new();
    let mut source_dialects = HashMap::new();
    for source in &config.sources {
        let adapter = create_adapter(source, &pool_manager)
            .await
            .with_context(|| format!("Failed to create adapter for source '{}'", source.id))?;
        if let Err(e) = adapter.connect().await {
            warn!("Source '{}' is not reachable yet: {}", source.id, e);
        }
        source_dialects.insert(source.id.clone(), source.engine.dialect());
        dispatcher.register(adapter);
    }

    // Catalog
    let catalog = CatalogRegistry::new(source_dialects).with_path(&config.catalog.path);
    catalog
        .reload()
        .await
        .with_context(|| format!("Failed to load catalog from {}", config.catalog.path))?;

    let service = Arc::new(QueryService::new(
        Arc::new(catalog),
        Arc::new(dispatcher),
        store,
        ServiceSettings::from(&config),
    ));

    spawn_purge_task(service.clone(), Duration::from_secs(config.store.purge_interval_secs));

    let api_keys = ApiKeyRegistry::new(&config.api_keys);
    if api_keys.is_empty() {
        warn!("No API keys configured; every /api request will be rejected");
    }

    let app = create_router(service, api_keys);

    // Start server
    let addr: SocketAddr = config.server_address().parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically drop expired cache entries, leases and idle buckets.
fn spawn_purge_task(service: Arc<QueryService>, every: Duration) {
    if every.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            match service.cache().purge_expired().await {
                Ok(0) => {}
                Ok(purged) => info!("Purged {} expired store entries", purged),
                Err(e) => warn!("Store purge failed: {}", e),
            }
        }
    });
}
