use deadpool_postgres::{Config as PgConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Timeouts};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_postgres::NoTls;

use crate::error::ExecutionError;

/// Connection pool manager that maintains pools for PostgreSQL sources.
/// Sources pointing at the same URL share one pool.
pub struct ConnectionPoolManager {
    pools: Arc<RwLock<HashMap<String, Pool>>>,
    max_pool_size: usize,
    acquire_timeout: Duration,
}

impl ConnectionPoolManager {
    /// Create a new connection pool manager with default settings
    pub fn new() -> Self {
        Self::with_config(16, Duration::from_secs(5))
    }

    /// Create a connection pool manager with custom pool settings
    pub fn with_config(max_pool_size: usize, acquire_timeout: Duration) -> Self {
        Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
            max_pool_size,
            acquire_timeout,
        }
    }

    /// Get or create a connection pool for the given connection URL
    /// This method is safe to call concurrently from multiple tasks
    pub async fn get_or_create_pool(&self, connection_url: &str) -> Result<Pool, ExecutionError> {
        // Fast path: check if pool already exists (read lock)
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(connection_url) {
                tracing::debug!("Using existing connection pool for: {}", mask_credentials(connection_url));
                return Ok(pool.clone());
            }
        }

        // Slow path: create new pool (write lock)
        let mut pools = self.pools.write().await;

        // Double-check in case another task created the pool while we were waiting
        if let Some(pool) = pools.get(connection_url) {
            return Ok(pool.clone());
        }

        tracing::info!(
            "Creating new connection pool for: {} (max_size: {})",
            mask_credentials(connection_url),
            self.max_pool_size
        );

        let mut cfg = PgConfig::new();
        cfg.url = Some(connection_url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        // A bounded wait turns pool exhaustion into a retryable error
        cfg.pool = Some(PoolConfig {
            max_size: self.max_pool_size,
            timeouts: Timeouts {
                wait: Some(self.acquire_timeout),
                create: Some(self.acquire_timeout),
                recycle: Some(self.acquire_timeout),
            },
            ..PoolConfig::default()
        });

        let pool = cfg
            .create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
            .map_err(|e| {
                tracing::error!("Failed to create connection pool: {}", e);
                ExecutionError::connection(format!("Failed to create connection pool: {}", e))
            })?;

        pools.insert(connection_url.to_string(), pool.clone());
        Ok(pool)
    }

    /// Get the number of active pools
    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }
}

impl Default for ConnectionPoolManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Mask credentials in connection URL for safe logging
pub fn mask_credentials(url: &str) -> String {
    if let Ok(parsed_url) = url::Url::parse(url) {
        let mut masked = parsed_url.clone();
        if parsed_url.password().is_some() {
            let _ = masked.set_password(Some("***"));
        }
        masked.to_string()
    } else {
        "[invalid-url]".to_string()
    }
}
