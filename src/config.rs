use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, File};

use crate::models::Role;
use crate::services::compiler::CompilerLimits;
use crate::services::database::Engine;
use crate::services::query_cache::LeaseSettings;
use crate::services::rate_limiter::BucketConfig;

/// Slowest accepted bucket refill, one token every ~17 minutes.
pub const MIN_REFILL_PER_SEC: f64 = 0.001;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub catalog: CatalogConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// SQLite file shared by every gateway process on the host.
    pub path: String,
    pub purge_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Used when a dataset sets no TTL of its own.
    pub default_ttl_secs: u64,
    pub lease_ttl_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    pub timeout_secs: u64,
    pub default_limit: u64,
    pub max_limit: u64,
    pub max_dimensions: usize,
    pub max_metrics: usize,
    pub max_filter_depth: usize,
    pub max_in_list: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub query: BucketConfig,
    pub metadata: BucketConfig,
}

/// One database the gateway can dispatch to.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub engine: Engine,
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    16
}

/// Static API key entry. Stands in for a real identity provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
    pub id: String,
    pub key: String,
    pub tenant_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    /// Built-in defaults, before any file or environment override.
    pub fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("catalog.path", "./catalog.json")?
            .set_default("store.backend", "sqlite")?
            .set_default("store.path", "./gateway-store.db")?
            .set_default("store.purge_interval_secs", 60)?
            .set_default("cache.default_ttl_secs", 300)?
            .set_default("cache.lease_ttl_ms", 10_000)?
            .set_default("cache.poll_interval_ms", 50)?
            .set_default("query.timeout_secs", 30)?
            .set_default("query.default_limit", 1_000)?
            .set_default("query.max_limit", 100_000)?
            .set_default("query.max_dimensions", 10)?
            .set_default("query.max_metrics", 20)?
            .set_default("query.max_filter_depth", 4)?
            .set_default("query.max_in_list", 1_000)?
            .set_default("rate_limit.query.capacity", 20.0)?
            .set_default("rate_limit.query.refill_per_sec", 5.0)?
            .set_default("rate_limit.metadata.capacity", 60.0)?
            .set_default("rate_limit.metadata.refill_per_sec", 10.0)?
            .set_default("logging.level", "info")
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let config_file = env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "gateway".to_string());
        let mut builder = Self::defaults()?.add_source(File::with_name(&config_file).required(false));

        if let Ok(host) = env::var("HOST") {
            builder = builder.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            let port = port
                .parse::<u16>()
                .map_err(|e| ConfigError::Message(format!("Invalid PORT '{}': {}", port, e)))?;
            builder = builder.set_override("server.port", port)?;
        }

        if let Ok(path) = env::var("CATALOG_PATH") {
            builder = builder.set_override("catalog.path", path)?;
        }

        if let Ok(backend) = env::var("STORE_BACKEND") {
            builder = builder.set_override("store.backend", backend)?;
        }

        if let Ok(path) = env::var("STORE_PATH") {
            builder = builder.set_override("store.path", path)?;
        }

        if let Ok(timeout) = env::var("QUERY_TIMEOUT_SECS") {
            let timeout = timeout.parse::<u64>().map_err(|e| {
                ConfigError::Message(format!("Invalid QUERY_TIMEOUT_SECS '{}': {}", timeout, e))
            })?;
            builder = builder.set_override("query.timeout_secs", timeout)?;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks the deserializer cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_settings().lease_ttl >= self.query_timeout() {
            return Err(ConfigError::Message(format!(
                "cache.lease_ttl_ms ({}) must be below query.timeout_secs ({}s)",
                self.cache.lease_ttl_ms, self.query.timeout_secs
            )));
        }
        if self.cache.poll_interval_ms == 0 {
            return Err(ConfigError::Message("cache.poll_interval_ms must be positive".into()));
        }
        if self.query.default_limit > self.query.max_limit {
            return Err(ConfigError::Message(
                "query.default_limit must not exceed query.max_limit".into(),
            ));
        }
        for (name, bucket) in [("query", &self.rate_limit.query), ("metadata", &self.rate_limit.metadata)] {
            let capacity_ok = bucket.capacity.is_finite() && bucket.capacity >= 1.0;
            let refill_ok =
                bucket.refill_per_sec.is_finite() && bucket.refill_per_sec >= MIN_REFILL_PER_SEC;
            if !capacity_ok || !refill_ok {
                return Err(ConfigError::Message(format!(
                    "rate_limit.{} needs a finite capacity >= 1 and a finite refill rate >= {}/s",
                    name, MIN_REFILL_PER_SEC
                )));
            }
        }

        let mut source_ids = HashSet::new();
        for source in &self.sources {
            if !source_ids.insert(source.id.as_str()) {
                return Err(ConfigError::Message(format!("Source '{}' is defined twice", source.id)));
            }
        }
        let mut keys = HashSet::new();
        for api_key in &self.api_keys {
            if !keys.insert(api_key.key.as_str()) {
                return Err(ConfigError::Message(format!(
                    "API key '{}' reuses another key's secret",
                    api_key.id
                )));
            }
        }
        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query.timeout_secs)
    }

    pub fn default_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.default_ttl_secs)
    }

    pub fn lease_settings(&self) -> LeaseSettings {
        LeaseSettings {
            lease_ttl: Duration::from_millis(self.cache.lease_ttl_ms),
            poll_interval: Duration::from_millis(self.cache.poll_interval_ms),
        }
    }

    pub fn compiler_limits(&self) -> CompilerLimits {
        CompilerLimits {
            max_dimensions: self.query.max_dimensions,
            max_metrics: self.query.max_metrics,
            max_filter_depth: self.query.max_filter_depth,
            max_limit: self.query.max_limit,
            default_limit: self.query.default_limit,
            max_in_list: self.query.max_in_list,
        }
    }
}
