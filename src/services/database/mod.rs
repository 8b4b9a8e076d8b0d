// Source adapters for the engines the gateway can dispatch to
pub mod adapter;
pub mod postgresql;
pub mod mysql;
pub mod doris;
pub mod druid;

pub use adapter::{coerce_text_value, SourceAdapter};
pub use doris::DorisAdapter;
pub use druid::DruidAdapter;
pub use mysql::MySqlAdapter;
pub use postgresql::PostgreSqlAdapter;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::SourceConfig;
use crate::error::ExecutionError;
use crate::services::connection_pool::ConnectionPoolManager;
use crate::services::sql::Dialect;

/// Database engine behind a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Postgresql,
    Mysql,
    Doris,
    Druid,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Postgresql => "postgresql",
            Engine::Mysql => "mysql",
            Engine::Doris => "doris",
            Engine::Druid => "druid",
        }
    }

    /// SQL dialect the engine speaks.
    pub fn dialect(&self) -> Dialect {
        match self {
            Engine::Postgresql => Dialect::Postgresql,
            Engine::Mysql => Dialect::Mysql,
            Engine::Doris => Dialect::Doris,
            Engine::Druid => Dialect::Druid,
        }
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(Engine::Postgresql),
            "mysql" | "mariadb" => Ok(Engine::Mysql),
            "doris" => Ok(Engine::Doris),
            "druid" => Ok(Engine::Druid),
            _ => Err(format!("Unsupported database engine: {}", s)),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Factory function to create the adapter for a configured source.
/// PostgreSQL sources share pools through the pool manager.
pub async fn create_adapter(
    source: &SourceConfig,
    pool_manager: &ConnectionPoolManager,
) -> Result<Arc<dyn SourceAdapter>, ExecutionError> {
    match source.engine {
        Engine::Postgresql => {
            let pool = pool_manager.get_or_create_pool(&source.url).await?;
            Ok(Arc::new(PostgreSqlAdapter::new(&source.id, pool, &source.url)?))
        }
        Engine::Mysql => Ok(Arc::new(MySqlAdapter::new(&source.id, &source.url, source.pool_size)?)),
        Engine::Doris => Ok(Arc::new(DorisAdapter::new(&source.id, &source.url, source.pool_size)?)),
        Engine::Druid => Ok(Arc::new(DruidAdapter::new(&source.id, &source.url)?)),
    }
}
