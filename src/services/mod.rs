pub mod catalog; // Dataset catalog with validated hot reload
pub mod compiler; // Semantic query -> portable AST
pub mod connection_pool;
pub mod database; // Source adapters (PostgreSQL, MySQL, Doris, Druid)
pub mod dispatcher;
pub mod query_cache; // Result cache with cross-process dedup leases
pub mod query_service;
pub mod rate_limiter;
pub mod rls; // Row-level security
pub mod sql; // Portable AST and dialect rendering

pub use catalog::*;
pub use compiler::*;
pub use connection_pool::*;
pub use dispatcher::*;
pub use query_cache::*;
pub use query_service::*;
pub use rate_limiter::*;
pub use rls::*;
