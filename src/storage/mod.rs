// Shared key-value store
//
// The store is the single source of truth for cache entries, leases and
// rate-limit buckets. Every operation must be atomic on its own; callers
// never hold a lock across two calls.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Pure transition applied by [`SharedStore::update`]. It may run while the
/// store holds a lock, so it must not block.
pub type UpdateFn<'a> =
    dyn Fn(Option<&[u8]>) -> Result<Option<Vec<u8>>, StoreError> + Send + Sync + 'a;

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Value stored under `key`, unless absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Claim `key` for `owner` if it is absent or expired. Returns whether the
    /// claim succeeded.
    async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Extend a claim still held by `owner`. Returns false if it was lost.
    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Drop a claim held by `owner`. Returns false if it was not held.
    async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError>;

    /// Store `value` under `entry_key` and drop `owner`'s claim on
    /// `lease_key` in one step.
    async fn publish_and_release(
        &self,
        entry_key: &str,
        value: &[u8],
        ttl: Duration,
        lease_key: &str,
        owner: &str,
    ) -> Result<(), StoreError>;

    /// Read-modify-write `key` as one atomic step. `apply` sees the live
    /// value (`None` if absent or expired) and returns the replacement, or
    /// `None` to leave the key untouched. `ttl` of `None` never expires.
    /// Returns the value `apply` saw.
    async fn update(
        &self,
        key: &str,
        ttl: Option<Duration>,
        apply: &UpdateFn<'_>,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove expired keys; returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}
