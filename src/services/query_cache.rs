// Query Result Cache Service
//
// Content-addressed result cache with per-key execution leases in the shared
// store. Identical concurrent queries run once: in-process callers share a
// single future, callers in other processes wait on the store lease.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{GatewayError, SecurityError};
use crate::models::{ColumnSchema, QueryResult, RowSet};
use crate::services::sql::CompiledQuery;
use crate::storage::SharedStore;

const KEY_VERSION: u32 = 1;

/// Cache key derived from an RLS-enforced compiled query.
///
/// The hash covers the whole AST, including the tenant guard, the RLS state
/// and the tenant it was resolved for, so two tenants never share a key and
/// an admin bypass never shares a key with a scoped query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_query(query: &CompiledQuery) -> Result<Self, GatewayError> {
        if query.rls().tenant_id().is_none() {
            return Err(SecurityError::Unenforced.into());
        }
        let canonical = serde_json::to_vec(&serde_json::json!({
            "v": KEY_VERSION,
            "query": query,
        }))
        .map_err(|e| GatewayError::Internal(format!("Failed to encode cache key: {}", e)))?;
        let digest = Sha256::digest(&canonical);
        Ok(Self(format!("qc:v{}:{}", KEY_VERSION, hex::encode(digest))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn entry_key(&self) -> String {
        format!("{}:entry", self.0)
    }

    fn lease_key(&self) -> String {
        format!("{}:lease", self.0)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result as stored in the shared store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub columns: Vec<ColumnSchema>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    fn new(rows: &RowSet, ttl: Duration) -> Self {
        Self {
            columns: rows.columns.clone(),
            rows: rows.rows.clone(),
            created_at: chrono::Utc::now(),
            ttl_secs: ttl.as_secs().max(1),
        }
    }

    /// Check if cache entry is expired
    fn is_expired(&self) -> bool {
        let age = chrono::Utc::now().signed_duration_since(self.created_at);
        age.num_milliseconds() >= (self.ttl_secs as i64).saturating_mul(1000)
    }

    fn into_rows(self) -> RowSet {
        RowSet {
            columns: self.columns,
            rows: self.rows,
        }
    }
}

/// Lease timing.
#[derive(Debug, Clone, Copy)]
pub struct LeaseSettings {
    /// Must be shorter than the query timeout; the executor renews it.
    pub lease_ttl: Duration,
    /// How often a waiter re-checks the store.
    pub poll_interval: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Requests served from the store, including results published by
    /// another executor while waiting
    pub hits: u64,
    /// Requests that ran the query or failed, counted once however long
    /// they waited
    pub misses: u64,
    /// Entries found but past their TTL
    pub expirations: u64,
    /// Executions started by this process
    pub executions: u64,
    /// Callers that joined an in-process execution
    pub coalesced: u64,
    /// Claims lost to another executor
    pub lease_conflicts: u64,
    /// Store failures that degraded to uncached execution
    pub store_errors: u64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    executions: AtomicU64,
    coalesced: AtomicU64,
    lease_conflicts: AtomicU64,
    store_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
struct Outcome {
    rows: RowSet,
    cache_hit: bool,
}

type SharedExecution = Shared<BoxFuture<'static, Result<Outcome, GatewayError>>>;

/// State the shared execution owns, so it can outlive any single caller.
#[derive(Clone)]
struct LeaseContext {
    store: Arc<dyn SharedStore>,
    settings: LeaseSettings,
    counters: Arc<Counters>,
}

pub struct QueryCache {
    ctx: LeaseContext,
    inflight: Arc<Mutex<HashMap<CacheKey, WeakShared<BoxFuture<'static, Result<Outcome, GatewayError>>>>>>,
}

impl QueryCache {
    pub fn new(store: Arc<dyn SharedStore>, settings: LeaseSettings) -> Self {
        Self {
            ctx: LeaseContext {
                store,
                settings,
                counters: Arc::new(Counters::default()),
            },
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> LeaseSettings {
        self.ctx.settings
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.ctx.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            executions: c.executions.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            lease_conflicts: c.lease_conflicts.load(Ordering::Relaxed),
            store_errors: c.store_errors.load(Ordering::Relaxed),
        }
    }

    /// Remove expired entries and leases from the store.
    pub async fn purge_expired(&self) -> Result<u64, GatewayError> {
        Ok(self.ctx.store.purge_expired().await?)
    }

    /// Serve `key` from the cache or run `execute` at most once across all
    /// concurrent callers, publishing its result for `ttl`.
    ///
    /// A zero `ttl` disables caching and runs `execute` directly. Waiting for
    /// another executor is bounded by `deadline`.
    pub async fn get_or_execute<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        deadline: Instant,
        execute: F,
    ) -> Result<QueryResult, GatewayError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<RowSet, GatewayError>> + Send + 'static,
    {
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        if ttl.is_zero() {
            let rows = execute().await?;
            return Ok(QueryResult::from_rows(rows, elapsed_ms(), false));
        }

        match self.ctx.read_entry(key).await {
            Ok(Some(rows)) => {
                tracing::debug!(key = %key, "Cache hit");
                Counters::bump(&self.ctx.counters.hits);
                return Ok(QueryResult::from_rows(rows, elapsed_ms(), true));
            }
            Ok(None) => tracing::debug!(key = %key, "Cache miss"),
            Err(e) => {
                Counters::bump(&self.ctx.counters.store_errors);
                tracing::warn!(key = %key, error = %e, "Cache lookup failed");
            }
        }

        let shared = self.join_or_start(key, ttl, deadline, execute).await;
        let outcome = shared.clone().await;
        self.forget(key, &shared).await;

        match &outcome {
            Ok(outcome) if outcome.cache_hit => Counters::bump(&self.ctx.counters.hits),
            _ => Counters::bump(&self.ctx.counters.misses),
        }
        let outcome = outcome?;
        Ok(QueryResult::from_rows(outcome.rows, elapsed_ms(), outcome.cache_hit))
    }

    async fn join_or_start<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        deadline: Instant,
        execute: F,
    ) -> SharedExecution
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<RowSet, GatewayError>> + Send + 'static,
    {
        let mut inflight = self.inflight.lock().await;
        if let Some(existing) = inflight.get(key).and_then(WeakShared::upgrade) {
            Counters::bump(&self.ctx.counters.coalesced);
            tracing::debug!(key = %key, "Joining in-flight execution");
            return existing;
        }

        let ctx = self.ctx.clone();
        let owned_key = key.clone();
        let shared = async move { ctx.run_leased(owned_key, ttl, deadline, execute).await }
            .boxed()
            .shared();
        if let Some(weak) = shared.downgrade() {
            inflight.insert(key.clone(), weak);
        }
        shared
    }

    /// Drop the in-flight slot once the execution it points at has finished.
    async fn forget(&self, key: &CacheKey, finished: &SharedExecution) {
        let mut inflight = self.inflight.lock().await;
        let stale = match inflight.get(key).map(WeakShared::upgrade) {
            Some(Some(current)) => current.ptr_eq(finished),
            Some(None) => true,
            None => false,
        };
        if stale {
            inflight.remove(key);
        }
    }
}

impl LeaseContext {
    /// Look up a published entry. Hits and misses are counted once per
    /// request by the caller, not per poll.
    async fn read_entry(&self, key: &CacheKey) -> Result<Option<RowSet>, GatewayError> {
        let Some(bytes) = self.store.get(&key.entry_key()).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.is_expired() => {
                Counters::bump(&self.counters.expirations);
                Ok(None)
            }
            Ok(entry) => Ok(Some(entry.into_rows())),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    async fn run_leased<F, Fut>(
        self,
        key: CacheKey,
        ttl: Duration,
        deadline: Instant,
        execute: F,
    ) -> Result<Outcome, GatewayError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<RowSet, GatewayError>> + Send + 'static,
    {
        let owner = uuid::Uuid::new_v4().to_string();
        let lease_key = key.lease_key();
        let started = Instant::now();

        loop {
            match self.store.claim(&lease_key, &owner, self.settings.lease_ttl).await {
                Ok(true) => {
                    let guard = LeaseGuard::new(self.store.clone(), lease_key.clone(), owner.clone());

                    // Another executor may have published between our miss and our claim.
                    if let Ok(Some(rows)) = self.read_entry(&key).await {
                        guard.release().await;
                        return Ok(Outcome {
                            rows,
                            cache_hit: true,
                        });
                    }

                    Counters::bump(&self.counters.executions);
                    let result = self.execute_with_renewal(&lease_key, &owner, execute()).await;
                    return match result {
                        Ok(rows) => {
                            self.publish(&key, &rows, ttl, guard).await;
                            Ok(Outcome {
                                rows,
                                cache_hit: false,
                            })
                        }
                        Err(e) => {
                            guard.release().await;
                            Err(e)
                        }
                    };
                }
                Ok(false) => {
                    Counters::bump(&self.counters.lease_conflicts);
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(GatewayError::Timeout(started.elapsed()));
                    }
                    let wait = self.settings.poll_interval.min(deadline - now);
                    tokio::time::sleep(wait).await;

                    match self.read_entry(&key).await {
                        Ok(Some(rows)) => {
                            tracing::debug!(key = %key, "Result published by another executor");
                            return Ok(Outcome {
                                rows,
                                cache_hit: true,
                            });
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(key = %key, error = %e, "Cache poll failed"),
                    }
                }
                Err(e) => {
                    Counters::bump(&self.counters.store_errors);
                    tracing::warn!(
                        key = %key,
                        error = %e,
                        "Lease store unavailable, executing without deduplication"
                    );
                    Counters::bump(&self.counters.executions);
                    let rows = execute().await?;
                    return Ok(Outcome {
                        rows,
                        cache_hit: false,
                    });
                }
            }
        }
    }

    /// Drive `execution` while renewing the lease at a third of its TTL.
    async fn execute_with_renewal<Fut>(
        &self,
        lease_key: &str,
        owner: &str,
        execution: Fut,
    ) -> Result<RowSet, GatewayError>
    where
        Fut: Future<Output = Result<RowSet, GatewayError>>,
    {
        tokio::pin!(execution);
        let period = (self.settings.lease_ttl / 3).max(Duration::from_millis(1));
        let mut renewals = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                result = &mut execution => return result,
                _ = renewals.tick() => {
                    match self.store.renew(lease_key, owner, self.settings.lease_ttl).await {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!(lease = %lease_key, "Lease lost while executing"),
                        Err(e) => tracing::warn!(lease = %lease_key, error = %e, "Lease renewal failed"),
                    }
                }
            }
        }
    }

    async fn publish(&self, key: &CacheKey, rows: &RowSet, ttl: Duration, guard: LeaseGuard) {
        let entry = CacheEntry::new(rows, ttl);
        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to encode cache entry");
                guard.release().await;
                return;
            }
        };
        match self
            .store
            .publish_and_release(&key.entry_key(), &bytes, ttl, &guard.lease_key, &guard.owner)
            .await
        {
            Ok(()) => {
                guard.disarm();
                tracing::debug!(key = %key, rows = rows.rows.len(), "Published result");
            }
            Err(e) => {
                Counters::bump(&self.counters.store_errors);
                tracing::warn!(key = %key, error = %e, "Failed to publish result");
                guard.release().await;
            }
        }
    }
}

/// Releases the lease if the holder goes away without publishing, e.g. when
/// the last caller is cancelled mid-execution.
struct LeaseGuard {
    store: Arc<dyn SharedStore>,
    lease_key: String,
    owner: String,
    armed: bool,
}

impl LeaseGuard {
    fn new(store: Arc<dyn SharedStore>, lease_key: String, owner: String) -> Self {
        Self {
            store,
            lease_key,
            owner,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.store.release(&self.lease_key, &self.owner).await {
            tracing::warn!(lease = %self.lease_key, error = %e, "Failed to release lease");
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let lease_key = std::mem::take(&mut self.lease_key);
        let owner = std::mem::take(&mut self.owner);
        handle.spawn(async move {
            if let Err(e) = store.release(&lease_key, &owner).await {
                tracing::warn!(lease = %lease_key, error = %e, "Failed to release abandoned lease");
            }
        });
    }
}
