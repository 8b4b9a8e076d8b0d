// Rate Limiter
//
// Token bucket per (API key, route class). Bucket state lives in the shared
// store and each admission is one atomic read-modify-write, so every gateway
// process sees the same budget and concurrent requests never lose a token.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::storage::SharedStore;

/// Route classes with independent budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteClass {
    Query,
    Metadata,
}

impl RouteClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Query => "query",
            RouteClass::Metadata => "metadata",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Burst size.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl BucketConfig {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Allowed,
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    updated_ms: i64,
}

impl BucketState {
    fn full(config: &BucketConfig, now_ms: i64) -> Self {
        Self {
            tokens: config.capacity,
            updated_ms: now_ms,
        }
    }

    fn refilled(&self, config: &BucketConfig, now_ms: i64) -> Self {
        // Clock skew between processes must never drain a bucket.
        let elapsed_secs = (now_ms - self.updated_ms).max(0) as f64 / 1000.0;
        Self {
            tokens: (self.tokens + elapsed_secs * config.refill_per_sec).min(config.capacity),
            updated_ms: now_ms.max(self.updated_ms),
        }
    }
}

const TOKEN_EPSILON: f64 = 1e-9;
/// Longest retention for an idle bucket; slower buckets never expire.
const MAX_IDLE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    query: BucketConfig,
    metadata: BucketConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, query: BucketConfig, metadata: BucketConfig) -> Self {
        Self {
            store,
            query,
            metadata,
        }
    }

    pub fn config(&self, route: RouteClass) -> &BucketConfig {
        match route {
            RouteClass::Query => &self.query,
            RouteClass::Metadata => &self.metadata,
        }
    }

    pub async fn admit(&self, key_id: &str, route: RouteClass) -> Result<Admission, StoreError> {
        self.admit_at(key_id, route, chrono::Utc::now().timestamp_millis())
            .await
    }

    /// Take one token from the bucket as of `now_ms`.
    pub async fn admit_at(
        &self,
        key_id: &str,
        route: RouteClass,
        now_ms: i64,
    ) -> Result<Admission, StoreError> {
        let config = *self.config(route);
        let key = format!("ratelimit:{}:{}", route.as_str(), key_id);

        let previous = self
            .store
            .update(&key, idle_ttl(&config), &|current: Option<&[u8]>| {
                take_token(&config, now_ms, current).map(|(next, _)| next)
            })
            .await?;
        // The transition is pure, so replaying it on what the store saw
        // yields the admission that was applied.
        let (_, admission) = take_token(&config, now_ms, previous.as_deref())?;

        if !admission.is_allowed() {
            tracing::warn!(key_id, route = route.as_str(), "Rate limit exceeded");
        }
        Ok(admission)
    }
}

/// Refill then try to spend one token. Returns the encoded state to write
/// (`None` on denial, which leaves the bucket untouched) and the admission.
fn take_token(
    config: &BucketConfig,
    now_ms: i64,
    current: Option<&[u8]>,
) -> Result<(Option<Vec<u8>>, Admission), StoreError> {
    let state = match current {
        Some(bytes) => serde_json::from_slice::<BucketState>(bytes)?.refilled(config, now_ms),
        None => BucketState::full(config, now_ms),
    };

    if state.tokens + TOKEN_EPSILON < 1.0 {
        let retry_after = time_until_token(state.tokens, config.refill_per_sec);
        return Ok((None, Admission::Denied { retry_after }));
    }

    let next = BucketState {
        tokens: (state.tokens - 1.0).max(0.0),
        updated_ms: state.updated_ms,
    };
    Ok((Some(serde_json::to_vec(&next)?), Admission::Allowed))
}

/// Exact wait until the bucket holds one whole token. Saturates instead of
/// overflowing for very slow refill rates.
fn time_until_token(tokens: f64, refill_per_sec: f64) -> Duration {
    if refill_per_sec.is_nan() || refill_per_sec <= 0.0 {
        return Duration::MAX;
    }
    let missing = (1.0 - tokens).max(0.0);
    Duration::try_from_secs_f64(missing / refill_per_sec).unwrap_or(Duration::MAX)
}

/// A bucket left alone this long is full again, so the row can expire.
/// `None` keeps it forever when refilling takes longer than `MAX_IDLE_TTL`.
fn idle_ttl(config: &BucketConfig) -> Option<Duration> {
    if config.refill_per_sec.is_nan() || config.refill_per_sec <= 0.0 {
        return None;
    }
    let refill_time = Duration::try_from_secs_f64(config.capacity / config.refill_per_sec).ok()?;
    let ttl = refill_time.max(Duration::from_secs(1)).checked_add(Duration::from_secs(1))?;
    (ttl <= MAX_IDLE_TTL).then_some(ttl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn limiter(capacity: f64, refill: f64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryStore::new()),
            BucketConfig::new(capacity, refill),
            BucketConfig::new(100.0, 100.0),
        )
    }

    #[tokio::test]
    async fn test_burst_then_deny() {
        let limiter = limiter(2.0, 1.0);
        let now = 1_000_000;
        assert!(limiter.admit_at("k", RouteClass::Query, now).await.unwrap().is_allowed());
        assert!(limiter.admit_at("k", RouteClass::Query, now).await.unwrap().is_allowed());
        match limiter.admit_at("k", RouteClass::Query, now).await.unwrap() {
            Admission::Denied { retry_after } => assert_eq!(retry_after, Duration::from_secs(1)),
            Admission::Allowed => panic!("third request should be denied"),
        }
    }

    #[tokio::test]
    async fn test_retry_after_is_exact() {
        let limiter = limiter(1.0, 4.0);
        let now = 5_000;
        limiter.admit_at("k", RouteClass::Query, now).await.unwrap();
        let retry_after = match limiter.admit_at("k", RouteClass::Query, now + 100).await.unwrap() {
            Admission::Denied { retry_after } => retry_after,
            Admission::Allowed => panic!("expected denial"),
        };
        // 0.4 tokens refilled after 100ms at 4/s, 0.6 missing.
        assert!((retry_after.as_secs_f64() - 0.15).abs() < 1e-6);

        let later = now + 100 + (retry_after.as_secs_f64() * 1000.0).ceil() as i64;
        assert!(limiter.admit_at("k", RouteClass::Query, later).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_routes_and_keys_are_independent() {
        let limiter = limiter(1.0, 0.5);
        let now = 0;
        assert!(limiter.admit_at("a", RouteClass::Query, now).await.unwrap().is_allowed());
        assert!(!limiter.admit_at("a", RouteClass::Query, now).await.unwrap().is_allowed());
        assert!(limiter.admit_at("b", RouteClass::Query, now).await.unwrap().is_allowed());
        assert!(limiter.admit_at("a", RouteClass::Metadata, now).await.unwrap().is_allowed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_spend_exactly_capacity() {
        let limiter = Arc::new(limiter(5.0, 0.001));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let mut allowed = 0;
                for _ in 0..4 {
                    if limiter.admit_at("shared", RouteClass::Query, 10).await.unwrap().is_allowed() {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn test_extremely_slow_refill_saturates_retry_after() {
        let limiter = limiter(1.0, 1e-300);
        assert!(limiter.admit("k", RouteClass::Query).await.unwrap().is_allowed());
        match limiter.admit("k", RouteClass::Query).await.unwrap() {
            Admission::Denied { retry_after } => assert_eq!(retry_after, Duration::MAX),
            Admission::Allowed => panic!("bucket should be empty"),
        }
    }

    #[test]
    fn test_retry_after_and_idle_ttl_never_panic() {
        assert_eq!(time_until_token(0.0, f64::NAN), Duration::MAX);
        assert_eq!(time_until_token(0.0, 0.0), Duration::MAX);
        assert_eq!(time_until_token(0.5, 2.0), Duration::from_millis(250));

        assert_eq!(idle_ttl(&BucketConfig::new(10.0, f64::NAN)), None);
        assert_eq!(idle_ttl(&BucketConfig::new(10.0, 1e-300)), None);
        assert_eq!(idle_ttl(&BucketConfig::new(f64::INFINITY, 1.0)), None);
        assert_eq!(idle_ttl(&BucketConfig::new(10.0, 5.0)), Some(Duration::from_secs(3)));
    }
}
