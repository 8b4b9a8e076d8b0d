use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::Mutex;

use super::{SharedStore, UpdateFn};
use crate::error::StoreError;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

/// SQLite-backed shared store. Every gateway process on a host opens the
/// same file; each operation is a single statement or transaction, so
/// SQLite's locking provides the atomicity.
/// Uses tokio::Mutex for async-friendly locking
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at `db_path`.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        // Handle SQLite URL format (sqlite:./path or sqlite://path)
        let path_str = db_path.as_ref().to_string_lossy();
        let clean_path: &str = if path_str.starts_with("sqlite:") {
            path_str.trim_start_matches("sqlite:").trim_start_matches("//")
        } else {
            path_str.as_ref()
        };

        let conn = Connection::open(clean_path)?;
        Self::from_connection(conn).await
    }

    /// Private in-memory store, for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?).await
    }

    async fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        // journal_mode reports the resulting mode as a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                expires_at_ms INTEGER
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv(expires_at_ms)",
            [],
        )?;
        Ok(())
    }
}

/// Insert `value` unless a live row already exists. Returns rows changed.
fn insert_if_absent(
    conn: &Connection,
    key: &str,
    value: &[u8],
    expires_at_ms: Option<i64>,
    now: i64,
) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        INSERT INTO kv (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE
            SET value = excluded.value, expires_at_ms = excluded.expires_at_ms
            WHERE kv.expires_at_ms IS NOT NULL AND kv.expires_at_ms <= ?4
        "#,
        params![key, value, expires_at_ms, now],
    )
}

fn upsert(
    conn: &Connection,
    key: &str,
    value: &[u8],
    expires_at_ms: Option<i64>,
) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        INSERT INTO kv (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE
            SET value = excluded.value, expires_at_ms = excluded.expires_at_ms
        "#,
        params![key, value, expires_at_ms],
    )
}

fn live_value(conn: &Connection, key: &str, now: i64) -> rusqlite::Result<Option<Vec<u8>>> {
    conn.query_row(
        "SELECT value FROM kv WHERE key = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
        params![key, now],
        |row| row.get::<_, Vec<u8>>(0),
    )
    .optional()
}

fn delete_if_owned(conn: &Connection, key: &str, owner: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM kv WHERE key = ?1 AND value = ?2",
        params![key, owner.as_bytes()],
    )
}

#[async_trait]
impl SharedStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock().await;
        Ok(live_value(&conn, key, now_ms())?)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        upsert(&conn, key, value, Some(expiry_ms(ttl)))?;
        Ok(())
    }

    async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = insert_if_absent(&conn, key, owner.as_bytes(), Some(expiry_ms(ttl)), now_ms())?;
        Ok(changed == 1)
    }

    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            r#"
            UPDATE kv SET expires_at_ms = ?3
            WHERE key = ?1 AND value = ?2 AND (expires_at_ms IS NULL OR expires_at_ms > ?4)
            "#,
            params![key, owner.as_bytes(), expiry_ms(ttl), now_ms()],
        )?;
        Ok(changed == 1)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        Ok(delete_if_owned(&conn, key, owner)? == 1)
    }

    async fn publish_and_release(
        &self,
        entry_key: &str,
        value: &[u8],
        ttl: Duration,
        lease_key: &str,
        owner: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        upsert(&tx, entry_key, value, Some(expiry_ms(ttl)))?;
        delete_if_owned(&tx, lease_key, owner)?;
        tx.commit()?;
        Ok(())
    }

    async fn update(
        &self,
        key: &str,
        ttl: Option<Duration>,
        apply: &UpdateFn<'_>,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.lock().await;
        // IMMEDIATE takes the write lock up front, so other processes on the
        // file wait in busy_timeout instead of interleaving.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = live_value(&tx, key, now_ms())?;
        if let Some(value) = apply(current.as_deref())? {
            upsert(&tx, key, &value, ttl.map(expiry_ms))?;
        }
        tx.commit()?;
        Ok(current)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM kv WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
            params![now_ms()],
        )?;
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sqlite_store_creation() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("store.db");
        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = rt.block_on(async { SqliteStore::new(&db_path).await });
        assert!(store.is_ok());
    }

    #[tokio::test]
    async fn test_sqlite_url_prefix_is_stripped() {
        let dir = tempdir().unwrap();
        let db_path = format!("sqlite:{}", dir.path().join("store.db").display());
        let store = SqliteStore::new(&db_path).await.unwrap();
        store.set_with_ttl("k", b"v", Duration::from_secs(5)).await.unwrap();
        assert!(dir.path().join("store.db").exists());
    }

    #[tokio::test]
    async fn test_claim_renew_release() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ttl = Duration::from_secs(30);
        assert!(store.claim("lease", "a", ttl).await.unwrap());
        assert!(!store.claim("lease", "b", ttl).await.unwrap());
        assert!(store.renew("lease", "a", ttl).await.unwrap());
        assert!(!store.renew("lease", "b", ttl).await.unwrap());
        assert!(!store.release("lease", "b").await.unwrap());
        assert!(store.release("lease", "a").await.unwrap());
        assert!(store.claim("lease", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_rows_are_invisible_and_claimable() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.set_with_ttl("entry", b"old", Duration::ZERO).await.unwrap();
        assert_eq!(store.get("entry").await.unwrap(), None);

        assert!(store.claim("lease", "a", Duration::ZERO).await.unwrap());
        assert!(store.claim("lease", "b", Duration::from_secs(30)).await.unwrap());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_publish_and_release_is_atomic() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ttl = Duration::from_secs(30);
        store.claim("q:lease", "owner", ttl).await.unwrap();
        store
            .publish_and_release("q:entry", b"result", ttl, "q:lease", "owner")
            .await
            .unwrap();
        assert_eq!(store.get("q:entry").await.unwrap(), Some(b"result".to_vec()));
        assert_eq!(store.get("q:lease").await.unwrap(), None);
    }

    fn increment(current: Option<&[u8]>) -> Result<Option<Vec<u8>>, StoreError> {
        let n = current.map_or(0, |bytes| bytes[0]);
        Ok(Some(vec![n + 1]))
    }

    #[tokio::test]
    async fn test_update_returns_previous_value() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert_eq!(store.update("bucket", None, &increment).await.unwrap(), None);
        assert_eq!(store.update("bucket", None, &increment).await.unwrap(), Some(vec![1]));
        assert_eq!(store.get("bucket").await.unwrap(), Some(vec![2]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_updates_from_two_connections_are_not_lost() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let a = Arc::new(SqliteStore::new(&path).await.unwrap());
        let b = Arc::new(SqliteStore::new(&path).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..40 {
            let store = if i % 2 == 0 { a.clone() } else { b.clone() };
            handles.push(tokio::spawn(async move {
                store.update("n", None, &increment).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(a.get("n").await.unwrap(), Some(vec![40]));
    }

    fn reject(_: Option<&[u8]>) -> Result<Option<Vec<u8>>, StoreError> {
        Err(StoreError::Codec("bad state".into()))
    }

    #[tokio::test]
    async fn test_failed_update_writes_nothing() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.set_with_ttl("bucket", b"x", Duration::from_secs(30)).await.unwrap();
        let err = store
            .update("bucket", None, &reject)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Codec(_)));
        assert_eq!(store.get("bucket").await.unwrap(), Some(b"x".to_vec()));
    }
}
