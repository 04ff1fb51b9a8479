//! Operation lock entries shared by every process on the host.

use async_trait::async_trait;
use backup_engine::lock::store::StoreResult;
use backup_engine::lock::{LockStore, LockStoreError};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::time::Duration;

use crate::db::connection::DbPool;

/// `LockStore` over the `operation_locks` table.
///
/// Expiry is stored as epoch milliseconds and checked on every access, so
/// an entry whose holder died is treated as absent once its TTL passes.
#[derive(Clone)]
pub struct SqliteLockStore {
    pool: DbPool,
}

impl SqliteLockStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| LockStoreError(e.to_string()))?;
            f(&mut *conn).map_err(|e| LockStoreError(e.to_string()))
        })
        .await
        .map_err(|e| LockStoreError(format!("lock store task failed: {}", e)))?
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_millis() + ttl.as_millis() as i64)
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_millis();
            tx.execute(
                "DELETE FROM operation_locks
                 WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                params![key, now],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO operation_locks (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, expiry(ttl)],
            )?;
            tx.commit()?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO operation_locks (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, expiry(ttl)],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM operation_locks
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_millis()],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let now = now_millis();
            let updated = conn.execute(
                "UPDATE operation_locks SET expires_at = ?2
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?3)",
                params![key, now + ttl.as_millis() as i64, now],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM operation_locks WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let (key, expected) = (key.to_string(), expected.to_string());
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM operation_locks
                 WHERE key = ?1 AND value = ?2 AND (expires_at IS NULL OR expires_at > ?3)",
                params![key, expected, now_millis()],
            )?;
            Ok(deleted > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use backup_engine::{LockSettings, OperationLock};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SqliteLockStore {
        let pool = create_pool(&dir.path().join("locks.db")).unwrap();
        migrate(&pool).unwrap();
        SqliteLockStore::new(pool)
    }

    #[tokio::test]
    async fn test_set_if_absent_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert!(store.set_if_absent("k", "a", None).await.unwrap());
        assert!(!store.set_if_absent("k", "b", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_expired_entries_are_absent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store
            .set("k", "a", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.expire("k", Duration::from_secs(1)).await.unwrap());
        assert!(store.set_if_absent("k", "b", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_expire_extends_live_entry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store
            .set("k", "a", Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(store.expire("k", Duration::from_secs(60)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_delete_if_eq_checks_value() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.set("k", "a", None).await.unwrap();
        assert!(!store.delete_if_eq("k", "b").await.unwrap());
        assert!(store.delete_if_eq("k", "a").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);

        store.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_is_shared_between_pools() {
        let dir = TempDir::new().unwrap();
        let first = OperationLock::new(Arc::new(store(&dir)), "default", LockSettings::default())
            .with_terminator(Arc::new(|| {}));
        let second = OperationLock::new(Arc::new(store(&dir)), "default", LockSettings::default());

        first.start().await.unwrap();
        assert!(second.is_running().await.unwrap());
        assert!(second.start().await.is_err());

        second.abort().await.unwrap();
        assert!(first.should_abort().await.unwrap());

        first.finish().await.unwrap();
        assert!(!second.is_running().await.unwrap());
        assert!(!second.should_abort().await.unwrap());
    }
}
