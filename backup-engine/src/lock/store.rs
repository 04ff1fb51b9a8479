//! Shared key/value store contract behind the operation lock.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::utils::EngineError;

#[derive(Error, Debug)]
#[error("lock store unavailable: {0}")]
pub struct LockStoreError(pub String);

impl From<LockStoreError> for EngineError {
    fn from(err: LockStoreError) -> Self {
        EngineError::LockStoreUnavailable(err.0)
    }
}

pub type StoreResult<T> = std::result::Result<T, LockStoreError>;

/// Key/value store reachable by every worker process of a site.
///
/// `set_if_absent` and `delete_if_eq` must be atomic; they are the only
/// operations the lock relies on for mutual exclusion.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Store `value` unless a live entry exists. Returns true when stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> StoreResult<bool>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Re-arm the TTL of a live entry. Returns false when the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Delete the entry only while it still holds `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool>;
}
