//! Store wrappers for exercising write races.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{KvOp, KvStore, MemoryStore};
use crate::db::StoreError;

/// A [`MemoryStore`] that lands a queued batch, as if written by another
/// replica, just before the next transaction.
#[derive(Default)]
pub struct Interleaved {
    inner: MemoryStore,
    pending: Mutex<Option<Vec<KvOp>>>,
}

impl Interleaved {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `ops` to land ahead of the next transaction.
    pub fn race(&self, ops: Vec<KvOp>) {
        *self.pending.lock().unwrap() = Some(ops);
    }
}

#[async_trait]
impl KvStore for Interleaved {
    async fn transact(&self, ops: Vec<KvOp>) -> Result<(), StoreError> {
        let racing = self.pending.lock().unwrap().take();
        if let Some(racing) = racing {
            self.inner.transact(racing).await?;
        }
        self.inner.transact(ops).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.smembers(key).await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.sismember(key, member).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.inner.hgetall(key).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.inner.hget(key, field).await
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        self.inner.llen(key).await
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        self.inner.brpop(key, timeout).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.inner.purge_expired().await
    }
}
