//! Shared key-value store.
//!
//! Every piece of coordination state lives behind [`KvStore`]: queue lists,
//! fleet cache sets and hashes, lifecycle action records, bootstrap secrets.
//! The model is deliberately small (sets, hashes, lists, per-key TTL) and
//! every multi-key write goes through [`KvStore::transact`], which applies a
//! batch all-or-nothing. Readers never see half of a batch.
//!
//! Two backends exist:
//! - [`MemoryStore`]: single-process, clock-injectable, used in dev mode and tests
//! - [`PgStore`]: Postgres-backed, shared between fleetd replicas

mod memory;
mod postgres;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use super::StoreError;

/// A single write inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    /// Remove a key of any kind.
    Del { key: String },
    /// Add members to a set.
    SAdd { key: String, members: Vec<String> },
    /// Remove members from a set. Empty sets disappear.
    SRem { key: String, members: Vec<String> },
    /// Write hash fields, keeping fields not mentioned.
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Remove hash fields. Empty hashes disappear.
    HDel { key: String, fields: Vec<String> },
    /// Push onto the head of a list.
    LPush { key: String, value: String },
    /// Set a key's time to live. No-op when the key does not exist.
    Expire { key: String, ttl: Duration },
    /// Abort the batch with [`StoreError::Conflict`] unless a hash field
    /// holds `expected` (`None`: the field is absent). Checks see the store
    /// as it was before the batch, wherever they sit in it.
    HCheck {
        key: String,
        field: String,
        expected: Option<String>,
    },
}

impl KvOp {
    pub fn del(key: impl Into<String>) -> Self {
        KvOp::Del { key: key.into() }
    }

    pub fn sadd(key: impl Into<String>, member: impl Into<String>) -> Self {
        KvOp::SAdd {
            key: key.into(),
            members: vec![member.into()],
        }
    }

    pub fn srem(key: impl Into<String>, member: impl Into<String>) -> Self {
        KvOp::SRem {
            key: key.into(),
            members: vec![member.into()],
        }
    }

    pub fn hset(key: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        KvOp::HSet {
            key: key.into(),
            fields,
        }
    }

    pub fn hdel(key: impl Into<String>, field: impl Into<String>) -> Self {
        KvOp::HDel {
            key: key.into(),
            fields: vec![field.into()],
        }
    }

    pub fn lpush(key: impl Into<String>, value: impl Into<String>) -> Self {
        KvOp::LPush {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn expire(key: impl Into<String>, ttl: Duration) -> Self {
        KvOp::Expire {
            key: key.into(),
            ttl,
        }
    }

    pub fn hcheck(
        key: impl Into<String>,
        field: impl Into<String>,
        expected: Option<&str>,
    ) -> Self {
        KvOp::HCheck {
            key: key.into(),
            field: field.into(),
            expected: expected.map(str::to_string),
        }
    }

    /// Key this operation touches.
    pub fn key(&self) -> &str {
        match self {
            KvOp::Del { key }
            | KvOp::SAdd { key, .. }
            | KvOp::SRem { key, .. }
            | KvOp::HSet { key, .. }
            | KvOp::HDel { key, .. }
            | KvOp::LPush { key, .. }
            | KvOp::Expire { key, .. }
            | KvOp::HCheck { key, .. } => key,
        }
    }
}

/// Kind of value stored under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Set,
    Hash,
    List,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Set => "set",
            KeyKind::Hash => "hash",
            KeyKind::List => "list",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "set" => Some(KeyKind::Set),
            "hash" => Some(KeyKind::Hash),
            "list" => Some(KeyKind::List),
            _ => None,
        }
    }
}

/// Kind a write op requires its key to hold, if any.
pub(crate) fn required_kind(op: &KvOp) -> Option<KeyKind> {
    match op {
        KvOp::SAdd { .. } | KvOp::SRem { .. } => Some(KeyKind::Set),
        KvOp::HSet { .. } | KvOp::HDel { .. } => Some(KeyKind::Hash),
        KvOp::LPush { .. } => Some(KeyKind::List),
        KvOp::Del { .. } | KvOp::Expire { .. } | KvOp::HCheck { .. } => None,
    }
}

pub(crate) fn conflict(key: &str, field: &str) -> StoreError {
    StoreError::Conflict {
        key: key.to_string(),
        field: field.to_string(),
    }
}

pub(crate) fn wrong_type(key: &str, expected: KeyKind, actual: KeyKind) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected: expected.as_str(),
        actual: actual.as_str().to_string(),
    }
}

/// The shared key-value store contract.
///
/// Expired keys behave exactly like absent keys for every operation.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Applies all ops atomically, in order. On error nothing is applied.
    /// [`KvOp::HCheck`] guards are evaluated before any write.
    async fn transact(&self, ops: Vec<KvOp>) -> Result<(), StoreError>;

    /// Members of a set; empty when absent.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Whether `member` belongs to the set at `key`.
    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// All fields of a hash; empty when absent.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// One hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Length of a list; zero when absent.
    async fn llen(&self, key: &str) -> Result<usize, StoreError>;

    /// Pops from the tail of a list, waiting up to `timeout` for an element.
    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Drops keys whose TTL has passed. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}
