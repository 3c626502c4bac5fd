//! In-process key-value store.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_reconcile::{Clock, SystemClock};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{conflict, required_kind, wrong_type, KeyKind, KvOp, KvStore};
use crate::db::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, String>),
    List(VecDeque<String>),
}

impl Value {
    fn kind(&self) -> KeyKind {
        match self {
            Value::Set(_) => KeyKind::Set,
            Value::Hash(_) => KeyKind::Hash,
            Value::List(_) => KeyKind::List,
        }
    }

    fn empty(kind: KeyKind) -> Self {
        match kind {
            KeyKind::Set => Value::Set(BTreeSet::new()),
            KeyKind::Hash => Value::Hash(BTreeMap::new()),
            KeyKind::List => Value::List(VecDeque::new()),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Value::Set(s) => s.is_empty(),
            Value::Hash(h) => h.is_empty(),
            Value::List(l) => l.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// Key-value store held in process memory.
///
/// Time comes from an injected [`Clock`], so TTL expiry can be driven by a
/// `ManualClock` in tests.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            pushed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live entry for `key`, dropping it first if it has expired.
    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a mut Entry> {
        let expired = entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn try_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let Some(entry) = Self::live(&mut entries, key, now) else {
            return Ok(None);
        };
        let (popped, drained) = match &mut entry.value {
            Value::List(list) => (list.pop_back(), list.is_empty()),
            other => return Err(wrong_type(key, KeyKind::List, other.kind())),
        };
        if drained {
            entries.remove(key);
        }
        Ok(popped)
    }

    fn apply(entries: &mut HashMap<String, Entry>, op: KvOp, now: DateTime<Utc>) {
        if let Some(kind) = required_kind(&op) {
            if Self::live(entries, op.key(), now).is_none() {
                entries.insert(
                    op.key().to_string(),
                    Entry {
                        value: Value::empty(kind),
                        expires_at: None,
                    },
                );
            }
        }

        let key = op.key().to_string();
        match op {
            KvOp::Del { key } => {
                entries.remove(&key);
            }
            KvOp::HCheck { .. } => {}
            KvOp::Expire { key, ttl } => {
                if let Some(entry) = Self::live(entries, &key, now) {
                    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
                    entry.expires_at = now.checked_add_signed(ttl);
                }
            }
            op => {
                if let Some(entry) = entries.get_mut(&key) {
                    match (op, &mut entry.value) {
                        (KvOp::SAdd { members, .. }, Value::Set(set)) => set.extend(members),
                        (KvOp::SRem { members, .. }, Value::Set(set)) => {
                            for m in &members {
                                set.remove(m);
                            }
                        }
                        (KvOp::HSet { fields, .. }, Value::Hash(hash)) => hash.extend(fields),
                        (KvOp::HDel { fields, .. }, Value::Hash(hash)) => {
                            for f in &fields {
                                hash.remove(f);
                            }
                        }
                        (KvOp::LPush { value, .. }, Value::List(list)) => list.push_front(value),
                        // Kinds were validated before any op was applied.
                        _ => {}
                    }
                    if entry.value.is_empty() {
                        entries.remove(&key);
                    }
                }
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn transact(&self, ops: Vec<KvOp>) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock();

        for op in &ops {
            if let KvOp::HCheck {
                key,
                field,
                expected,
            } = op
            {
                let current = match Self::live(&mut entries, key, now).map(|e| &e.value) {
                    None => None,
                    Some(Value::Hash(hash)) => hash.get(field).cloned(),
                    Some(other) => return Err(wrong_type(key, KeyKind::Hash, other.kind())),
                };
                if current != *expected {
                    return Err(conflict(key, field));
                }
            }
        }

        // Validate the whole batch against the kinds it would observe.
        let mut kinds: HashMap<&str, Option<KeyKind>> = HashMap::new();
        for op in &ops {
            let key = op.key();
            let current = match kinds.get(key) {
                Some(kind) => *kind,
                None => Self::live(&mut entries, key, now).map(|e| e.value.kind()),
            };
            let next = match (op, required_kind(op)) {
                (KvOp::Del { .. }, _) => None,
                (_, None) => current,
                (_, Some(required)) => match current {
                    Some(actual) if actual != required => {
                        return Err(wrong_type(key, required, actual));
                    }
                    _ => Some(required),
                },
            };
            kinds.insert(key, next);
        }

        let pushed = ops.iter().any(|op| matches!(op, KvOp::LPush { .. }));
        for op in ops {
            Self::apply(&mut entries, op, now);
        }
        drop(entries);

        if pushed {
            self.pushed.notify_waiters();
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match Self::live(&mut entries, key, now).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(other) => Err(wrong_type(key, KeyKind::Set, other.kind())),
        }
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match Self::live(&mut entries, key, now).map(|e| &e.value) {
            None => Ok(false),
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(other) => Err(wrong_type(key, KeyKind::Set, other.kind())),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match Self::live(&mut entries, key, now).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone().into_iter().collect()),
            Some(other) => Err(wrong_type(key, KeyKind::Hash, other.kind())),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match Self::live(&mut entries, key, now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(other) => Err(wrong_type(key, KeyKind::Hash, other.kind())),
        }
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match Self::live(&mut entries, key, now).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(other) => Err(wrong_type(key, KeyKind::List, other.kind())),
        }
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(key)? {
                return Ok(Some(value));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at.is_none_or(|at| at > now));
        Ok((before - entries.len()) as u64)
    }
}
