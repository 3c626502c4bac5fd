//! Fleet cache: provider instances and images mirrored into the store.
//!
//! Each snapshot is a membership set (`instances` / `images`) plus one
//! attribute hash per entity (`instance:<id>` / `image:<id>`). A refresh
//! replaces the whole snapshot and sets one expiry on the set and every hash
//! in a single transaction, so readers see either the old or the new fleet.
//! When refreshes stop the snapshot ages out instead of going stale forever.
//!
//! Refreshes are guarded by a generation token in `<set>:snapshot`: a
//! refresh that read the membership before another refresh landed is
//! retried against the new membership. Reads only see hashes whose id is in
//! the membership set, so an attribute hash orphaned by a refresh racing an
//! expiry stays invisible until its own TTL removes it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use fleet_events::{Image, Instance};
use tracing::debug;

use super::{KvOp, KvStore, StoreError};

/// Lookup filter: field name to exact value.
pub type Filter = BTreeMap<String, String>;

/// Hash field holding the local expected-state hint.
const EXPECTED_STATE_FIELD: &str = "expected_state";

const GENERATION_FIELD: &str = "generation";

/// Attempts a refresh gets when other refreshes keep landing first.
const REPLACE_ATTEMPTS: usize = 5;

/// A record type held in the fleet cache.
trait Cached: Sized {
    const SET_KEY: &'static str;
    const PREFIX: &'static str;
    /// Filter keys that select a single entity by id.
    const ID_KEYS: &'static [&'static str];

    fn id(&self) -> &str;
    fn to_fields(&self) -> Vec<(String, String)>;
    fn from_fields(fields: &HashMap<String, String>) -> Self;

    fn hash_key(id: &str) -> String {
        format!("{}:{}", Self::PREFIX, id)
    }

    fn snapshot_key() -> String {
        format!("{}:snapshot", Self::SET_KEY)
    }
}

fn field(fields: &HashMap<String, String>, name: &str) -> String {
    fields.get(name).cloned().unwrap_or_default()
}

fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Cached for Instance {
    const SET_KEY: &'static str = "instances";
    const PREFIX: &'static str = "instance";
    const ID_KEYS: &'static [&'static str] = &["instance_id", "id"];

    fn id(&self) -> &str {
        &self.id
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = pairs(&[
            ("id", self.id.as_str()),
            ("instance_id", self.id.as_str()),
            ("instance_type", self.instance_type.as_str()),
            ("image_id", self.image_id.as_str()),
            ("public_ip", self.public_ip.as_str()),
            ("private_ip", self.private_ip.as_str()),
            ("launch_time", self.launch_time.as_str()),
            ("queue", self.queue.as_str()),
            ("env", self.env.as_str()),
            ("site", self.site.as_str()),
            ("role", self.role.as_str()),
            ("name", self.name.as_str()),
        ]);
        // The provider never reports this hint; keep whatever was written locally.
        if !self.expected_state.is_empty() {
            fields.push((EXPECTED_STATE_FIELD.to_string(), self.expected_state.clone()));
        }
        fields
    }

    fn from_fields(fields: &HashMap<String, String>) -> Self {
        Instance {
            id: field(fields, "id"),
            instance_type: field(fields, "instance_type"),
            image_id: field(fields, "image_id"),
            public_ip: field(fields, "public_ip"),
            private_ip: field(fields, "private_ip"),
            launch_time: field(fields, "launch_time"),
            queue: field(fields, "queue"),
            env: field(fields, "env"),
            site: field(fields, "site"),
            role: field(fields, "role"),
            name: field(fields, "name"),
            expected_state: field(fields, EXPECTED_STATE_FIELD),
        }
    }
}

impl Cached for Image {
    const SET_KEY: &'static str = "images";
    const PREFIX: &'static str = "image";
    const ID_KEYS: &'static [&'static str] = &["image_id", "id"];

    fn id(&self) -> &str {
        &self.id
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("id".to_string(), self.id.clone()),
            ("image_id".to_string(), self.id.clone()),
            ("role".to_string(), self.role.clone()),
            ("active".to_string(), self.active.to_string()),
            ("name".to_string(), self.name.clone()),
            ("state".to_string(), self.state.clone()),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Self {
        Image {
            id: field(fields, "id"),
            role: field(fields, "role"),
            active: fields.get("active").is_some_and(|v| v == "true"),
            name: field(fields, "name"),
            state: field(fields, "state"),
        }
    }
}

/// Handle to the fleet cache.
#[derive(Clone)]
pub struct FleetCache {
    kv: Arc<dyn KvStore>,
}

impl FleetCache {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Replaces the cached instance snapshot.
    pub async fn store_instances(
        &self,
        instances: &[Instance],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.replace(instances, ttl).await
    }

    /// Replaces the cached image snapshot.
    pub async fn store_images(&self, images: &[Image], ttl: Duration) -> Result<(), StoreError> {
        self.replace(images, ttl).await
    }

    /// Cached instances matching every filter entry.
    pub async fn fetch_instances(&self, filter: &Filter) -> Result<Vec<Instance>, StoreError> {
        self.fetch(filter).await
    }

    /// Cached images matching every filter entry.
    pub async fn fetch_images(&self, filter: &Filter) -> Result<Vec<Image>, StoreError> {
        self.fetch(filter).await
    }

    /// One cached instance by id.
    pub async fn get_instance(&self, id: &str) -> Result<Option<Instance>, StoreError> {
        Ok(self
            .load::<Instance>(id)
            .await?
            .map(|fields| Instance::from_fields(&fields)))
    }

    /// Records a local state hint on a cached instance. Returns `false` when
    /// the instance is not in the current snapshot.
    pub async fn set_instance_expected_state(
        &self,
        id: &str,
        state: &str,
    ) -> Result<bool, StoreError> {
        if !self.kv.sismember(Instance::SET_KEY, id).await? {
            debug!(instance_id = %id, state, "Instance not cached, skipping expected state");
            return Ok(false);
        }
        self.kv
            .transact(vec![KvOp::hset(
                Instance::hash_key(id),
                vec![(EXPECTED_STATE_FIELD.to_string(), state.to_string())],
            )])
            .await?;
        Ok(true)
    }

    /// Clears the local state hint on a cached instance.
    pub async fn clear_instance_expected_state(&self, id: &str) -> Result<(), StoreError> {
        if !self.kv.sismember(Instance::SET_KEY, id).await? {
            return Ok(());
        }
        self.kv
            .transact(vec![KvOp::hdel(Instance::hash_key(id), EXPECTED_STATE_FIELD)])
            .await
    }

    /// Drops an instance from the snapshot, membership and attributes together.
    pub async fn remove_instance(&self, id: &str) -> Result<(), StoreError> {
        self.kv
            .transact(vec![
                KvOp::srem(Instance::SET_KEY, id),
                KvOp::del(Instance::hash_key(id)),
            ])
            .await
    }

    async fn replace<T: Cached>(&self, entities: &[T], ttl: Duration) -> Result<(), StoreError> {
        let snapshot = T::snapshot_key();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let generation = self.kv.hget(&snapshot, GENERATION_FIELD).await?;
            let previous = self.kv.smembers(T::SET_KEY).await?;

            let mut ops = Self::replace_ops(entities, &previous, ttl);
            ops.insert(
                0,
                KvOp::hcheck(snapshot.as_str(), GENERATION_FIELD, generation.as_deref()),
            );
            ops.push(KvOp::hset(
                snapshot.as_str(),
                vec![(
                    GENERATION_FIELD.to_string(),
                    format!("{:016x}", rand::random::<u64>()),
                )],
            ));
            ops.push(KvOp::expire(snapshot.as_str(), ttl));

            match self.kv.transact(ops).await {
                Ok(()) => break,
                Err(StoreError::Conflict { .. }) if attempt < REPLACE_ATTEMPTS => {
                    debug!(kind = T::SET_KEY, attempt, "Snapshot changed during refresh, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(kind = T::SET_KEY, count = entities.len(), "Replaced cache snapshot");
        Ok(())
    }

    fn replace_ops<T: Cached>(entities: &[T], previous: &[String], ttl: Duration) -> Vec<KvOp> {
        let fresh: HashSet<&str> = entities.iter().map(Cached::id).collect();

        let mut ops = vec![KvOp::del(T::SET_KEY)];
        for stale in previous.iter().filter(|id| !fresh.contains(id.as_str())) {
            ops.push(KvOp::del(T::hash_key(stale)));
        }
        for entity in entities {
            ops.push(KvOp::sadd(T::SET_KEY, entity.id()));
            ops.push(KvOp::hset(T::hash_key(entity.id()), entity.to_fields()));
        }
        for entity in entities {
            ops.push(KvOp::expire(T::hash_key(entity.id()), ttl));
        }
        ops.push(KvOp::expire(T::SET_KEY, ttl));
        ops
    }

    /// Attributes of a current snapshot member.
    async fn load<T: Cached>(&self, id: &str) -> Result<Option<HashMap<String, String>>, StoreError> {
        if !self.kv.sismember(T::SET_KEY, id).await? {
            return Ok(None);
        }
        let fields = self.kv.hgetall(&T::hash_key(id)).await?;
        Ok((!fields.is_empty()).then_some(fields))
    }

    /// Every filter entry must equal the stored field. Id keys are stored as
    /// fields too, so a filter naming two different ids matches nothing.
    async fn fetch<T: Cached>(&self, filter: &Filter) -> Result<Vec<T>, StoreError> {
        let id = T::ID_KEYS.iter().find_map(|k| filter.get(*k));
        let ids = match id {
            Some(id) => vec![id.clone()],
            None => self.kv.smembers(T::SET_KEY).await?,
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(fields) = self.load::<T>(&id).await? else {
                continue;
            };
            if filter.iter().all(|(k, v)| fields.get(k) == Some(v)) {
                out.push(T::from_fields(&fields));
            }
        }
        out.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(out)
    }
}
