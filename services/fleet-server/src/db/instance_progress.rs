//! Instance build progress.
//!
//! `instance_build_progress:<build id>` holds what a build job has already
//! done: the security group it created, the bootstrap secret it minted, the
//! instances it launched and whether the operator was told. A redelivered
//! build reuses each of these instead of repeating the provider call. The
//! record expires a week after its last write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_id::InstanceBuildId;

use super::{KvOp, KvStore, StoreError};

const PROGRESS_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const SECURITY_GROUP_FIELD: &str = "security_group";
const SECRET_FIELD: &str = "secret";
const LAUNCHED_FIELD: &str = "launched";
const NOTIFIED_FIELD: &str = "notified";

fn progress_key(id: &InstanceBuildId) -> String {
    format!("instance_build_progress:{id}")
}

/// Steps a build job has already completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceBuildProgress {
    pub security_group: Option<String>,
    pub secret: Option<String>,
    pub launched: Option<Vec<String>>,
    pub notified: bool,
}

impl InstanceBuildProgress {
    fn from_fields(mut fields: HashMap<String, String>) -> Self {
        Self {
            security_group: fields.remove(SECURITY_GROUP_FIELD),
            secret: fields.remove(SECRET_FIELD),
            launched: fields.remove(LAUNCHED_FIELD).map(|ids| {
                ids.split(',')
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            }),
            notified: fields.contains_key(NOTIFIED_FIELD),
        }
    }
}

/// Handle to instance build progress records.
#[derive(Clone)]
pub struct InstanceProgressStore {
    kv: Arc<dyn KvStore>,
}

impl InstanceProgressStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn load(&self, id: &InstanceBuildId) -> Result<InstanceBuildProgress, StoreError> {
        let fields = self.kv.hgetall(&progress_key(id)).await?;
        Ok(InstanceBuildProgress::from_fields(fields))
    }

    async fn record(&self, id: &InstanceBuildId, field: &str, value: String) -> Result<(), StoreError> {
        let key = progress_key(id);
        self.kv
            .transact(vec![
                KvOp::hset(key.as_str(), vec![(field.to_string(), value)]),
                KvOp::expire(key, PROGRESS_TTL),
            ])
            .await
    }

    pub async fn record_security_group(
        &self,
        id: &InstanceBuildId,
        group_id: &str,
    ) -> Result<(), StoreError> {
        self.record(id, SECURITY_GROUP_FIELD, group_id.to_string()).await
    }

    pub async fn record_secret(&self, id: &InstanceBuildId, secret: &str) -> Result<(), StoreError> {
        self.record(id, SECRET_FIELD, secret.to_string()).await
    }

    pub async fn record_launched(
        &self,
        id: &InstanceBuildId,
        instance_ids: &[String],
    ) -> Result<(), StoreError> {
        self.record(id, LAUNCHED_FIELD, instance_ids.join(",")).await
    }

    pub async fn record_notified(&self, id: &InstanceBuildId) -> Result<(), StoreError> {
        self.record(id, NOTIFIED_FIELD, "1".to_string()).await
    }
}
