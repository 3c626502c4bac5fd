//! Instance build records.
//!
//! Builds are never deleted. Their state only moves forward
//! (pending, started, finished); a request to move backwards is refused.
//! State changes are guarded on the state they were decided against, so two
//! writers racing on one build cannot undo each other.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_events::{BuildState, InstanceBuild};
use fleet_id::InstanceBuildId;

use tracing::debug;

use super::{KvOp, KvStore, StoreError};

const BUILDS_KEY: &str = "instance_builds";
const RECORD_FIELD: &str = "record";
const STATE_FIELD: &str = "state";

/// Re-reads allowed when a state change loses a race.
const UPDATE_ATTEMPTS: usize = 5;

fn build_key(id: &InstanceBuildId) -> String {
    format!("instance_build:{id}")
}

/// Outcome of a state change request.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildUpdate {
    /// State moved forward.
    Advanced(InstanceBuild),
    /// Already in the requested state.
    Unchanged(InstanceBuild),
    /// The request would move state backwards; nothing was written.
    Refused { current: BuildState },
}

/// Handle to instance build records.
#[derive(Clone)]
pub struct BuildStore {
    kv: Arc<dyn KvStore>,
}

impl BuildStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Writes a build record and registers its id.
    pub async fn save(&self, build: &InstanceBuild) -> Result<(), StoreError> {
        self.kv.transact(Self::save_ops(build)?).await
    }

    /// The writes [`save`](Self::save) performs, for callers batching them
    /// with other work.
    pub fn save_ops(build: &InstanceBuild) -> Result<Vec<KvOp>, StoreError> {
        let record = serde_json::to_string(build)?;
        Ok(vec![
            KvOp::sadd(BUILDS_KEY, build.id.to_string()),
            KvOp::hset(
                build_key(&build.id),
                vec![
                    (RECORD_FIELD.to_string(), record),
                    (STATE_FIELD.to_string(), build.state.to_string()),
                ],
            ),
        ])
    }

    /// One build by id.
    pub async fn get(&self, id: &InstanceBuildId) -> Result<Option<InstanceBuild>, StoreError> {
        let key = build_key(id);
        let Some(record) = self.kv.hget(&key, RECORD_FIELD).await? else {
            return Ok(None);
        };
        serde_json::from_str(&record)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key,
                reason: e.to_string(),
            })
    }

    /// Every build id ever recorded.
    pub async fn ids(&self) -> Result<Vec<String>, StoreError> {
        self.kv.smembers(BUILDS_KEY).await
    }

    /// Moves a build to `state` if that is not a step backwards. Returns
    /// `None` when the build does not exist.
    ///
    /// The write only lands if the stored state is still the one the
    /// decision was made against; otherwise the build is re-read and the
    /// decision made again.
    pub async fn update_state(
        &self,
        id: &InstanceBuildId,
        state: BuildState,
        now: DateTime<Utc>,
    ) -> Result<Option<BuildUpdate>, StoreError> {
        let key = build_key(id);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(mut build) = self.get(id).await? else {
                return Ok(None);
            };

            if build.state == state {
                return Ok(Some(BuildUpdate::Unchanged(build)));
            }
            if !build.state.can_advance_to(state) {
                return Ok(Some(BuildUpdate::Refused {
                    current: build.state,
                }));
            }

            let seen = build.state.to_string();
            build.state = state;
            build.updated_at = now;
            let mut ops = vec![KvOp::hcheck(key.as_str(), STATE_FIELD, Some(seen.as_str()))];
            ops.extend(Self::save_ops(&build)?);

            match self.kv.transact(ops).await {
                Ok(()) => return Ok(Some(BuildUpdate::Advanced(build))),
                Err(StoreError::Conflict { .. }) if attempt < UPDATE_ATTEMPTS => {
                    debug!(build_id = %id, attempt, "Build state changed underneath update, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv::testing::Interleaved;
    use crate::db::MemoryStore;
    use fleet_events::DEFAULT_INSTANCE_NAME_TEMPLATE;

    fn build() -> InstanceBuild {
        let now = Utc::now();
        InstanceBuild {
            id: InstanceBuildId::new(),
            site: "org".to_string(),
            env: "prod".to_string(),
            ami: String::new(),
            instance_type: "c5.large".to_string(),
            count: 1,
            queue: "docker".to_string(),
            role: "worker".to_string(),
            state: BuildState::Pending,
            slack_channel: String::new(),
            name_template: DEFAULT_INSTANCE_NAME_TEMPLATE.to_string(),
            boot_instance: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let store = BuildStore::new(Arc::new(MemoryStore::new()));
        let b = build();
        store.save(&b).await.unwrap();

        assert_eq!(store.get(&b.id).await.unwrap(), Some(b.clone()));
        assert_eq!(store.ids().await.unwrap(), vec![b.id.to_string()]);
        assert!(store.get(&InstanceBuildId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_never_moves_backward() {
        let store = BuildStore::new(Arc::new(MemoryStore::new()));
        let b = build();
        store.save(&b).await.unwrap();

        let update = store
            .update_state(&b.id, BuildState::Finished, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(update, BuildUpdate::Advanced(ref x) if x.state == BuildState::Finished));

        let refused = store
            .update_state(&b.id, BuildState::Started, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            refused,
            BuildUpdate::Refused {
                current: BuildState::Finished
            }
        );

        let again = store
            .update_state(&b.id, BuildState::Finished, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(again, BuildUpdate::Unchanged(_)));

        let stored = store.get(&b.id).await.unwrap().unwrap();
        assert_eq!(stored.state, BuildState::Finished);
    }

    #[tokio::test]
    async fn test_update_missing_build() {
        let store = BuildStore::new(Arc::new(MemoryStore::new()));
        let result = store
            .update_state(&InstanceBuildId::new(), BuildState::Started, Utc::now())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_racing_update_cannot_move_state_backward() {
        let kv = Arc::new(Interleaved::new());
        let store = BuildStore::new(kv.clone());
        let b = build();
        store.save(&b).await.unwrap();

        // Another writer finishes the build between our read and our write.
        let mut finished = b.clone();
        finished.state = BuildState::Finished;
        kv.race(BuildStore::save_ops(&finished).unwrap());

        let update = store
            .update_state(&b.id, BuildState::Started, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            update,
            BuildUpdate::Refused {
                current: BuildState::Finished
            }
        );
        assert_eq!(
            store.get(&b.id).await.unwrap().unwrap().state,
            BuildState::Finished
        );
    }

    #[tokio::test]
    async fn test_concurrent_updates_settle_forward() {
        let store = BuildStore::new(Arc::new(MemoryStore::new()));
        let b = build();
        store.save(&b).await.unwrap();

        let (started, finished) = tokio::join!(
            store.update_state(&b.id, BuildState::Started, Utc::now()),
            store.update_state(&b.id, BuildState::Finished, Utc::now()),
        );
        started.unwrap().unwrap();
        finished.unwrap().unwrap();

        assert_eq!(
            store.get(&b.id).await.unwrap().unwrap().state,
            BuildState::Finished
        );
    }
}
