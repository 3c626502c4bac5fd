//! Autoscaling group build progress.
//!
//! Each completed provisioning step records its output (a name or ARN) in
//! `asg_build_progress:<build id>`, so a redelivered build job skips what
//! already exists and resumes at the first incomplete step.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_id::AutoscalingGroupBuildId;

use super::{KvOp, KvStore, StoreError};

fn progress_key(id: &AutoscalingGroupBuildId) -> String {
    format!("asg_build_progress:{id}")
}

/// Provisioning steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AsgBuildStep {
    CreateGroup,
    ScaleOutPolicy,
    ScaleInPolicy,
    ScaleOutAlarm,
    ScaleInAlarm,
    LaunchingHook,
    TerminatingHook,
}

impl AsgBuildStep {
    pub const ALL: [AsgBuildStep; 7] = [
        AsgBuildStep::CreateGroup,
        AsgBuildStep::ScaleOutPolicy,
        AsgBuildStep::ScaleInPolicy,
        AsgBuildStep::ScaleOutAlarm,
        AsgBuildStep::ScaleInAlarm,
        AsgBuildStep::LaunchingHook,
        AsgBuildStep::TerminatingHook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AsgBuildStep::CreateGroup => "create_group",
            AsgBuildStep::ScaleOutPolicy => "scale_out_policy",
            AsgBuildStep::ScaleInPolicy => "scale_in_policy",
            AsgBuildStep::ScaleOutAlarm => "scale_out_alarm",
            AsgBuildStep::ScaleInAlarm => "scale_in_alarm",
            AsgBuildStep::LaunchingHook => "launching_hook",
            AsgBuildStep::TerminatingHook => "terminating_hook",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|step| step.as_str() == s)
    }
}

impl std::fmt::Display for AsgBuildStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to autoscaling build progress records.
#[derive(Clone)]
pub struct AsgProgressStore {
    kv: Arc<dyn KvStore>,
}

impl AsgProgressStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Steps already completed for a build, with their outputs.
    pub async fn completed(
        &self,
        id: &AutoscalingGroupBuildId,
    ) -> Result<BTreeMap<AsgBuildStep, String>, StoreError> {
        let fields = self.kv.hgetall(&progress_key(id)).await?;
        Ok(fields
            .into_iter()
            .filter_map(|(step, output)| AsgBuildStep::parse(&step).map(|s| (s, output)))
            .collect())
    }

    /// Marks a step complete.
    pub async fn record(
        &self,
        id: &AutoscalingGroupBuildId,
        step: AsgBuildStep,
        output: &str,
    ) -> Result<(), StoreError> {
        self.kv
            .transact(vec![KvOp::hset(
                progress_key(id),
                vec![(step.as_str().to_string(), output.to_string())],
            )])
            .await
    }

    /// Forgets a build's progress once it has fully completed.
    pub async fn clear(&self, id: &AutoscalingGroupBuildId) -> Result<(), StoreError> {
        self.kv.transact(vec![KvOp::del(progress_key(id))]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    #[tokio::test]
    async fn test_record_and_clear() {
        let store = AsgProgressStore::new(Arc::new(MemoryStore::new()));
        let id = AutoscalingGroupBuildId::new();

        store
            .record(&id, AsgBuildStep::CreateGroup, "workers-org")
            .await
            .unwrap();
        store
            .record(&id, AsgBuildStep::ScaleOutPolicy, "arn:policy/out")
            .await
            .unwrap();

        let done = store.completed(&id).await.unwrap();
        assert_eq!(done.len(), 2);
        assert_eq!(done[&AsgBuildStep::CreateGroup], "workers-org");

        store.clear(&id).await.unwrap();
        assert!(store.completed(&id).await.unwrap().is_empty());
    }

    #[test]
    fn test_steps_roundtrip_names() {
        for step in AsgBuildStep::ALL {
            assert_eq!(AsgBuildStep::parse(step.as_str()), Some(step));
        }
    }
}
