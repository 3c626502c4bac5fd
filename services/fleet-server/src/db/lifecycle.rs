//! Lifecycle action store.
//!
//! One record per `(transition, instance_id)` describing an in-flight
//! autoscaling hook: `lifecycle_actions:<transition>` tracks which instances
//! have one, `lifecycle_action:<transition>:<instance_id>` holds the hook
//! details needed to complete it. A second notification for the same pair
//! overwrites the first.

use std::sync::Arc;

use fleet_events::{AutoscalingLifecycleAction, Transition};

use super::{KvOp, KvStore, StoreError};

fn set_key(transition: Transition) -> String {
    format!("lifecycle_actions:{transition}")
}

fn record_key(transition: Transition, instance_id: &str) -> String {
    format!("lifecycle_action:{transition}:{instance_id}")
}

/// Handle to the lifecycle action store.
#[derive(Clone)]
pub struct LifecycleStore {
    kv: Arc<dyn KvStore>,
}

impl LifecycleStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Records an action, replacing any previous one for the same instance
    /// and transition.
    pub async fn store(&self, action: &AutoscalingLifecycleAction) -> Result<(), StoreError> {
        self.kv.transact(Self::store_ops(action)).await
    }

    /// The writes [`store`](Self::store) performs.
    pub fn store_ops(action: &AutoscalingLifecycleAction) -> Vec<KvOp> {
        let fields = vec![
            ("transition".to_string(), action.transition.to_string()),
            ("instance_id".to_string(), action.instance_id.clone()),
            ("asg_name".to_string(), action.asg_name.clone()),
            (
                "lifecycle_hook_name".to_string(),
                action.lifecycle_hook_name.clone(),
            ),
            (
                "lifecycle_action_token".to_string(),
                action.lifecycle_action_token.clone(),
            ),
        ];
        vec![
            KvOp::sadd(set_key(action.transition), &action.instance_id),
            KvOp::hset(record_key(action.transition, &action.instance_id), fields),
        ]
    }

    /// The stored action, or `None` when the instance has no record.
    pub async fn fetch(
        &self,
        transition: Transition,
        instance_id: &str,
    ) -> Result<Option<AutoscalingLifecycleAction>, StoreError> {
        if !self.kv.sismember(&set_key(transition), instance_id).await? {
            return Ok(None);
        }

        let key = record_key(transition, instance_id);
        let fields = self.kv.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let get = |name: &str| fields.get(name).cloned().unwrap_or_default();
        Ok(Some(AutoscalingLifecycleAction {
            transition,
            instance_id: instance_id.to_string(),
            asg_name: get("asg_name"),
            lifecycle_hook_name: get("lifecycle_hook_name"),
            lifecycle_action_token: get("lifecycle_action_token"),
        }))
    }

    /// Removes the record. Wiping an absent record is fine.
    pub async fn wipe(&self, transition: Transition, instance_id: &str) -> Result<(), StoreError> {
        self.kv
            .transact(vec![
                KvOp::srem(set_key(transition), instance_id),
                KvOp::del(record_key(transition, instance_id)),
            ])
            .await
    }

    /// Instances with a pending action for `transition`.
    pub async fn pending(&self, transition: Transition) -> Result<Vec<String>, StoreError> {
        self.kv.smembers(&set_key(transition)).await
    }
}
