//! Autoscaling lifecycle transitions.
//!
//! Notifications arrive asynchronously, possibly duplicated or out of order.
//! [`LifecycleIngest`] records the hook details and enqueues a transition
//! job; [`LifecycleReconciler`] later completes the stored hook against the
//! provider and wipes the record.
//!
//! Per `(transition, instance)` the record is either pending, completed
//! (hook released, record wiped) or discarded (no record found, nothing to
//! do). Completing twice is impossible because the first completion wipes
//! the record.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_events::{
    AutoscalingLifecycleAction, InstanceLifecycleTransition, RawEnvelope, Transition,
};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::db::{FleetCache, LifecycleStore, QueueStore, StoreError};
use crate::provider::{CloudProvider, CompleteLifecycleActionRequest, LIFECYCLE_CONTINUE};
use crate::workers::{HandlerError, JobHandler};

/// Event name the provider uses for its connectivity test message.
pub const TEST_NOTIFICATION_EVENT: &str = "autoscaling:TEST_NOTIFICATION";

/// Expected-state hint written when an instance starts terminating.
pub const EXPECTED_STATE_DOWN: &str = "down";

/// Provider lifecycle notification body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LifecycleNotification {
    #[serde(rename = "Event", default)]
    pub event: String,
    #[serde(rename = "LifecycleTransition", default)]
    pub transition: String,
    #[serde(rename = "EC2InstanceId", default)]
    pub instance_id: String,
    #[serde(rename = "AutoScalingGroupName", default)]
    pub asg_name: String,
    #[serde(rename = "LifecycleHookName", default)]
    pub hook_name: String,
    #[serde(rename = "LifecycleActionToken", default)]
    pub action_token: String,
}

/// What ingest did with a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Enqueued(InstanceLifecycleTransition),
    Ignored(String),
}

/// Turns lifecycle notifications into stored actions and transition jobs.
#[derive(Clone)]
pub struct LifecycleIngest {
    cache: FleetCache,
    queue: QueueStore,
}

impl LifecycleIngest {
    pub fn new(cache: FleetCache, queue: QueueStore) -> Self {
        Self { cache, queue }
    }

    pub async fn ingest(
        &self,
        notification: &LifecycleNotification,
    ) -> Result<IngestOutcome, StoreError> {
        if notification.event == TEST_NOTIFICATION_EVENT {
            debug!("Ignoring test notification");
            return Ok(IngestOutcome::Ignored("test notification".to_string()));
        }

        let transition = match Transition::from_provider_name(&notification.transition) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "Ignoring lifecycle notification");
                return Ok(IngestOutcome::Ignored(e.to_string()));
            }
        };

        if notification.instance_id.is_empty() {
            warn!(%transition, "Ignoring lifecycle notification without instance id");
            return Ok(IngestOutcome::Ignored("missing instance id".to_string()));
        }
        let instance_id = notification.instance_id.as_str();

        match transition {
            Transition::Launching => {
                self.cache.clear_instance_expected_state(instance_id).await?;
            }
            Transition::Terminating => {
                self.cache
                    .set_instance_expected_state(instance_id, EXPECTED_STATE_DOWN)
                    .await?;
            }
        }

        let action = AutoscalingLifecycleAction {
            transition,
            instance_id: instance_id.to_string(),
            asg_name: notification.asg_name.clone(),
            lifecycle_hook_name: notification.hook_name.clone(),
            lifecycle_action_token: notification.action_token.clone(),
        };
        let job = InstanceLifecycleTransition {
            instance_id: instance_id.to_string(),
            transition,
        };
        // The record and its job land together or not at all.
        self.queue
            .push_with(job.clone(), LifecycleStore::store_ops(&action))
            .await?;

        info!(instance_id, %transition, "Lifecycle action recorded");
        Ok(IngestOutcome::Enqueued(job))
    }
}

/// Transition job argument, read loosely so an unknown transition name is
/// discarded instead of failing decode forever.
#[derive(Debug, Deserialize)]
struct TransitionArg {
    instance_id: String,
    transition: String,
}

/// Completes stored lifecycle actions against the provider.
pub struct LifecycleReconciler {
    actions: LifecycleStore,
    provider: Arc<dyn CloudProvider>,
}

impl LifecycleReconciler {
    pub fn new(actions: LifecycleStore, provider: Arc<dyn CloudProvider>) -> Self {
        Self { actions, provider }
    }

    /// Releases the hook for one `(transition, instance)` pair.
    #[instrument(skip(self))]
    pub async fn reconcile(
        &self,
        transition: Transition,
        instance_id: &str,
    ) -> Result<(), HandlerError> {
        let Some(action) = self.actions.fetch(transition, instance_id).await? else {
            warn!("No stored lifecycle action, discarding");
            return Ok(());
        };

        let request = CompleteLifecycleActionRequest {
            group_name: action.asg_name,
            hook_name: action.lifecycle_hook_name,
            action_token: action.lifecycle_action_token,
            instance_id: instance_id.to_string(),
            result: LIFECYCLE_CONTINUE.to_string(),
        };

        match self.provider.complete_lifecycle_action(&request).await {
            Ok(()) => info!(group = %request.group_name, "Lifecycle action completed"),
            Err(e) if e.is_domain() => {
                warn!(error = %e, "Lifecycle action already resolved, dropping stale record");
            }
            Err(e) => return Err(e.into()),
        }

        self.actions.wipe(transition, instance_id).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for LifecycleReconciler {
    async fn handle(&self, envelope: &RawEnvelope) -> Result<(), HandlerError> {
        let arg: TransitionArg = envelope.decode_arg()?;
        let transition = match arg.transition.parse::<Transition>() {
            Ok(t) => t,
            Err(e) => {
                warn!(
                    instance_id = %arg.instance_id,
                    error = %e,
                    "Unknown lifecycle transition, discarding"
                );
                return Ok(());
            }
        };
        self.reconcile(transition, &arg.instance_id).await
    }
}
