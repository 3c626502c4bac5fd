//! Queue job handlers.
//!
//! One handler per queue in [`fleet_events::KNOWN_QUEUES`]; the lifecycle
//! transition handler lives with the reconciler in [`crate::reconcile`].

mod autoscaling;
mod instances;
mod sns;

use std::sync::Arc;

use fleet_events::{
    AutoscalingGroupBuild, InstanceBuild, InstanceLifecycleTransition, InstanceTermination, Job,
    SnsSubscriptionConfirmation,
};

use crate::db::Database;
use crate::notify::Notifier;
use crate::provider::CloudProvider;
use crate::reconcile::LifecycleReconciler;
use crate::workers::{HandlerError, JobRegistry};

pub use autoscaling::{group_name, AutoscalingGroupBuilder};
pub use instances::{
    instance_name, BootstrapRenderer, InstanceBuilder, InstanceTerminator,
    DEFAULT_INIT_SCRIPT_TEMPLATE,
};
pub use sns::SnsConfirmer;

/// Binds every known queue to its handler.
pub fn build_registry(
    db: &Database,
    provider: Arc<dyn CloudProvider>,
    notifier: Arc<dyn Notifier>,
    renderer: BootstrapRenderer,
) -> Result<JobRegistry, HandlerError> {
    Ok(JobRegistry::new()
        .with(
            InstanceBuild::QUEUE,
            Arc::new(InstanceBuilder::new(
                provider.clone(),
                db.fleet_cache(),
                db.bootstrap(),
                db.instance_progress(),
                notifier.clone(),
                renderer,
            )),
        )
        .with(
            InstanceTermination::QUEUE,
            Arc::new(InstanceTerminator::new(
                provider.clone(),
                db.fleet_cache(),
                notifier.clone(),
            )),
        )
        .with(
            InstanceLifecycleTransition::QUEUE,
            Arc::new(LifecycleReconciler::new(
                db.lifecycle_actions(),
                provider.clone(),
            )),
        )
        .with(
            AutoscalingGroupBuild::QUEUE,
            Arc::new(AutoscalingGroupBuilder::new(
                provider,
                db.asg_progress(),
                notifier,
            )),
        )
        .with(SnsSubscriptionConfirmation::QUEUE, Arc::new(SnsConfirmer::new()?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NullNotifier;
    use crate::provider::FakeProvider;
    use fleet_events::KNOWN_QUEUES;

    #[test]
    fn test_registry_covers_known_queues() {
        let registry = build_registry(
            &Database::in_memory(),
            Arc::new(FakeProvider::new()),
            Arc::new(NullNotifier),
            BootstrapRenderer::new("http://localhost", DEFAULT_INIT_SCRIPT_TEMPLATE),
        )
        .unwrap();

        let mut queues: Vec<&str> = registry.queues().collect();
        queues.sort_unstable();
        let mut known = KNOWN_QUEUES.to_vec();
        known.sort_unstable();
        assert_eq!(queues, known);
    }
}
