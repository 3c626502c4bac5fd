//! Autoscaling group provisioning.
//!
//! A build runs seven provider steps in order. Each step's output is
//! recorded as soon as it succeeds, so a redelivered job picks up at the
//! first step without a record. Nothing is torn down on failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_events::{AutoscalingGroupBuild, RawEnvelope, ScalingParams, Transition};
use fleet_reconcile::render_template;
use tracing::{debug, info, instrument};

use crate::db::{AsgBuildStep, AsgProgressStore};
use crate::notify::{notify_best_effort, Notifier};
use crate::provider::{
    CloudProvider, CreateGroupRequest, LifecycleHookRequest, MetricAlarmRequest,
    ScalingPolicyRequest, Tags,
};
use crate::workers::{HandlerError, JobHandler};

/// Group name: the explicit name, or the build's template expanded.
pub fn group_name(build: &AutoscalingGroupBuild) -> String {
    if !build.name.is_empty() {
        return build.name.clone();
    }
    let mut vars = BTreeMap::new();
    vars.insert("role", build.role.clone());
    vars.insert("site", build.site.clone());
    vars.insert("env", build.env.clone());
    vars.insert("queue", build.queue.clone());
    vars.insert("instance_id", build.instance_id.clone());
    vars.insert(
        "instance_short",
        build.instance_id.trim_start_matches("i-").to_string(),
    );
    render_template(&build.name_template, &vars)
}

pub struct AutoscalingGroupBuilder {
    provider: Arc<dyn CloudProvider>,
    progress: AsgProgressStore,
    notifier: Arc<dyn Notifier>,
}

impl AutoscalingGroupBuilder {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        progress: AsgProgressStore,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            provider,
            progress,
            notifier,
        }
    }

    /// Runs every incomplete step. Returns the group name.
    #[instrument(skip(self, build), fields(build_id = %build.id))]
    pub async fn build(&self, build: &AutoscalingGroupBuild) -> Result<String, HandlerError> {
        let mut done = self.progress.completed(&build.id).await?;
        if !done.is_empty() {
            info!(completed = done.len(), "Resuming autoscaling group build");
        }

        let name = match done.get(&AsgBuildStep::CreateGroup) {
            Some(name) => name.clone(),
            None => group_name(build),
        };

        for step in AsgBuildStep::ALL {
            if done.contains_key(&step) {
                debug!(%step, "Step already complete");
                continue;
            }
            let output = self.run_step(step, build, &name, &done).await?;
            self.progress.record(&build.id, step, &output).await?;
            debug!(%step, output = %output, "Step complete");
            done.insert(step, output);
        }

        self.progress.clear(&build.id).await?;
        info!(group = %name, "Autoscaling group built");

        notify_best_effort(
            self.notifier.as_ref(),
            "",
            &format!(
                "Built autoscaling group {name} ({}/{}/{}, min {} max {} desired {})",
                build.site,
                build.env,
                build.queue,
                build.min_size,
                build.max_size,
                build.desired_capacity
            ),
        )
        .await;

        Ok(name)
    }

    async fn run_step(
        &self,
        step: AsgBuildStep,
        build: &AutoscalingGroupBuild,
        name: &str,
        done: &BTreeMap<AsgBuildStep, String>,
    ) -> Result<String, HandlerError> {
        match step {
            AsgBuildStep::CreateGroup => {
                let mut tags = Tags::new();
                tags.insert("Name".to_string(), name.to_string());
                tags.insert("role".to_string(), build.role.clone());
                tags.insert("site".to_string(), build.site.clone());
                tags.insert("env".to_string(), build.env.clone());
                tags.insert("queue".to_string(), build.queue.clone());

                self.provider
                    .create_autoscaling_group(&CreateGroupRequest {
                        name: name.to_string(),
                        instance_id: build.instance_id.clone(),
                        min_size: build.min_size,
                        max_size: build.max_size,
                        desired_capacity: build.desired_capacity,
                        tags,
                    })
                    .await?;
                Ok(name.to_string())
            }
            AsgBuildStep::ScaleOutPolicy => {
                self.policy(name, "scale-out", &build.scale_out).await
            }
            AsgBuildStep::ScaleInPolicy => self.policy(name, "scale-in", &build.scale_in).await,
            AsgBuildStep::ScaleOutAlarm => {
                let arn = policy_arn(done, AsgBuildStep::ScaleOutPolicy)?;
                self.alarm(name, "add-capacity", arn, &build.scale_out).await
            }
            AsgBuildStep::ScaleInAlarm => {
                let arn = policy_arn(done, AsgBuildStep::ScaleInPolicy)?;
                self.alarm(name, "remove-capacity", arn, &build.scale_in)
                    .await
            }
            AsgBuildStep::LaunchingHook => self.hook(build, name, Transition::Launching).await,
            AsgBuildStep::TerminatingHook => {
                self.hook(build, name, Transition::Terminating).await
            }
        }
    }

    async fn policy(
        &self,
        group: &str,
        suffix: &str,
        params: &ScalingParams,
    ) -> Result<String, HandlerError> {
        let arn = self
            .provider
            .put_scaling_policy(&ScalingPolicyRequest {
                group_name: group.to_string(),
                policy_name: format!("{group}-{suffix}"),
                adjustment: params.adjustment,
                cooldown: params.cooldown,
            })
            .await?;
        Ok(arn)
    }

    async fn alarm(
        &self,
        group: &str,
        suffix: &str,
        policy_arn: &str,
        params: &ScalingParams,
    ) -> Result<String, HandlerError> {
        let alarm_name = format!("{group}-{suffix}");
        self.provider
            .put_metric_alarm(&MetricAlarmRequest {
                alarm_name: alarm_name.clone(),
                group_name: group.to_string(),
                policy_arn: policy_arn.to_string(),
                metric_name: params.metric_name.clone(),
                namespace: params.namespace.clone(),
                statistic: params.statistic.clone(),
                threshold: params.threshold,
                period: params.period,
                evaluation_periods: params.evaluation_periods,
                comparison_operator: params.comparison_operator.clone(),
            })
            .await?;
        Ok(alarm_name)
    }

    async fn hook(
        &self,
        build: &AutoscalingGroupBuild,
        group: &str,
        transition: Transition,
    ) -> Result<String, HandlerError> {
        let hook_name = format!("{group}-{}", transition.as_str());
        self.provider
            .put_lifecycle_hook(&LifecycleHookRequest {
                group_name: group.to_string(),
                hook_name: hook_name.clone(),
                transition: transition.provider_name().to_string(),
                topic_arn: build.topic_arn.clone(),
                role_arn: build.role_arn.clone(),
                default_result: build.lifecycle_default_result.clone(),
                heartbeat_timeout: build.lifecycle_heartbeat_timeout,
            })
            .await?;
        Ok(hook_name)
    }
}

fn policy_arn(
    done: &BTreeMap<AsgBuildStep, String>,
    step: AsgBuildStep,
) -> Result<&str, HandlerError> {
    done.get(&step)
        .map(String::as_str)
        .ok_or_else(|| HandlerError::Fatal(format!("missing output of step {step}")))
}

#[async_trait]
impl JobHandler for AutoscalingGroupBuilder {
    async fn handle(&self, envelope: &RawEnvelope) -> Result<(), HandlerError> {
        let build: AutoscalingGroupBuild = envelope.decode_arg()?;
        self.build(&build).await.map(|_| ())
    }
}
