//! Fleet records and job payloads.

use chrono::{DateTime, Utc};
use fleet_id::{AutoscalingGroupBuildId, InstanceBuildId};
use serde::{Deserialize, Serialize};

use crate::{EventError, Job};

// =============================================================================
// Fleet Cache Records
// =============================================================================

/// A provider instance as mirrored into the fleet cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub instance_type: String,
    pub image_id: String,
    pub public_ip: String,
    pub private_ip: String,
    pub launch_time: String,
    pub queue: String,
    pub env: String,
    pub site: String,
    pub role: String,
    pub name: String,
    /// Locally written hint such as `"down"`; never reported by the provider.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expected_state: String,
}

/// A provider machine image as mirrored into the fleet cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub role: String,
    pub active: bool,
    pub name: String,
    pub state: String,
}

// =============================================================================
// Instance Builds
// =============================================================================

/// Instance build progress. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    #[default]
    Pending,
    Started,
    Finished,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Pending => "pending",
            BuildState::Started => "started",
            BuildState::Finished => "finished",
        }
    }

    /// Whether moving from `self` to `next` keeps the state monotonic.
    /// Re-applying the current state is allowed so redelivered updates are
    /// harmless.
    pub fn can_advance_to(&self, next: BuildState) -> bool {
        next >= *self
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildState {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildState::Pending),
            "started" => Ok(BuildState::Started),
            "finished" => Ok(BuildState::Finished),
            other => Err(EventError::UnknownBuildState(other.to_string())),
        }
    }
}

/// Default instance name template.
pub const DEFAULT_INSTANCE_NAME_TEMPLATE: &str = "{role}-{site}-{env}-{queue}-{instance_short}";

fn default_name_template() -> String {
    DEFAULT_INSTANCE_NAME_TEMPLATE.to_string()
}

fn default_true() -> bool {
    true
}

/// A request to provision `count` instances sharing one bootstrap payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceBuild {
    pub id: InstanceBuildId,
    pub site: String,
    pub env: String,
    /// Image to boot; empty means the newest active cached image for `role`.
    #[serde(default)]
    pub ami: String,
    pub instance_type: String,
    pub count: u32,
    pub queue: String,
    pub role: String,
    #[serde(default)]
    pub state: BuildState,
    #[serde(default)]
    pub slack_channel: String,
    #[serde(default = "default_name_template")]
    pub name_template: String,
    /// When false only the bootstrap payload is prepared.
    #[serde(default = "default_true")]
    pub boot_instance: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job for InstanceBuild {
    const CLASS: &'static str = "InstanceBuild";
    const QUEUE: &'static str = "instance-builds";

    fn job_id(&self) -> String {
        self.id.to_string()
    }
}

/// Tear down a single instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceTermination {
    pub instance_id: String,
    #[serde(default)]
    pub slack_channel: String,
}

impl Job for InstanceTermination {
    const CLASS: &'static str = "InstanceTermination";
    const QUEUE: &'static str = "instance-terminations";

    fn job_id(&self) -> String {
        self.instance_id.clone()
    }
}

// =============================================================================
// Autoscaling
// =============================================================================

/// Autoscaling lifecycle transition kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Launching,
    Terminating,
}

impl Transition {
    pub const ALL: [Transition; 2] = [Transition::Launching, Transition::Terminating];

    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Launching => "launching",
            Transition::Terminating => "terminating",
        }
    }

    /// Provider-side lifecycle transition name.
    pub fn provider_name(&self) -> &'static str {
        match self {
            Transition::Launching => "autoscaling:EC2_INSTANCE_LAUNCHING",
            Transition::Terminating => "autoscaling:EC2_INSTANCE_TERMINATING",
        }
    }

    /// Parses the provider's transition name.
    pub fn from_provider_name(name: &str) -> Result<Self, EventError> {
        Self::ALL
            .into_iter()
            .find(|t| t.provider_name() == name)
            .ok_or_else(|| EventError::UnknownTransition(name.to_string()))
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Transition {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "launching" => Ok(Transition::Launching),
            "terminating" => Ok(Transition::Terminating),
            other => Err(EventError::UnknownTransition(other.to_string())),
        }
    }
}

/// A pending autoscaling hook awaiting completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalingLifecycleAction {
    pub transition: Transition,
    pub instance_id: String,
    pub asg_name: String,
    pub lifecycle_hook_name: String,
    pub lifecycle_action_token: String,
}

/// Normalized lifecycle event consumed by the transition reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceLifecycleTransition {
    pub instance_id: String,
    pub transition: Transition,
}

impl Job for InstanceLifecycleTransition {
    const CLASS: &'static str = "InstanceLifecycleTransition";
    const QUEUE: &'static str = "instance-lifecycle-transitions";

    fn job_id(&self) -> String {
        self.instance_id.clone()
    }
}

/// Scaling policy plus the metric alarm that drives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingParams {
    pub cooldown: u32,
    pub adjustment: i32,
    pub metric_name: String,
    pub namespace: String,
    pub statistic: String,
    pub threshold: f64,
    pub period: u32,
    pub evaluation_periods: u32,
    pub comparison_operator: String,
}

impl ScalingParams {
    pub fn default_scale_out() -> Self {
        Self {
            cooldown: 300,
            adjustment: 1,
            metric_name: "CPUUtilization".to_string(),
            namespace: "AWS/EC2".to_string(),
            statistic: "Average".to_string(),
            threshold: 75.0,
            period: 60,
            evaluation_periods: 2,
            comparison_operator: "GreaterThanOrEqualToThreshold".to_string(),
        }
    }

    pub fn default_scale_in() -> Self {
        Self {
            adjustment: -1,
            threshold: 25.0,
            comparison_operator: "LessThanThreshold".to_string(),
            ..Self::default_scale_out()
        }
    }
}

/// Default autoscaling group name template.
pub const DEFAULT_ASG_NAME_TEMPLATE: &str = "{role}-{site}-{env}-{queue}-{instance_id}";

fn default_asg_name_template() -> String {
    DEFAULT_ASG_NAME_TEMPLATE.to_string()
}

fn default_lifecycle_result() -> String {
    "CONTINUE".to_string()
}

fn default_heartbeat_timeout() -> u32 {
    900
}

/// One-shot autoscaling group provisioning request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalingGroupBuild {
    pub id: AutoscalingGroupBuildId,
    /// Explicit group name; generated from `name_template` when empty.
    #[serde(default)]
    pub name: String,
    /// Template instance the group's launch configuration is derived from.
    pub instance_id: String,
    pub queue: String,
    pub env: String,
    pub site: String,
    pub role: String,
    pub role_arn: String,
    pub topic_arn: String,
    #[serde(default = "default_asg_name_template")]
    pub name_template: String,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_capacity: u32,
    pub scale_out: ScalingParams,
    pub scale_in: ScalingParams,
    #[serde(default = "default_lifecycle_result")]
    pub lifecycle_default_result: String,
    #[serde(default = "default_heartbeat_timeout")]
    pub lifecycle_heartbeat_timeout: u32,
    pub timestamp: DateTime<Utc>,
}

impl Job for AutoscalingGroupBuild {
    const CLASS: &'static str = "AutoscalingGroupBuild";
    const QUEUE: &'static str = "autoscaling-group-builds";

    fn job_id(&self) -> String {
        self.id.to_string()
    }
}

/// Provider notification topic subscription awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnsSubscriptionConfirmation {
    pub topic_arn: String,
    pub subscribe_url: String,
}

impl Job for SnsSubscriptionConfirmation {
    const CLASS: &'static str = "SnsSubscriptionConfirmation";
    const QUEUE: &'static str = "sns-messages";

    fn job_id(&self) -> String {
        self.topic_arn.clone()
    }
}

/// Every queue fleetd knows how to serve.
pub const KNOWN_QUEUES: [&str; 5] = [
    InstanceBuild::QUEUE,
    InstanceTermination::QUEUE,
    InstanceLifecycleTransition::QUEUE,
    AutoscalingGroupBuild::QUEUE,
    SnsSubscriptionConfirmation::QUEUE,
];
