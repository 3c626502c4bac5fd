//! Cloud provider capability.
//!
//! Everything fleetd asks of the compute provider goes through
//! [`CloudProvider`]: describing the fleet, launching and tagging
//! instances, building autoscaling groups, and releasing lifecycle hooks.
//!
//! Two implementations:
//! - [`HttpProvider`]: JSON over HTTP to a provider gateway
//! - [`FakeProvider`]: in-memory, records every call, used in dev mode and tests

mod fake;
mod http;

use std::collections::BTreeMap;

use async_trait::async_trait;
use fleet_events::{Image, Instance, Transition};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fake::FakeProvider;
pub use http::HttpProvider;

/// Provider call errors.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The request never got a response.
    #[error("provider transport error: {0}")]
    Transport(String),

    /// The provider answered with an error.
    #[error("provider error {status} {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The provider answered with something we could not read.
    #[error("unexpected provider response: {0}")]
    Decode(String),
}

/// Error codes the provider uses for requests that can never succeed.
const DOMAIN_ERROR_CODES: &[&str] = &["ValidationError", "NotFound", "AlreadyCompleted"];

impl ProviderError {
    /// Whether this is an expected domain outcome (already completed, not
    /// found, failed validation) rather than a transient failure. Retrying a
    /// domain error cannot help.
    pub fn is_domain(&self) -> bool {
        match self {
            ProviderError::Api { status, code, .. } => {
                matches!(status, 400 | 404 | 409 | 422)
                    || DOMAIN_ERROR_CODES.contains(&code.as_str())
            }
            ProviderError::Transport(_) | ProviderError::Decode(_) => false,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ProviderError::Api {
            status: 404,
            code: "NotFound".to_string(),
            message: message.into(),
        }
    }
}

/// Resource tags, name to value.
pub type Tags = BTreeMap<String, String>;

/// Launch request for a batch of identical instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInstancesRequest {
    pub image_id: String,
    pub instance_type: String,
    pub count: u32,
    pub security_group_ids: Vec<String>,
    /// Base64-encoded user data.
    pub user_data: String,
    /// Idempotency token. A repeated launch with the same token returns the
    /// instances of the first launch.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    /// Instance whose configuration seeds the group.
    pub instance_id: String,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_capacity: u32,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicyRequest {
    pub group_name: String,
    pub policy_name: String,
    pub adjustment: i32,
    pub cooldown: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricAlarmRequest {
    pub alarm_name: String,
    pub group_name: String,
    /// Policy triggered when the alarm fires.
    pub policy_arn: String,
    pub metric_name: String,
    pub namespace: String,
    pub statistic: String,
    pub threshold: f64,
    pub period: u32,
    pub evaluation_periods: u32,
    pub comparison_operator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleHookRequest {
    pub group_name: String,
    pub hook_name: String,
    pub transition: String,
    pub topic_arn: String,
    pub role_arn: String,
    pub default_result: String,
    pub heartbeat_timeout: u32,
}

impl LifecycleHookRequest {
    pub fn transition(&self) -> Option<Transition> {
        Transition::from_provider_name(&self.transition).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteLifecycleActionRequest {
    pub group_name: String,
    pub hook_name: String,
    pub action_token: String,
    pub instance_id: String,
    /// `CONTINUE` or `ABANDON`.
    pub result: String,
}

/// Result telling the provider to let the instance proceed.
pub const LIFECYCLE_CONTINUE: &str = "CONTINUE";

/// Compute provider operations.
///
/// Describe calls return `Ok(None)` when the provider produced no snapshot
/// at all, which callers must treat differently from an empty fleet.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn describe_instances(&self) -> Result<Option<Vec<Instance>>, ProviderError>;

    async fn describe_images(&self) -> Result<Option<Vec<Image>>, ProviderError>;

    /// Launches instances and returns their ids.
    async fn run_instances(&self, request: &RunInstancesRequest)
        -> Result<Vec<String>, ProviderError>;

    async fn create_tags(&self, resource_ids: &[String], tags: &Tags)
        -> Result<(), ProviderError>;

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), ProviderError>;

    /// Creates a security group and returns its id.
    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
    ) -> Result<String, ProviderError>;

    async fn create_autoscaling_group(
        &self,
        request: &CreateGroupRequest,
    ) -> Result<(), ProviderError>;

    /// Creates a scaling policy and returns its ARN.
    async fn put_scaling_policy(
        &self,
        request: &ScalingPolicyRequest,
    ) -> Result<String, ProviderError>;

    async fn put_metric_alarm(&self, request: &MetricAlarmRequest) -> Result<(), ProviderError>;

    async fn put_lifecycle_hook(&self, request: &LifecycleHookRequest)
        -> Result<(), ProviderError>;

    async fn complete_lifecycle_action(
        &self,
        request: &CompleteLifecycleActionRequest,
    ) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn api(status: u16, code: &str) -> ProviderError {
        ProviderError::Api {
            status,
            code: code.to_string(),
            message: String::new(),
        }
    }

    #[rstest]
    #[case(api(404, "Whatever"), true)]
    #[case(api(400, "ValidationError"), true)]
    #[case(api(409, "Conflict"), true)]
    #[case(api(500, "AlreadyCompleted"), true)]
    #[case(api(500, "InternalError"), false)]
    #[case(api(503, "Throttled"), false)]
    #[case(ProviderError::Transport("reset".into()), false)]
    #[case(ProviderError::Decode("eof".into()), false)]
    fn test_is_domain(#[case] err: ProviderError, #[case] expected: bool) {
        assert_eq!(err.is_domain(), expected);
    }
}
