//! Provider gateway client.
//!
//! Each operation is a `POST {base_url}/v1/{action}` with a JSON body. The
//! gateway answers 2xx with a JSON result, or an error status with
//! `{"code": ..., "message": ...}`.

use std::time::Duration;

use async_trait::async_trait;
use fleet_events::{Image, Instance};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};

use super::{
    CloudProvider, CompleteLifecycleActionRequest, CreateGroupRequest, LifecycleHookRequest,
    MetricAlarmRequest, ProviderError, RunInstancesRequest, ScalingPolicyRequest, Tags,
};

/// Provider gateway client.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    region: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct InstancesResponse {
    instances: Option<Vec<Instance>>,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    images: Option<Vec<Image>>,
}

#[derive(Debug, Deserialize)]
struct RunInstancesResponse {
    instance_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GroupIdResponse {
    group_id: String,
}

#[derive(Debug, Deserialize)]
struct PolicyArnResponse {
    policy_arn: String,
}

#[derive(Debug, Deserialize)]
struct Empty {}

impl HttpProvider {
    /// Create a new gateway client.
    pub fn new(
        base_url: impl Into<String>,
        region: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            region: region.into(),
            token,
        })
    }

    async fn call<Req, Resp>(&self, action: &str, body: &Req) -> Result<Resp, ProviderError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/v1/{}", self.base_url, action);
        debug!(action, region = %self.region, "Calling provider");

        let mut request = self
            .client
            .post(&url)
            .header("X-Fleet-Region", &self.region)
            .json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let parsed: Option<ApiErrorBody> = serde_json::from_str(&text).ok();
            let (code, message) = match parsed {
                Some(b) => (b.code, b.message),
                None => (String::new(), text),
            };
            error!(action, status = %status, code = %code, "Provider call failed");
            return Err(ProviderError::Api {
                status: status.as_u16(),
                code,
                message,
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl CloudProvider for HttpProvider {
    async fn describe_instances(&self) -> Result<Option<Vec<Instance>>, ProviderError> {
        let resp: InstancesResponse = self.call("describe-instances", &json!({})).await?;
        Ok(resp.instances)
    }

    async fn describe_images(&self) -> Result<Option<Vec<Image>>, ProviderError> {
        let resp: ImagesResponse = self.call("describe-images", &json!({})).await?;
        Ok(resp.images)
    }

    async fn run_instances(
        &self,
        request: &RunInstancesRequest,
    ) -> Result<Vec<String>, ProviderError> {
        let resp: RunInstancesResponse = self.call("run-instances", request).await?;
        Ok(resp.instance_ids)
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &Tags) -> Result<(), ProviderError> {
        let _: Empty = self
            .call(
                "create-tags",
                &json!({ "resource_ids": resource_ids, "tags": tags }),
            )
            .await?;
        Ok(())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), ProviderError> {
        let _: Empty = self
            .call(
                "terminate-instances",
                &json!({ "instance_ids": instance_ids }),
            )
            .await?;
        Ok(())
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
    ) -> Result<String, ProviderError> {
        let resp: GroupIdResponse = self
            .call(
                "create-security-group",
                &json!({ "name": name, "description": description }),
            )
            .await?;
        Ok(resp.group_id)
    }

    async fn create_autoscaling_group(
        &self,
        request: &CreateGroupRequest,
    ) -> Result<(), ProviderError> {
        let _: Empty = self.call("create-autoscaling-group", request).await?;
        Ok(())
    }

    async fn put_scaling_policy(
        &self,
        request: &ScalingPolicyRequest,
    ) -> Result<String, ProviderError> {
        let resp: PolicyArnResponse = self.call("put-scaling-policy", request).await?;
        Ok(resp.policy_arn)
    }

    async fn put_metric_alarm(&self, request: &MetricAlarmRequest) -> Result<(), ProviderError> {
        let _: Empty = self.call("put-metric-alarm", request).await?;
        Ok(())
    }

    async fn put_lifecycle_hook(
        &self,
        request: &LifecycleHookRequest,
    ) -> Result<(), ProviderError> {
        let _: Empty = self.call("put-lifecycle-hook", request).await?;
        Ok(())
    }

    async fn complete_lifecycle_action(
        &self,
        request: &CompleteLifecycleActionRequest,
    ) -> Result<(), ProviderError> {
        let _: Empty = self.call("complete-lifecycle-action", request).await?;
        Ok(())
    }
}
