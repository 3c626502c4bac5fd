//! Autoscaling group build endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use chrono::Utc;
use fleet_events::{AutoscalingGroupBuild, ScalingParams, DEFAULT_ASG_NAME_TEMPLATE};
use fleet_id::AutoscalingGroupBuildId;
use serde::Deserialize;
use tracing::info;

use super::instance_builds::require_name;
use crate::api::auth::Authenticated;
use crate::api::error::{ApiError, FieldError};
use crate::api::request_context::RequestContext;
use crate::state::AppState;

const LIFECYCLE_RESULTS: [&str; 2] = ["CONTINUE", "ABANDON"];

pub fn routes() -> Router<AppState> {
    Router::new().route("/autoscaling-group-builds", post(create_asg_build))
}

#[derive(Debug, Deserialize)]
pub struct CreateAsgBuildRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub queue: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub site: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub role_arn: String,
    #[serde(default)]
    pub topic_arn: String,
    #[serde(default)]
    pub name_template: Option<String>,
    #[serde(default)]
    pub min_size: u32,
    #[serde(default)]
    pub max_size: u32,
    #[serde(default)]
    pub desired_capacity: u32,
    #[serde(default)]
    pub scale_out: Option<ScalingParams>,
    #[serde(default)]
    pub scale_in: Option<ScalingParams>,
    #[serde(default)]
    pub lifecycle_default_result: Option<String>,
    #[serde(default)]
    pub lifecycle_heartbeat_timeout: Option<u32>,
}

impl CreateAsgBuildRequest {
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        require_name(&mut errors, "instance_id", &self.instance_id);
        require_name(&mut errors, "queue", &self.queue);
        require_name(&mut errors, "env", &self.env);
        require_name(&mut errors, "site", &self.site);
        require_name(&mut errors, "role", &self.role);
        require_name(&mut errors, "role_arn", &self.role_arn);
        require_name(&mut errors, "topic_arn", &self.topic_arn);

        if self.max_size == 0 {
            errors.push(FieldError::new("max_size", "must be at least 1"));
        }
        if self.min_size > self.max_size {
            errors.push(FieldError::new("min_size", "must not exceed max_size"));
        }
        if self.desired_capacity < self.min_size || self.desired_capacity > self.max_size {
            errors.push(FieldError::new(
                "desired_capacity",
                "must be between min_size and max_size",
            ));
        }
        if let Some(result) = &self.lifecycle_default_result {
            if !LIFECYCLE_RESULTS.contains(&result.as_str()) {
                errors.push(FieldError::new(
                    "lifecycle_default_result",
                    "must be CONTINUE or ABANDON",
                ));
            }
        }
        errors
    }

    fn into_build(self) -> AutoscalingGroupBuild {
        AutoscalingGroupBuild {
            id: AutoscalingGroupBuildId::new(),
            name: self.name,
            instance_id: self.instance_id,
            queue: self.queue,
            env: self.env,
            site: self.site,
            role: self.role,
            role_arn: self.role_arn,
            topic_arn: self.topic_arn,
            name_template: self
                .name_template
                .unwrap_or_else(|| DEFAULT_ASG_NAME_TEMPLATE.to_string()),
            min_size: self.min_size,
            max_size: self.max_size,
            desired_capacity: self.desired_capacity,
            scale_out: self.scale_out.unwrap_or_else(ScalingParams::default_scale_out),
            scale_in: self.scale_in.unwrap_or_else(ScalingParams::default_scale_in),
            lifecycle_default_result: self
                .lifecycle_default_result
                .unwrap_or_else(|| "CONTINUE".to_string()),
            lifecycle_heartbeat_timeout: self.lifecycle_heartbeat_timeout.unwrap_or(900),
            timestamp: Utc::now(),
        }
    }
}

/// POST /autoscaling-group-builds
async fn create_asg_build(
    State(state): State<AppState>,
    ctx: RequestContext,
    _auth: Authenticated,
    Json(req): Json<CreateAsgBuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let errors = req.validate();
    if !errors.is_empty() {
        return Err(
            ApiError::bad_request("validation_failed", "Invalid autoscaling group build")
                .with_request_id(ctx.request_id)
                .with_details(errors),
        );
    }

    let build = req.into_build();
    state
        .db()
        .queue()
        .push(build.clone())
        .await
        .map_err(|e| ApiError::store(e, &ctx.request_id))?;

    info!(build_id = %build.id, request_id = %ctx.request_id, "Autoscaling group build enqueued");
    Ok((StatusCode::ACCEPTED, Json(build)))
}
