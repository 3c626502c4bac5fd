//! Instance build endpoints.
//!
//! Operators create builds; instances report their own progress through
//! the bootstrap gate while they boot.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{patch, post},
    Json, Router,
};
use chrono::Utc;
use fleet_events::{BuildState, InstanceBuild, DEFAULT_INSTANCE_NAME_TEMPLATE};
use fleet_id::InstanceBuildId;
use serde::Deserialize;
use tracing::info;

use crate::api::auth::{Authenticated, Principal};
use crate::api::error::{ApiError, FieldError};
use crate::api::request_context::RequestContext;
use crate::db::{BuildStore, BuildUpdate};
use crate::notify::notify_best_effort;
use crate::state::AppState;

/// Upper bound on instances per build.
pub const MAX_BUILD_COUNT: u32 = 50;

pub fn operator_routes() -> Router<AppState> {
    Router::new().route("/instance-builds", post(create_build))
}

pub fn bootstrap_routes() -> Router<AppState> {
    Router::new().route("/instance-builds/{build_id}", patch(update_build))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateInstanceBuildRequest {
    #[serde(default)]
    pub site: String,
    #[serde(default)]
    pub env: String,
    /// Image to boot. Empty picks the newest active image for `role`.
    #[serde(default)]
    pub ami: String,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub queue: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub slack_channel: String,
    #[serde(default)]
    pub name_template: Option<String>,
    #[serde(default)]
    pub boot_instance: Option<bool>,
}

fn default_count() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct UpdateInstanceBuildRequest {
    pub state: BuildState,
}

pub(crate) fn require_name(errors: &mut Vec<FieldError>, field: &str, value: &str) {
    if value.trim().is_empty() {
        errors.push(FieldError::new(field, "is required"));
    } else if value.chars().any(char::is_whitespace) {
        errors.push(FieldError::new(field, "must not contain whitespace"));
    }
}

impl CreateInstanceBuildRequest {
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        require_name(&mut errors, "site", &self.site);
        require_name(&mut errors, "env", &self.env);
        require_name(&mut errors, "instance_type", &self.instance_type);
        require_name(&mut errors, "queue", &self.queue);
        require_name(&mut errors, "role", &self.role);
        if self.count == 0 || self.count > MAX_BUILD_COUNT {
            errors.push(FieldError::new(
                "count",
                format!("must be between 1 and {MAX_BUILD_COUNT}"),
            ));
        }
        if let Some(template) = &self.name_template {
            if template.trim().is_empty() {
                errors.push(FieldError::new("name_template", "must not be empty"));
            }
        }
        errors
    }

    fn into_build(self) -> InstanceBuild {
        let now = Utc::now();
        InstanceBuild {
            id: InstanceBuildId::new(),
            site: self.site,
            env: self.env,
            ami: self.ami,
            instance_type: self.instance_type,
            count: self.count,
            queue: self.queue,
            role: self.role,
            state: BuildState::Pending,
            slack_channel: self.slack_channel,
            name_template: self
                .name_template
                .unwrap_or_else(|| DEFAULT_INSTANCE_NAME_TEMPLATE.to_string()),
            boot_instance: self.boot_instance.unwrap_or(true),
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Record a build and enqueue it, in one transaction.
///
/// POST /instance-builds
async fn create_build(
    State(state): State<AppState>,
    ctx: RequestContext,
    _auth: Authenticated,
    Json(req): Json<CreateInstanceBuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let errors = req.validate();
    if !errors.is_empty() {
        return Err(
            ApiError::bad_request("validation_failed", "Invalid instance build")
                .with_request_id(ctx.request_id)
                .with_details(errors),
        );
    }

    let build = req.into_build();
    let record = BuildStore::save_ops(&build).map_err(|e| ApiError::store(e, &ctx.request_id))?;
    state
        .db()
        .queue()
        .push_with(build.clone(), record)
        .await
        .map_err(|e| ApiError::store(e, &ctx.request_id))?;

    info!(
        build_id = %build.id,
        request_id = %ctx.request_id,
        count = build.count,
        "Instance build enqueued"
    );
    Ok((StatusCode::ACCEPTED, Json(build)))
}

/// Move a build forward.
///
/// PATCH /instance-builds/{build_id}
async fn update_build(
    State(state): State<AppState>,
    ctx: RequestContext,
    auth: Authenticated,
    Path(build_id): Path<String>,
    Json(req): Json<UpdateInstanceBuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let build_id = InstanceBuildId::parse(&build_id).map_err(|e| {
        ApiError::bad_request("invalid_build_id", e.to_string()).with_request_id(request_id.clone())
    })?;

    if let Principal::Bootstrap(authorized) = &auth.principal {
        if *authorized != build_id {
            return Err(ApiError::forbidden("forbidden", "Credentials are for another build")
                .with_request_id(request_id));
        }
    }

    let update = state
        .db()
        .builds()
        .update_state(&build_id, req.state, Utc::now())
        .await
        .map_err(|e| ApiError::store(e, &request_id))?;

    match update {
        None => Err(ApiError::not_found("build_not_found", "Instance build not found")
            .with_request_id(request_id)),
        Some(BuildUpdate::Refused { current }) => Err(ApiError::conflict(
            "invalid_state_transition",
            format!("Build is already {current} and cannot move to {}", req.state),
        )
        .with_request_id(request_id)),
        Some(BuildUpdate::Unchanged(build)) => Ok(Json(build)),
        Some(BuildUpdate::Advanced(build)) => {
            info!(build_id = %build.id, state = %build.state, "Instance build advanced");
            if build.state == BuildState::Finished {
                state
                    .db()
                    .bootstrap()
                    .wipe(&build.id)
                    .await
                    .map_err(|e| ApiError::store(e, &request_id))?;
                notify_best_effort(
                    state.notifier(),
                    &build.slack_channel,
                    &format!(
                        "Finished build {} ({}/{}/{})",
                        build.id, build.site, build.env, build.queue
                    ),
                )
                .await;
            }
            Ok(Json(build))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::AuthGate;
    use crate::api::create_router;
    use crate::db::{queue_key, Database, KvOp};
    use crate::notify::NullNotifier;
    use axum::{
        body::Body,
        http::{header, Request},
    };
    use fleet_events::Job;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn post_build(state: &AppState) -> StatusCode {
        let body = serde_json::json!({
            "site": "org",
            "env": "prod",
            "instance_type": "c5.large",
            "queue": "docker",
            "role": "worker"
        });
        create_router(state.clone())
            .oneshot(
                Request::post("/instance-builds")
                    .header(header::AUTHORIZATION, "token op-token")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
            .status()
    }

    fn state(db: Database) -> AppState {
        AppState::new(db, Arc::new(NullNotifier), AuthGate::new("op-token"))
    }

    #[tokio::test]
    async fn test_create_records_and_enqueues() {
        let state = state(Database::in_memory());
        assert_eq!(post_build(&state).await, StatusCode::ACCEPTED);

        assert_eq!(state.db().builds().ids().await.unwrap().len(), 1);
        assert_eq!(
            state.db().queue().depth(InstanceBuild::QUEUE).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_enqueue_leaves_no_build_behind() {
        let db = Database::in_memory();
        // The queue key holds a hash, so the push half of the write fails.
        db.kv()
            .transact(vec![KvOp::hset(
                queue_key(InstanceBuild::QUEUE),
                vec![("f".to_string(), "v".to_string())],
            )])
            .await
            .unwrap();
        let state = state(db);

        assert_eq!(post_build(&state).await, StatusCode::SERVICE_UNAVAILABLE);
        assert!(state.db().builds().ids().await.unwrap().is_empty());
    }

    fn request() -> CreateInstanceBuildRequest {
        serde_json::from_value(serde_json::json!({
            "site": "org",
            "env": "prod",
            "instance_type": "c5.large",
            "queue": "docker",
            "role": "worker"
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_request_defaults() {
        let req = request();
        assert!(req.validate().is_empty());
        let build = req.into_build();
        assert_eq!(build.count, 1);
        assert_eq!(build.state, BuildState::Pending);
        assert!(build.boot_instance);
        assert_eq!(build.name_template, DEFAULT_INSTANCE_NAME_TEMPLATE);
    }

    #[test]
    fn test_validation_lists_every_bad_field() {
        let mut req = request();
        req.site = String::new();
        req.queue = "two words".to_string();
        req.count = 0;

        let fields: Vec<String> = req.validate().into_iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["site", "queue", "count"]);
    }
}
