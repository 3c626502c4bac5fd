//! Fleet cache queries and instance termination.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use fleet_events::{Image, Instance, InstanceTermination};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::auth::Authenticated;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::db::Filter;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/instances", get(list_instances))
        .route(
            "/instances/{instance_id}",
            get(get_instance).delete(terminate_instance),
        )
        .route("/images", get(list_images))
}

#[derive(Debug, Serialize)]
pub struct ListInstancesResponse {
    pub items: Vec<Instance>,
}

#[derive(Debug, Serialize)]
pub struct ListImagesResponse {
    pub items: Vec<Image>,
}

#[derive(Debug, Deserialize)]
pub struct TerminateQuery {
    #[serde(default)]
    pub slack_channel: String,
}

#[derive(Debug, Serialize)]
pub struct TerminateResponse {
    pub instance_id: String,
    pub job_id: String,
}

/// Cached instances matching every query parameter.
///
/// GET /instances
async fn list_instances(
    State(state): State<AppState>,
    ctx: RequestContext,
    _auth: Authenticated,
    Query(filter): Query<Filter>,
) -> Result<impl IntoResponse, ApiError> {
    let items = state
        .db()
        .fleet_cache()
        .fetch_instances(&filter)
        .await
        .map_err(|e| ApiError::store(e, &ctx.request_id))?;
    Ok(Json(ListInstancesResponse { items }))
}

/// GET /instances/{instance_id}
async fn get_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    _auth: Authenticated,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = state
        .db()
        .fleet_cache()
        .get_instance(&instance_id)
        .await
        .map_err(|e| ApiError::store(e, &ctx.request_id))?;

    instance.map(Json).ok_or_else(|| {
        ApiError::not_found("instance_not_found", "Instance not in the fleet cache")
            .with_request_id(ctx.request_id)
    })
}

/// Enqueue termination of one instance.
///
/// DELETE /instances/{instance_id}
async fn terminate_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    _auth: Authenticated,
    Path(instance_id): Path<String>,
    Query(query): Query<TerminateQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let envelope = state
        .db()
        .queue()
        .push(InstanceTermination {
            instance_id: instance_id.clone(),
            slack_channel: query.slack_channel,
        })
        .await
        .map_err(|e| ApiError::store(e, &ctx.request_id))?;

    info!(instance_id = %instance_id, request_id = %ctx.request_id, "Termination enqueued");
    Ok((
        StatusCode::ACCEPTED,
        Json(TerminateResponse {
            instance_id,
            job_id: envelope.job_id,
        }),
    ))
}

/// Cached images matching every query parameter.
///
/// GET /images
async fn list_images(
    State(state): State<AppState>,
    ctx: RequestContext,
    _auth: Authenticated,
    Query(filter): Query<Filter>,
) -> Result<impl IntoResponse, ApiError> {
    let items = state
        .db()
        .fleet_cache()
        .fetch_images(&filter)
        .await
        .map_err(|e| ApiError::store(e, &ctx.request_id))?;
    Ok(Json(ListImagesResponse { items }))
}
