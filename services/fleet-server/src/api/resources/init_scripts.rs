//! Init script delivery.

use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};
use fleet_id::InstanceBuildId;

use crate::api::auth::Authenticated;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub const SHELL_SCRIPT_CONTENT_TYPE: &str = "text/x-shellscript";

pub fn routes() -> Router<AppState> {
    Router::new().route("/init-scripts/{build_id}", get(get_init_script))
}

/// GET /init-scripts/{build_id}
async fn get_init_script(
    State(state): State<AppState>,
    ctx: RequestContext,
    _auth: Authenticated,
    Path(build_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let build_id = InstanceBuildId::parse(&build_id).map_err(|e| {
        ApiError::bad_request("invalid_build_id", e.to_string())
            .with_request_id(ctx.request_id.clone())
    })?;

    let script = state
        .db()
        .bootstrap()
        .script(&build_id)
        .await
        .map_err(|e| ApiError::store(e, &ctx.request_id))?
        .ok_or_else(|| {
            ApiError::not_found("init_script_not_found", "No init script for this build")
                .with_request_id(ctx.request_id.clone())
        })?;

    Ok(([(header::CONTENT_TYPE, SHELL_SCRIPT_CONTENT_TYPE)], script))
}
