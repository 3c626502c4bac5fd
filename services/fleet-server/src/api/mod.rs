//! HTTP API handlers and routing.

pub mod auth;
pub mod error;
mod health;
pub mod request_context;
mod resources;

use axum::{
    http::{header, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

pub use resources::{MAX_BUILD_COUNT, SHELL_SCRIPT_CONTENT_TYPE};

use request_context::{request_id_header, MakeFleetRequestId};

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    Router::new()
        // Health endpoints (no auth required)
        .merge(health::routes())
        .merge(resources::routes(&state))
        // Layers run bottom-up: the id is set before tracing sees the request.
        .layer(PropagateRequestIdLayer::new(request_id_header()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetRequestIdLayer::new(request_id_header(), MakeFleetRequestId))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::AuthGate;
    use crate::db::Database;
    use crate::notify::NullNotifier;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use fleet_events::{AutoscalingGroupBuild, Job};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state() -> AppState {
        AppState::new(
            Database::in_memory(),
            Arc::new(NullNotifier),
            AuthGate::new("op-token"),
        )
    }

    #[tokio::test]
    async fn test_router_sets_request_id() {
        let response = create_router(state())
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers()[request_context::REQUEST_ID_HEADER].to_str().unwrap();
        assert!(id.starts_with("req_"));
    }

    #[tokio::test]
    async fn test_operator_route_without_credentials_is_challenged() {
        let response = create_router(state())
            .oneshot(Request::get("/instances").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[tokio::test]
    async fn test_autoscaling_build_is_enqueued() {
        let state = state();
        let body = serde_json::json!({
            "instance_id": "i-abc",
            "queue": "docker",
            "env": "prod",
            "site": "org",
            "role": "worker",
            "role_arn": "arn:role",
            "topic_arn": "arn:topic",
            "min_size": 1,
            "max_size": 3,
            "desired_capacity": 1
        });
        let response = create_router(state.clone())
            .oneshot(
                Request::post("/autoscaling-group-builds")
                    .header(header::AUTHORIZATION, "token op-token")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let build: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(build["instance_id"], "i-abc");
        assert_eq!(
            state
                .db()
                .queue()
                .depth(AutoscalingGroupBuild::QUEUE)
                .await
                .unwrap(),
            1
        );
    }
}
