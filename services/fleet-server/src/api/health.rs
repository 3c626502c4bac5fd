//! Liveness and readiness endpoints.
//!
//! `/healthz` and `/livez` answer without touching the store. `/readyz`
//! pings the store and reports the backlog of every known queue, so a
//! stuck consumer pool shows up as a growing depth.

use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use fleet_events::KNOWN_QUEUES;
use serde::Serialize;
use tracing::warn;

use crate::state::AppState;

const SERVICE: &str = "fleetd";

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: Status,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Readiness>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Degraded,
}

/// Store reachability and queue backlog.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct Readiness {
    pub store: Status,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,

    /// Pending jobs per queue. Empty when the store is unreachable.
    pub queue_depths: BTreeMap<String, usize>,
}

impl HealthResponse {
    fn new(status: Status, readiness: Option<Readiness>) -> Self {
        Self {
            status,
            service: SERVICE.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            readiness,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

/// Process is up. The keepalive job pings this.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse::new(Status::Ok, None))
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let readiness = match state.db().health_check().await {
        Ok(()) => {
            let queue = state.db().queue();
            let mut queue_depths = BTreeMap::new();
            for name in KNOWN_QUEUES {
                match queue.depth(name).await {
                    Ok(depth) => {
                        queue_depths.insert(name.to_string(), depth);
                    }
                    Err(e) => warn!(queue = name, error = %e, "Failed to read queue depth"),
                }
            }
            Readiness {
                store: Status::Ok,
                store_error: None,
                queue_depths,
            }
        }
        Err(e) => Readiness {
            store: Status::Degraded,
            store_error: Some(e.to_string()),
            queue_depths: BTreeMap::new(),
        },
    };

    let (code, status) = match readiness.store {
        Status::Ok => (StatusCode::OK, Status::Ok),
        Status::Degraded => (StatusCode::SERVICE_UNAVAILABLE, Status::Degraded),
    };
    (code, Json(HealthResponse::new(status, Some(readiness))))
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
