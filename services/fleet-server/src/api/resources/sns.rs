//! Notification topic intake.
//!
//! The topic posts its envelope as a JSON document, usually with a
//! `text/plain` content type, so the body is read as a string.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use fleet_events::SnsSubscriptionConfirmation;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::reconcile::{IngestOutcome, LifecycleNotification};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/sns-messages", post(receive_message))
}

/// Topic message envelope.
#[derive(Debug, Deserialize)]
pub struct SnsMessage {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "TopicArn", default)]
    pub topic_arn: String,
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "SubscribeURL", default)]
    pub subscribe_url: String,
}

#[derive(Debug, Serialize)]
pub struct SnsResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// POST /sns-messages
async fn receive_message(
    State(state): State<AppState>,
    ctx: RequestContext,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let message: SnsMessage = serde_json::from_str(&body).map_err(|e| {
        ApiError::bad_request("invalid_message", format!("Unreadable topic message: {e}"))
            .with_request_id(ctx.request_id.clone())
    })?;

    match message.kind.as_str() {
        "SubscriptionConfirmation" => {
            if message.subscribe_url.is_empty() {
                return Err(
                    ApiError::bad_request("invalid_message", "SubscribeURL is required")
                        .with_request_id(ctx.request_id),
                );
            }
            state
                .db()
                .queue()
                .push(SnsSubscriptionConfirmation {
                    topic_arn: message.topic_arn.clone(),
                    subscribe_url: message.subscribe_url,
                })
                .await
                .map_err(|e| ApiError::store(e, &ctx.request_id))?;
            info!(topic_arn = %message.topic_arn, "Subscription confirmation enqueued");
            Ok((
                StatusCode::ACCEPTED,
                Json(SnsResponse {
                    status: "enqueued",
                    detail: None,
                }),
            ))
        }
        "Notification" => {
            let notification: LifecycleNotification = serde_json::from_str(&message.message)
                .map_err(|e| {
                    ApiError::bad_request(
                        "invalid_message",
                        format!("Unreadable lifecycle notification: {e}"),
                    )
                    .with_request_id(ctx.request_id.clone())
                })?;

            let outcome = state
                .ingest()
                .ingest(&notification)
                .await
                .map_err(|e| ApiError::store(e, &ctx.request_id))?;

            Ok(match outcome {
                IngestOutcome::Enqueued(_) => (
                    StatusCode::ACCEPTED,
                    Json(SnsResponse {
                        status: "enqueued",
                        detail: None,
                    }),
                ),
                IngestOutcome::Ignored(reason) => (
                    StatusCode::OK,
                    Json(SnsResponse {
                        status: "ignored",
                        detail: Some(reason),
                    }),
                ),
            })
        }
        other => {
            debug!(kind = %other, "Ignoring topic message");
            Ok((
                StatusCode::OK,
                Json(SnsResponse {
                    status: "ignored",
                    detail: Some(format!("message type {other}")),
                }),
            ))
        }
    }
}
