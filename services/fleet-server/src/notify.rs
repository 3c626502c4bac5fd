//! Outbound notifications and error reporting.
//!
//! - [`Notifier`]: human-facing chat messages (Slack incoming webhook)
//! - [`ErrorReporter`]: where failed jobs are reported before redelivery
//!
//! Notifications are best effort: callers log a failed notification and
//! carry on rather than failing the job that produced it.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Notification delivery errors.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport error: {0}")]
    Transport(String),

    #[error("notification rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Chat notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Posts `text` to `channel`. An empty channel means the default one.
    async fn notify(&self, channel: &str, text: &str) -> Result<(), NotifyError>;
}

/// Sends a notification and logs instead of failing.
pub async fn notify_best_effort(notifier: &dyn Notifier, channel: &str, text: &str) {
    if let Err(e) = notifier.notify(channel, text).await {
        warn!(error = %e, channel, "Failed to send notification");
    }
}

#[derive(Debug, Serialize)]
struct SlackMessage<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    channel: &'a str,
    text: &'a str,
    username: &'a str,
}

/// Slack incoming-webhook notifier.
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
    default_channel: String,
}

impl SlackNotifier {
    pub fn new(
        webhook_url: impl Into<String>,
        default_channel: impl Into<String>,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
            default_channel: default_channel.into(),
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, channel: &str, text: &str) -> Result<(), NotifyError> {
        let channel = if channel.is_empty() {
            self.default_channel.as_str()
        } else {
            channel
        };
        let message = SlackMessage {
            channel,
            text,
            username: "fleetd",
        };

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&message)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected { status, body });
        }

        debug!(channel, "Sent Slack notification");
        Ok(())
    }
}

/// Notifier used when no webhook is configured. Logs and drops.
#[derive(Debug, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, channel: &str, text: &str) -> Result<(), NotifyError> {
        debug!(channel, text, "Notification dropped, no webhook configured");
        Ok(())
    }
}

/// Notifier that keeps every message, for tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(channel, text)` pairs in send order.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, String)>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, channel: &str, text: &str) -> Result<(), NotifyError> {
        self.lock().push((channel.to_string(), text.to_string()));
        Ok(())
    }
}

/// What a failed job was when it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub queue: String,
    pub class: String,
    pub job_id: String,
    pub retry_count: u32,
}

/// Sink for job failures.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, context: &JobContext, error: &(dyn std::error::Error + 'static));
}

/// Reports failures as structured error logs.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, context: &JobContext, err: &(dyn std::error::Error + 'static)) {
        error!(
            queue = %context.queue,
            class = %context.class,
            job_id = %context.job_id,
            retry_count = context.retry_count,
            error = %err,
            "Job failed"
        );
    }
}

/// Reporter that keeps every report, for tests.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(JobContext, String)>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(context, error message)` pairs in report order.
    pub fn reports(&self) -> Vec<(JobContext, String)> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, context: &JobContext, err: &(dyn std::error::Error + 'static)) {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((context.clone(), err.to_string()));
    }
}
