//! Notification topic subscription confirmation.

use std::time::Duration;

use async_trait::async_trait;
use fleet_events::{RawEnvelope, SnsSubscriptionConfirmation};
use tracing::{info, instrument};

use crate::workers::{HandlerError, JobHandler};

/// Confirms a topic subscription by fetching its subscribe URL.
pub struct SnsConfirmer {
    client: reqwest::Client,
}

impl SnsConfirmer {
    pub fn new() -> Result<Self, HandlerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        Ok(Self { client })
    }

    #[instrument(skip(self, confirmation), fields(topic_arn = %confirmation.topic_arn))]
    pub async fn confirm(
        &self,
        confirmation: &SnsSubscriptionConfirmation,
    ) -> Result<(), HandlerError> {
        let response = self
            .client
            .get(&confirmation.subscribe_url)
            .send()
            .await
            .map_err(|e| HandlerError::Fatal(format!("subscribe request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HandlerError::Fatal(format!(
                "subscribe request returned {status}: {body}"
            )));
        }

        info!("Subscription confirmed");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for SnsConfirmer {
    async fn handle(&self, envelope: &RawEnvelope) -> Result<(), HandlerError> {
        let confirmation: SnsSubscriptionConfirmation = envelope.decode_arg()?;
        self.confirm(&confirmation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn confirmation(url: String) -> SnsSubscriptionConfirmation {
        SnsSubscriptionConfirmation {
            topic_arn: "arn:topic/lifecycle".to_string(),
            subscribe_url: url,
        }
    }

    #[tokio::test]
    async fn test_confirm_fetches_subscribe_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/confirm"))
            .and(query_param("Token", "abc"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        SnsConfirmer::new()
            .unwrap()
            .confirm(&confirmation(format!("{}/confirm?Token=abc", server.uri())))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_confirm_rejected_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("expired"))
            .mount(&server)
            .await;

        let err = SnsConfirmer::new()
            .unwrap()
            .confirm(&confirmation(format!("{}/confirm", server.uri())))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expired"));
    }
}
