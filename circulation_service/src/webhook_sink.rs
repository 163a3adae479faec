use anyhow::Context;
use async_trait::async_trait;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use reqwest_tracing::TracingMiddleware;

use circulation_engine::api::PatronId;
use circulation_engine::notifications::{Notification, NotificationSink};

const MAX_RETRIES: u32 = 3;

/// Forwards every notification to an external endpoint as
/// `{"patron_id": .., "message": ..}`.
pub struct WebhookNotificationSink {
    url: String,
    client: ClientWithMiddleware,
}

impl WebhookNotificationSink {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .build()
            .context("Failed to build reqwest client")?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_RETRIES);
        let client = ClientBuilder::new(reqwest_client)
            .with(TracingMiddleware::default())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotificationSink {
    async fn notify(&self, patron_id: PatronId, message: &str) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(&Notification {
                patron_id,
                message: message.to_string(),
            })
            .send()
            .await
            .context("Failed to call notification webhook")?
            .error_for_status()
            .context("Notification webhook refused the message")?;
        Ok(())
    }
}
