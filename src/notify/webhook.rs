//! Generic JSON webhook (Home Assistant, n8n and friends)

use super::{map_ureq_error, run_blocking, NotificationChannel, Priority};
use crate::error::NotifyError;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct Payload<'a> {
    message: &'a str,
    priority: &'a str,
    source: &'a str,
}

pub struct WebhookChannel {
    url: String,
    agent: ureq::Agent,
}

impl WebhookChannel {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(10))
                .build(),
        }
    }
}

#[async_trait::async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(
        &self,
        message: &str,
        priority: Priority,
        _attachment: Option<&Path>,
    ) -> Result<(), NotifyError> {
        let body = serde_json::to_value(Payload {
            message,
            priority: priority.as_str(),
            source: "cribwatch",
        })
        .map_err(|e| NotifyError::Request(e.to_string()))?;
        let agent = self.agent.clone();
        let url = self.url.clone();

        run_blocking(move || {
            agent
                .post(&url)
                .send_json(body)
                .map_err(|e| map_ureq_error("webhook", e))?;
            tracing::info!("Webhook notification sent to {}", url);
            Ok(())
        })
        .await
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}
