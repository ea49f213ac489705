//! Pushover push notifications
//!
//! Images are sent inline as `attachment_base64` so the request stays a
//! plain form post.

use super::{map_ureq_error, run_blocking, NotificationChannel, Priority};
use crate::error::NotifyError;
use base64::Engine;
use std::path::Path;
use std::time::Duration;

const API_URL: &str = "https://api.pushover.net/1/messages.json";

/// Pushover priority for an alert priority
pub fn pushover_priority(priority: Priority) -> i32 {
    match priority {
        Priority::Low => -1,
        Priority::Normal => 0,
        Priority::High => 1,
        Priority::Urgent => 2,
    }
}

pub struct PushoverChannel {
    app_token: String,
    user_key: String,
    api_url: String,
    agent: ureq::Agent,
}

impl PushoverChannel {
    pub fn new(app_token: &str, user_key: &str) -> Self {
        Self {
            app_token: app_token.to_string(),
            user_key: user_key.to_string(),
            api_url: API_URL.to_string(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(10))
                .build(),
        }
    }

    #[cfg(test)]
    fn with_api_url(mut self, url: &str) -> Self {
        self.api_url = url.to_string();
        self
    }

    /// Form fields for one message
    fn form(
        &self,
        message: &str,
        priority: Priority,
        attachment: Option<&Path>,
    ) -> Vec<(&'static str, String)> {
        let level = pushover_priority(priority);
        let mut form = vec![
            ("token", self.app_token.clone()),
            ("user", self.user_key.clone()),
            ("message", message.to_string()),
            ("priority", level.to_string()),
        ];

        // Emergency priority requires retry/expire
        if level == 2 {
            form.push(("retry", "60".to_string()));
            form.push(("expire", "300".to_string()));
        }

        if let Some(path) = attachment {
            match std::fs::read(path) {
                Ok(bytes) => {
                    form.push((
                        "attachment_base64",
                        base64::engine::general_purpose::STANDARD.encode(bytes),
                    ));
                    form.push(("attachment_type", "image/png".to_string()));
                }
                Err(e) => tracing::warn!("Could not attach image {:?}: {}", path, e),
            }
        }
        form
    }
}

#[async_trait::async_trait]
impl NotificationChannel for PushoverChannel {
    async fn send(
        &self,
        message: &str,
        priority: Priority,
        attachment: Option<&Path>,
    ) -> Result<(), NotifyError> {
        let form = self.form(message, priority, attachment);
        let agent = self.agent.clone();
        let url = self.api_url.clone();

        run_blocking(move || {
            let pairs: Vec<(&str, &str)> = form.iter().map(|(k, v)| (*k, v.as_str())).collect();
            agent
                .post(&url)
                .send_form(&pairs)
                .map_err(|e| map_ureq_error("pushover", e))?;
            tracing::info!("Pushover notification sent (priority={})", priority.as_str());
            Ok(())
        })
        .await
    }

    fn name(&self) -> &'static str {
        "pushover"
    }
}
