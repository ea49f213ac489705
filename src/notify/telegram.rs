//! Telegram bot notifications
//!
//! Text goes through `sendMessage`. With an attachment the snapshot is
//! sent through `sendPhoto` with the message as caption; an unreadable
//! file falls back to plain text.

use super::{map_ureq_error, run_blocking, NotificationChannel, Priority};
use crate::error::NotifyError;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const API_BASE: &str = "https://api.telegram.org";

pub struct TelegramChannel {
    base_url: String,
    chat_id: String,
    agent: ureq::Agent,
}

impl TelegramChannel {
    pub fn new(bot_token: &str, chat_id: &str) -> Self {
        Self::with_api_base(API_BASE, bot_token, chat_id)
    }

    fn with_api_base(api_base: &str, bot_token: &str, chat_id: &str) -> Self {
        Self {
            base_url: format!("{}/bot{}", api_base.trim_end_matches('/'), bot_token),
            chat_id: chat_id.to_string(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(15))
                .build(),
        }
    }

    fn send_message(agent: &ureq::Agent, base_url: &str, chat_id: &str, text: &str) -> Result<(), NotifyError> {
        agent
            .get(&format!("{}/sendMessage", base_url))
            .query("chat_id", chat_id)
            .query("text", text)
            .call()
            .map_err(|e| map_ureq_error("telegram", e))?;
        tracing::info!("Telegram message sent");
        Ok(())
    }

    fn send_photo(
        agent: &ureq::Agent,
        base_url: &str,
        chat_id: &str,
        caption: &str,
        photo: &[u8],
    ) -> Result<(), NotifyError> {
        let (content_type, body) = multipart_photo(chat_id, caption, photo);
        agent
            .post(&format!("{}/sendPhoto", base_url))
            .set("Content-Type", &content_type)
            .send_bytes(&body)
            .map_err(|e| map_ureq_error("telegram", e))?;
        tracing::info!("Telegram photo sent");
        Ok(())
    }
}

/// Build a multipart/form-data body with chat_id, caption and a PNG photo.
/// Returns the content type (with boundary) and the body.
fn multipart_photo(chat_id: &str, caption: &str, photo: &[u8]) -> (String, Vec<u8>) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let boundary = format!("----cribwatch{:x}", nanos);

    let mut body = Vec::with_capacity(photo.len() + 512);
    for (name, value) in [("chat_id", chat_id), ("caption", caption)] {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                boundary, name, value
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"photo\"; filename=\"snapshot.png\"\r\nContent-Type: image/png\r\n\r\n",
            boundary
        )
        .as_bytes(),
    );
    body.extend_from_slice(photo);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    (format!("multipart/form-data; boundary={}", boundary), body)
}

#[async_trait::async_trait]
impl NotificationChannel for TelegramChannel {
    async fn send(
        &self,
        message: &str,
        _priority: Priority,
        attachment: Option<&Path>,
    ) -> Result<(), NotifyError> {
        let photo = match attachment {
            Some(path) => match std::fs::read(path) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!("Could not open image {:?} ({}), sending text only", path, e);
                    None
                }
            },
            None => None,
        };

        let agent = self.agent.clone();
        let base_url = self.base_url.clone();
        let chat_id = self.chat_id.clone();
        let message = message.to_string();

        run_blocking(move || match photo {
            Some(bytes) => Self::send_photo(&agent, &base_url, &chat_id, &message, &bytes),
            None => Self::send_message(&agent, &base_url, &chat_id, &message),
        })
        .await
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}
