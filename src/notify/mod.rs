//! Notification dispatch
//!
//! Alerts fan out to every configured channel. A per-event-type cooldown
//! is checked and set under one lock before any channel is tried, so two
//! racing callers for the same event type produce one delivery attempt.
//! Channels fail independently; every attempt is written to the audit log.

pub mod desktop;
pub mod pushover;
pub mod telegram;
pub mod webhook;

use crate::clock::SharedClock;
use crate::config::NotificationConfig;
use crate::error::NotifyError;
use crate::store::{EventStore, NotificationRecord};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

/// Alert category; the cooldown is tracked per category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BabyWokeUp,
    BabyFellAsleep,
    CryStarted,
    DiaperReminder,
    FeedingReminder,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::BabyWokeUp,
        EventKind::BabyFellAsleep,
        EventKind::CryStarted,
        EventKind::DiaperReminder,
        EventKind::FeedingReminder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BabyWokeUp => "baby_woke_up",
            EventKind::BabyFellAsleep => "baby_fell_asleep",
            EventKind::CryStarted => "baby_crying",
            EventKind::DiaperReminder => "diaper_reminder",
            EventKind::FeedingReminder => "feeding_reminder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

/// A queued alert
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub kind: EventKind,
    pub message: String,
    pub priority: Priority,
    pub attachment: Option<PathBuf>,
}

impl Alert {
    pub fn new(kind: EventKind, message: impl Into<String>, priority: Priority) -> Self {
        Self {
            kind,
            message: message.into(),
            priority,
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, path: PathBuf) -> Self {
        self.attachment = Some(path);
        self
    }
}

/// A delivery channel
#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(
        &self,
        message: &str,
        priority: Priority,
        attachment: Option<&Path>,
    ) -> Result<(), NotifyError>;

    /// Stable name used in logs and the audit log
    fn name(&self) -> &'static str;
}

/// Runs a blocking HTTP call off the async runtime
pub(crate) async fn run_blocking<F>(f: F) -> Result<(), NotifyError>
where
    F: FnOnce() -> Result<(), NotifyError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| NotifyError::Request(format!("delivery task failed: {}", e)))?
}

/// Maps a ureq failure onto the channel's error
pub(crate) fn map_ureq_error(channel: &'static str, e: ureq::Error) -> NotifyError {
    match e {
        ureq::Error::Status(status, _) => NotifyError::Status { channel, status },
        ureq::Error::Transport(t) => NotifyError::Request(t.to_string()),
    }
}

/// Shared set of disabled alert categories, togglable at runtime
#[derive(Debug, Clone, Default)]
pub struct NotificationCategories {
    disabled: Arc<RwLock<HashSet<EventKind>>>,
}

impl NotificationCategories {
    /// Build from config names; unknown names are logged and ignored
    pub fn from_names(names: &[String]) -> Self {
        let categories = Self::default();
        for name in names {
            match EventKind::parse(name) {
                Some(kind) => categories.set_enabled(kind, false),
                None => tracing::warn!("Unknown notification category '{}' in config", name),
            }
        }
        categories
    }

    pub fn set_enabled(&self, kind: EventKind, enabled: bool) {
        let mut disabled = self.disabled.write().unwrap_or_else(|e| e.into_inner());
        if enabled {
            disabled.remove(&kind);
        } else {
            disabled.insert(kind);
        }
    }

    pub fn is_enabled(&self, kind: EventKind) -> bool {
        !self
            .disabled
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&kind)
    }
}

/// Fans an alert out to every channel under a per-event-type cooldown
pub struct Dispatcher {
    channels: Vec<Box<dyn NotificationChannel>>,
    cooldown: Duration,
    last_sent: Mutex<HashMap<EventKind, DateTime<Utc>>>,
    categories: NotificationCategories,
    store: Option<Arc<dyn EventStore>>,
    clock: SharedClock,
}

impl Dispatcher {
    pub fn new(
        channels: Vec<Box<dyn NotificationChannel>>,
        cooldown: Duration,
        categories: NotificationCategories,
        store: Option<Arc<dyn EventStore>>,
        clock: SharedClock,
    ) -> Self {
        if channels.is_empty() {
            tracing::info!("No notification channels configured");
        }
        Self {
            channels,
            cooldown,
            last_sent: Mutex::new(HashMap::new()),
            categories,
            store,
            clock,
        }
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Claim the cooldown slot for `kind`. Check and set happen under one
    /// lock; the slot is taken whether or not delivery later succeeds.
    fn claim(&self, kind: EventKind, now: DateTime<Utc>) -> bool {
        let mut last_sent = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&last) = last_sent.get(&kind) {
            let elapsed = now - last;
            if elapsed < self.cooldown {
                tracing::debug!(
                    "Notification cooldown for {} ({}s remaining)",
                    kind,
                    (self.cooldown - elapsed).num_seconds()
                );
                return false;
            }
        }
        last_sent.insert(kind, now);
        true
    }

    /// Send to every channel. True iff at least one channel delivered.
    pub async fn notify(
        &self,
        kind: EventKind,
        message: &str,
        priority: Priority,
        attachment: Option<&Path>,
    ) -> bool {
        if !self.categories.is_enabled(kind) {
            tracing::debug!("Notifications for {} are disabled", kind);
            return false;
        }
        let now = self.clock.now();
        if !self.claim(kind, now) {
            return false;
        }

        let mut sent = false;
        for channel in &self.channels {
            let delivered = match channel.send(message, priority, attachment).await {
                Ok(()) => {
                    tracing::debug!("{} delivered {}", channel.name(), kind);
                    true
                }
                Err(e) => {
                    tracing::error!("Failed to send via {}: {}", channel.name(), e);
                    false
                }
            };
            sent |= delivered;
            self.audit(kind, channel.name(), message, delivered, now)
                .await;
        }

        if sent {
            tracing::info!("Notification sent [{}]: {}", kind, message);
        }
        sent
    }

    pub async fn dispatch(&self, alert: &Alert) -> bool {
        self.notify(
            alert.kind,
            &alert.message,
            alert.priority,
            alert.attachment.as_deref(),
        )
        .await
    }

    /// Record one delivery attempt. SQLite writes run on the blocking pool.
    async fn audit(
        &self,
        kind: EventKind,
        channel: &str,
        message: &str,
        delivered: bool,
        at: DateTime<Utc>,
    ) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let record = NotificationRecord {
            at,
            event_type: kind.as_str().to_string(),
            channel: channel.to_string(),
            message: message.to_string(),
            delivered,
        };
        match tokio::task::spawn_blocking(move || store.append_notification(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Failed to log notification: {}", e),
            Err(e) => tracing::error!("Notification log task failed: {}", e),
        }
    }
}

/// Build the channels enabled in config
pub fn create_channels(config: &NotificationConfig) -> Vec<Box<dyn NotificationChannel>> {
    let mut channels: Vec<Box<dyn NotificationChannel>> = Vec::new();

    if let Some(ref p) = config.pushover {
        if !p.app_token.is_empty() && !p.user_key.is_empty() {
            channels.push(Box::new(pushover::PushoverChannel::new(
                &p.app_token,
                &p.user_key,
            )));
            tracing::info!("Pushover notifications enabled");
        }
    }

    if let Some(ref t) = config.telegram {
        if !t.bot_token.is_empty() && !t.chat_id.is_empty() {
            channels.push(Box::new(telegram::TelegramChannel::new(
                &t.bot_token,
                &t.chat_id,
            )));
            tracing::info!("Telegram notifications enabled");
        }
    }

    if let Some(ref w) = config.webhook {
        if !w.url.is_empty() {
            channels.push(Box::new(webhook::WebhookChannel::new(&w.url)));
            tracing::info!("Webhook notifications enabled");
        }
    }

    if config.desktop.enabled {
        channels.push(Box::new(desktop::DesktopChannel::new()));
        tracing::info!("Desktop notifications enabled");
    }

    channels
}

/// Deliver queued alerts until every sender is gone
pub async fn run_notifications(dispatcher: Arc<Dispatcher>, mut alerts: mpsc::Receiver<Alert>) {
    while let Some(alert) = alerts.recv().await {
        dispatcher.dispatch(&alert).await;
    }
    tracing::debug!("Alert queue closed");
}
