//! Diaper and feeding reminders
//!
//! Each reminder looks at the most recent logged event of its kind and
//! fires once the gap exceeds its threshold, then stays quiet for a
//! cooldown before it may fire again.

use crate::clock::SharedClock;
use crate::config::ReminderConfig;
use crate::notify::{Alert, EventKind, Priority};
use crate::store::{EventStore, RecordKind};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a reminder watches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderKind {
    Diaper,
    Feeding,
}

impl ReminderKind {
    fn record_kind(&self) -> RecordKind {
        match self {
            ReminderKind::Diaper => RecordKind::Diaper,
            ReminderKind::Feeding => RecordKind::Feeding,
        }
    }

    pub fn event_kind(&self) -> EventKind {
        match self {
            ReminderKind::Diaper => EventKind::DiaperReminder,
            ReminderKind::Feeding => EventKind::FeedingReminder,
        }
    }
}

/// A reminder that has come due
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReminderDue {
    pub kind: ReminderKind,
    /// Hours since the last logged event, rounded to one decimal
    pub hours_since: f64,
}

impl ReminderDue {
    pub fn message(&self) -> String {
        match self.kind {
            ReminderKind::Diaper => {
                format!("No diaper change logged in {:.1} hours", self.hours_since)
            }
            ReminderKind::Feeding => {
                format!("No feeding logged in {:.1} hours", self.hours_since)
            }
        }
    }

    pub fn alert(&self) -> Alert {
        Alert::new(self.kind.event_kind(), self.message(), Priority::Normal)
    }
}

#[derive(Debug)]
pub struct Reminder {
    kind: ReminderKind,
    threshold_hours: f64,
    cooldown: Duration,
    last_fired: Option<DateTime<Utc>>,
}

impl Reminder {
    pub fn new(kind: ReminderKind, threshold_hours: f64, cooldown: Duration) -> Self {
        Self {
            kind,
            threshold_hours,
            cooldown,
            last_fired: None,
        }
    }

    pub fn diaper(config: &ReminderConfig) -> Self {
        Self::new(
            ReminderKind::Diaper,
            config.diaper_hours,
            Duration::seconds(config.cooldown_secs as i64),
        )
    }

    pub fn feeding(config: &ReminderConfig) -> Self {
        Self::new(
            ReminderKind::Feeding,
            config.feeding_hours,
            Duration::seconds(config.cooldown_secs as i64),
        )
    }

    pub fn kind(&self) -> ReminderKind {
        self.kind
    }

    pub fn last_fired(&self) -> Option<DateTime<Utc>> {
        self.last_fired
    }

    /// Check whether the reminder is due. Nothing logged yet means nothing
    /// to remind about. Store failures are logged and treated as not due.
    pub fn check(&mut self, store: &dyn EventStore, now: DateTime<Utc>) -> Option<ReminderDue> {
        let last = match store.read_recent(self.kind.record_kind(), 1, None) {
            Ok(records) => records.first()?.timestamp(),
            Err(e) => {
                tracing::warn!("Reminder could not read {:?} events: {}", self.kind, e);
                return None;
            }
        };

        let hours_since = (now - last).num_seconds() as f64 / 3600.0;
        if hours_since < self.threshold_hours {
            return None;
        }
        if let Some(fired) = self.last_fired {
            if now - fired < self.cooldown {
                return None;
            }
        }

        self.last_fired = Some(now);
        Some(ReminderDue {
            kind: self.kind,
            hours_since: (hours_since * 10.0).round() / 10.0,
        })
    }
}

/// Poll all reminders on a fixed interval and queue alerts for due ones
pub async fn run_reminders(
    mut reminders: Vec<Reminder>,
    store: Arc<dyn EventStore>,
    clock: SharedClock,
    alerts: mpsc::Sender<Alert>,
    interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let now = clock.now();
        let store = store.clone();
        // Store reads are synchronous SQLite calls
        let checked = tokio::task::spawn_blocking(move || {
            let due: Vec<ReminderDue> = reminders
                .iter_mut()
                .filter_map(|r| r.check(store.as_ref(), now))
                .collect();
            (reminders, due)
        })
        .await;
        let due = match checked {
            Ok((back, due)) => {
                reminders = back;
                due
            }
            Err(e) => {
                tracing::error!("Reminder check task failed: {}", e);
                return;
            }
        };

        for due in due {
            tracing::info!("{}", due.message());
            if alerts.send(due.alert()).await.is_err() {
                tracing::debug!("Alert queue closed, stopping reminders");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DiaperKind, FeedingEvent, FeedingKind, SqliteEventStore};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn diaper_reminder() -> Reminder {
        Reminder::diaper(&ReminderConfig::default())
    }

    #[test]
    fn test_fires_after_threshold_then_cools_down() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store
            .append_diaper_event(DiaperKind::Wet, None, t0() - Duration::hours(5))
            .unwrap();

        let mut reminder = diaper_reminder();
        let due = reminder.check(&store, t0()).unwrap();
        assert_eq!(due.kind, ReminderKind::Diaper);
        assert_eq!(due.hours_since, 5.0);
        assert_eq!(reminder.last_fired(), Some(t0()));

        // Immediate repeat is inside the cooldown
        assert!(reminder.check(&store, t0()).is_none());
        assert_eq!(reminder.last_fired(), Some(t0()));
        assert!(reminder.check(&store, t0() + Duration::seconds(1)).is_none());
        // ... and fires again once it has passed
        assert!(reminder
            .check(&store, t0() + Duration::seconds(300))
            .is_some());
    }

    #[test]
    fn test_recent_change_is_not_due() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store
            .append_diaper_event(DiaperKind::Dirty, None, t0() - Duration::hours(2))
            .unwrap();
        assert!(diaper_reminder().check(&store, t0()).is_none());
    }

    #[test]
    fn test_nothing_logged_never_reminds() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let mut reminder = diaper_reminder();
        assert!(reminder.check(&store, t0()).is_none());
        assert_eq!(reminder.last_fired(), None);
    }

    #[test]
    fn test_feeding_uses_its_own_threshold() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store
            .append_feeding_event(&FeedingEvent {
                at: t0() - Duration::minutes(200),
                kind: FeedingKind::Breast,
                duration_minutes: Some(20),
                amount_oz: None,
                notes: None,
            })
            .unwrap();
        // Diaper reminder has nothing to look at
        assert!(diaper_reminder().check(&store, t0()).is_none());

        let mut feeding = Reminder::feeding(&ReminderConfig::default());
        let due = feeding.check(&store, t0()).unwrap();
        assert_eq!(due.hours_since, 3.3);
        assert_eq!(due.alert().kind, EventKind::FeedingReminder);
    }

    #[tokio::test]
    async fn test_poll_loop_queues_alert() {
        use crate::clock::ManualClock;

        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        store
            .append_diaper_event(DiaperKind::Wet, None, t0() - Duration::hours(6))
            .unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let (tx, mut rx) = mpsc::channel(4);

        let handle = tokio::spawn(run_reminders(
            vec![diaper_reminder()],
            store,
            clock,
            tx,
            std::time::Duration::from_millis(10),
        ));

        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.kind, EventKind::DiaperReminder);
        assert!(alert.message.contains("6.0 hours"));
        handle.abort();
    }

    #[tokio::test]
    async fn test_poll_loop_reads_store_off_the_runtime_thread() {
        use crate::clock::ManualClock;
        use crate::store::test_support::ThreadTrackingStore;

        let store = Arc::new(ThreadTrackingStore::default());
        store
            .append_diaper_event(DiaperKind::Wet, None, t0() - Duration::hours(6))
            .unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = tokio::spawn(run_reminders(
            vec![diaper_reminder()],
            store.clone(),
            Arc::new(ManualClock::new(t0())),
            tx,
            std::time::Duration::from_millis(10),
        ));

        rx.recv().await.unwrap();
        handle.abort();
        let threads = store.threads();
        assert!(!threads.is_empty());
        assert!(threads.iter().all(|&id| id != std::thread::current().id()));
    }
}
