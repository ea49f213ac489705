//! Event store
//!
//! Append/read contract for every persisted event kind, plus a SQLite
//! implementation. Timestamps are stored as RFC 3339 UTC text so that
//! lexical order is time order.

use crate::cry::Intensity;
use crate::error::StoreError;
use crate::sleep::SleepState;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Kind of diaper change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiaperKind {
    Wet,
    Dirty,
    Both,
    Dry,
}

impl DiaperKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiaperKind::Wet => "wet",
            DiaperKind::Dirty => "dirty",
            DiaperKind::Both => "both",
            DiaperKind::Dry => "dry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "wet" => Some(DiaperKind::Wet),
            "dirty" => Some(DiaperKind::Dirty),
            "both" => Some(DiaperKind::Both),
            "dry" => Some(DiaperKind::Dry),
            _ => None,
        }
    }

    pub fn is_wet(&self) -> bool {
        matches!(self, DiaperKind::Wet | DiaperKind::Both)
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self, DiaperKind::Dirty | DiaperKind::Both)
    }
}

/// Kind of feeding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedingKind {
    Breast,
    Bottle,
    Solid,
}

impl FeedingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedingKind::Breast => "breast",
            FeedingKind::Bottle => "bottle",
            FeedingKind::Solid => "solid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "breast" => Some(FeedingKind::Breast),
            "bottle" => Some(FeedingKind::Bottle),
            "solid" => Some(FeedingKind::Solid),
            _ => None,
        }
    }
}

/// A logged sleep transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SleepEvent {
    pub state: SleepState,
    pub start: DateTime<Utc>,
    pub confidence: Option<f32>,
    /// De-duplicated reasons that led to the transition
    pub reasons: Vec<String>,
}

/// A cry episode; `end` and `duration_seconds` are set once on closure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CryEvent {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub intensity: Intensity,
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiaperEvent {
    pub at: DateTime<Utc>,
    pub kind: DiaperKind,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedingEvent {
    pub at: DateTime<Utc>,
    pub kind: FeedingKind,
    pub duration_minutes: Option<u32>,
    pub amount_oz: Option<f32>,
    pub notes: Option<String>,
}

/// Audit record of one notification channel attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationRecord {
    pub at: DateTime<Utc>,
    pub event_type: String,
    pub channel: String,
    pub message: String,
    pub delivered: bool,
}

/// Open or close a cry episode
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CryEventUpdate {
    Open {
        start: DateTime<Utc>,
        intensity: Intensity,
    },
    /// Closes the most recent open episode
    Close {
        end: DateTime<Utc>,
        duration_seconds: i64,
    },
}

/// Which table `read_recent` reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Sleep,
    Cry,
    Diaper,
    Feeding,
    Notification,
}

impl RecordKind {
    fn table(&self) -> &'static str {
        match self {
            RecordKind::Sleep => "sleep_events",
            RecordKind::Cry => "cry_events",
            RecordKind::Diaper => "diaper_events",
            RecordKind::Feeding => "feeding_events",
            RecordKind::Notification => "notifications_log",
        }
    }

    fn time_column(&self) -> &'static str {
        match self {
            RecordKind::Sleep | RecordKind::Cry => "start_time",
            _ => "timestamp",
        }
    }
}

/// Any persisted event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EventRecord {
    Sleep(SleepEvent),
    Cry(CryEvent),
    Diaper(DiaperEvent),
    Feeding(FeedingEvent),
    Notification(NotificationRecord),
}

impl EventRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EventRecord::Sleep(e) => e.start,
            EventRecord::Cry(e) => e.start,
            EventRecord::Diaper(e) => e.at,
            EventRecord::Feeding(e) => e.at,
            EventRecord::Notification(e) => e.at,
        }
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = self.timestamp().with_timezone(&chrono::Local);
        let at = at.format("%Y-%m-%d %H:%M:%S");
        match self {
            EventRecord::Sleep(e) => {
                write!(f, "{}  {}", at, e.state)?;
                if let Some(c) = e.confidence {
                    write!(f, " ({:.2})", c)?;
                }
                if !e.reasons.is_empty() {
                    write!(f, "  [{}]", e.reasons.join(", "))?;
                }
                Ok(())
            }
            EventRecord::Cry(e) => match e.duration_seconds {
                Some(d) => write!(f, "{}  {} for {}s", at, e.intensity, d),
                None => write!(f, "{}  {} (ongoing)", at, e.intensity),
            },
            EventRecord::Diaper(e) => {
                write!(f, "{}  {}", at, e.kind.as_str())?;
                if let Some(ref notes) = e.notes {
                    write!(f, "  {}", notes)?;
                }
                Ok(())
            }
            EventRecord::Feeding(e) => {
                write!(f, "{}  {}", at, e.kind.as_str())?;
                if let Some(m) = e.duration_minutes {
                    write!(f, " {}min", m)?;
                }
                if let Some(oz) = e.amount_oz {
                    write!(f, " {:.1}oz", oz)?;
                }
                if let Some(ref notes) = e.notes {
                    write!(f, "  {}", notes)?;
                }
                Ok(())
            }
            EventRecord::Notification(e) => write!(
                f,
                "{}  {} via {} [{}] {}",
                at,
                e.event_type,
                e.channel,
                if e.delivered { "delivered" } else { "failed" },
                e.message
            ),
        }
    }
}

/// Append/read capability for all event kinds
pub trait EventStore: Send + Sync {
    fn append_sleep_event(
        &self,
        state: SleepState,
        confidence: f32,
        reasons: &[String],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn append_cry_event(&self, update: CryEventUpdate) -> Result<(), StoreError>;

    fn append_diaper_event(
        &self,
        kind: DiaperKind,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn append_feeding_event(&self, event: &FeedingEvent) -> Result<(), StoreError>;

    fn append_notification(&self, record: &NotificationRecord) -> Result<(), StoreError>;

    /// Most recent first, at most `limit`, optionally only at or after `since`
    fn read_recent(
        &self,
        kind: RecordKind,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>, StoreError>;
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// SQLite-backed event store
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Open or create the database; schema errors are fatal
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        tracing::debug!("Opened event store at {:?}", path);
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sleep_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                start_time TEXT NOT NULL,
                end_time TEXT,
                state TEXT CHECK(state IN ('asleep', 'awake')),
                confidence REAL,
                detection_reasons TEXT
            );

            CREATE TABLE IF NOT EXISTS cry_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                start_time TEXT NOT NULL,
                end_time TEXT,
                intensity TEXT CHECK(intensity IN ('fussing', 'crying', 'screaming')),
                duration_seconds INTEGER
            );

            CREATE TABLE IF NOT EXISTS diaper_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                type TEXT CHECK(type IN ('wet', 'dirty', 'both', 'dry')),
                notes TEXT
            );

            CREATE TABLE IF NOT EXISTS feeding_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                type TEXT CHECK(type IN ('breast', 'bottle', 'solid')),
                duration_minutes INTEGER,
                amount_oz REAL,
                notes TEXT
            );

            CREATE TABLE IF NOT EXISTS notifications_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_type TEXT,
                channel TEXT,
                message TEXT,
                delivered INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_sleep_start ON sleep_events(start_time DESC);
            CREATE INDEX IF NOT EXISTS idx_cry_start ON cry_events(start_time DESC);
            CREATE INDEX IF NOT EXISTS idx_diaper_ts ON diaper_events(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_feeding_ts ON feeding_events(timestamp DESC);
            "#,
        )?;
        Ok(())
    }

    fn row_to_record(kind: RecordKind, row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
        Ok(match kind {
            RecordKind::Sleep => {
                let reasons: Option<String> = row.get("detection_reasons")?;
                let state: String = row.get("state")?;
                EventRecord::Sleep(SleepEvent {
                    state: SleepState::parse(&state).unwrap_or_default(),
                    start: parse_ts(&row.get::<_, String>("start_time")?),
                    confidence: row.get::<_, Option<f64>>("confidence")?.map(|c| c as f32),
                    reasons: reasons
                        .and_then(|r| serde_json::from_str(&r).ok())
                        .unwrap_or_default(),
                })
            }
            RecordKind::Cry => {
                let intensity: String = row.get("intensity")?;
                EventRecord::Cry(CryEvent {
                    start: parse_ts(&row.get::<_, String>("start_time")?),
                    end: row
                        .get::<_, Option<String>>("end_time")?
                        .map(|s| parse_ts(&s)),
                    intensity: Intensity::parse(&intensity).unwrap_or(Intensity::Crying),
                    duration_seconds: row.get("duration_seconds")?,
                })
            }
            RecordKind::Diaper => {
                let kind: String = row.get("type")?;
                EventRecord::Diaper(DiaperEvent {
                    at: parse_ts(&row.get::<_, String>("timestamp")?),
                    kind: DiaperKind::parse(&kind).unwrap_or(DiaperKind::Wet),
                    notes: row.get("notes")?,
                })
            }
            RecordKind::Feeding => {
                let kind: String = row.get("type")?;
                EventRecord::Feeding(FeedingEvent {
                    at: parse_ts(&row.get::<_, String>("timestamp")?),
                    kind: FeedingKind::parse(&kind).unwrap_or(FeedingKind::Bottle),
                    duration_minutes: row.get("duration_minutes")?,
                    amount_oz: row.get::<_, Option<f64>>("amount_oz")?.map(|a| a as f32),
                    notes: row.get("notes")?,
                })
            }
            RecordKind::Notification => EventRecord::Notification(NotificationRecord {
                at: parse_ts(&row.get::<_, String>("timestamp")?),
                event_type: row.get::<_, Option<String>>("event_type")?.unwrap_or_default(),
                channel: row.get::<_, Option<String>>("channel")?.unwrap_or_default(),
                message: row.get::<_, Option<String>>("message")?.unwrap_or_default(),
                delivered: row.get::<_, i64>("delivered")? != 0,
            }),
        })
    }
}

impl EventStore for SqliteEventStore {
    fn append_sleep_event(
        &self,
        state: SleepState,
        confidence: f32,
        reasons: &[String],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let reasons_json = if reasons.is_empty() {
            None
        } else {
            Some(serde_json::to_string(reasons)?)
        };
        self.conn()?.execute(
            "INSERT INTO sleep_events (start_time, state, confidence, detection_reasons) VALUES (?1, ?2, ?3, ?4)",
            params![format_ts(at), state.as_str(), confidence as f64, reasons_json],
        )?;
        Ok(())
    }

    fn append_cry_event(&self, update: CryEventUpdate) -> Result<(), StoreError> {
        let conn = self.conn()?;
        match update {
            CryEventUpdate::Open { start, intensity } => {
                conn.execute(
                    "INSERT INTO cry_events (start_time, intensity) VALUES (?1, ?2)",
                    params![format_ts(start), intensity.as_str()],
                )?;
            }
            CryEventUpdate::Close {
                end,
                duration_seconds,
            } => {
                let updated = conn.execute(
                    r#"
                    UPDATE cry_events SET end_time = ?1, duration_seconds = ?2
                    WHERE id = (
                        SELECT id FROM cry_events WHERE end_time IS NULL
                        ORDER BY start_time DESC LIMIT 1
                    )
                    "#,
                    params![format_ts(end), duration_seconds],
                )?;
                if updated == 0 {
                    tracing::warn!("Cry stop logged with no open cry event");
                }
            }
        }
        Ok(())
    }

    fn append_diaper_event(
        &self,
        kind: DiaperKind,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO diaper_events (timestamp, type, notes) VALUES (?1, ?2, ?3)",
            params![format_ts(at), kind.as_str(), notes],
        )?;
        Ok(())
    }

    fn append_feeding_event(&self, event: &FeedingEvent) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO feeding_events (timestamp, type, duration_minutes, amount_oz, notes) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                format_ts(event.at),
                event.kind.as_str(),
                event.duration_minutes,
                event.amount_oz.map(|a| a as f64),
                event.notes,
            ],
        )?;
        Ok(())
    }

    fn append_notification(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO notifications_log (timestamp, event_type, channel, message, delivered) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                format_ts(record.at),
                record.event_type,
                record.channel,
                record.message,
                record.delivered as i32,
            ],
        )?;
        Ok(())
    }

    fn read_recent(
        &self,
        kind: RecordKind,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let conn = self.conn()?;
        let limit = limit.min(i64::MAX as usize) as i64;
        let col = kind.time_column();
        let table = kind.table();

        let records = match since {
            Some(since) => {
                let sql = format!(
                    "SELECT * FROM {table} WHERE {col} >= ?1 ORDER BY {col} DESC, id DESC LIMIT ?2"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![format_ts(since), limit], |row| {
                    Self::row_to_record(kind, row)
                })?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let sql = format!("SELECT * FROM {table} ORDER BY {col} DESC, id DESC LIMIT ?1");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![limit], |row| Self::row_to_record(kind, row))?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(records)
    }
}

/// In-memory store that notes which threads read it or log notifications
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::thread::ThreadId;

    pub(crate) struct ThreadTrackingStore {
        inner: SqliteEventStore,
        threads: Mutex<Vec<ThreadId>>,
    }

    impl Default for ThreadTrackingStore {
        fn default() -> Self {
            Self {
                inner: SqliteEventStore::open_in_memory().unwrap(),
                threads: Mutex::new(Vec::new()),
            }
        }
    }

    impl ThreadTrackingStore {
        pub(crate) fn threads(&self) -> Vec<ThreadId> {
            self.threads.lock().unwrap().clone()
        }

        fn note(&self) {
            self.threads.lock().unwrap().push(std::thread::current().id());
        }
    }

    impl EventStore for ThreadTrackingStore {
        fn append_sleep_event(
            &self,
            state: SleepState,
            confidence: f32,
            reasons: &[String],
            at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.inner.append_sleep_event(state, confidence, reasons, at)
        }

        fn append_cry_event(&self, update: CryEventUpdate) -> Result<(), StoreError> {
            self.inner.append_cry_event(update)
        }

        fn append_diaper_event(
            &self,
            kind: DiaperKind,
            notes: Option<&str>,
            at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.inner.append_diaper_event(kind, notes, at)
        }

        fn append_feeding_event(&self, event: &FeedingEvent) -> Result<(), StoreError> {
            self.inner.append_feeding_event(event)
        }

        fn append_notification(&self, record: &NotificationRecord) -> Result<(), StoreError> {
            self.note();
            self.inner.append_notification(record)
        }

        fn read_recent(
            &self,
            kind: RecordKind,
            limit: usize,
            since: Option<DateTime<Utc>>,
        ) -> Result<Vec<EventRecord>, StoreError> {
            self.note();
            self.inner.read_recent(kind, limit, since)
        }
    }
}
