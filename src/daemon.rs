//! Daemon module - worker orchestration
//!
//! Starts the capture, detection and audio threads, the notification and
//! reminder tasks, and the control request poller, then waits for
//! SIGINT/SIGTERM. Workers are never cancelled individually; shutdown is
//! process-level.

use crate::capture;
use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::control::{
    self, Assessment, ControlHandle, FocusRegion, RetrainCommand, RetrainToken, SIDE_CHANNEL_FILE,
};
use crate::error::{CribError, Result};
use crate::notify::{self, Alert, Dispatcher, NotificationCategories};
use crate::perception;
use crate::pipeline::FrameChannels;
use crate::reminder::{self, Reminder};
use crate::store::{EventStore, SqliteEventStore};
use crate::voting::VotingEngine;
use crate::worker::{AudioWorker, DetectionWorker, StateFile, WorkerSinks};
use pidlock::Pidlock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};

/// Pending alerts between workers and the dispatcher
const ALERT_QUEUE: usize = 64;

/// How often queued control requests are picked up
const CONTROL_POLL: Duration = Duration::from_secs(1);

/// Directory the CLI queues control requests in
pub fn control_dir() -> PathBuf {
    Config::runtime_dir().join("control")
}

/// File the daemon mirrors the current assessment into, as JSON
pub fn assessment_path() -> PathBuf {
    Config::runtime_dir().join("assessment.json")
}

/// Write PID file for external tooling
fn write_pid_file() -> Option<PathBuf> {
    let pid_path = Config::runtime_dir().join("pid");

    if let Some(parent) = pid_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Failed to create PID file directory: {}", e);
            return None;
        }
    }

    let pid = std::process::id();
    if let Err(e) = std::fs::write(&pid_path, pid.to_string()) {
        tracing::warn!("Failed to write PID file: {}", e);
        return None;
    }

    tracing::debug!("PID file written: {:?} (pid={})", pid_path, pid);
    Some(pid_path)
}

fn remove_file_quietly(path: &Path, what: &str) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Failed to remove {}: {}", what, e);
        }
    }
}

fn spawn_worker<F>(name: &str, f: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(|_| ())
        .map_err(|e| CribError::Config(format!("Failed to start {} thread: {}", name, e)))
}

/// Mirror assessment changes into the runtime directory
async fn publish_assessments(mut rx: watch::Receiver<Assessment>, path: PathBuf) {
    while rx.changed().await.is_ok() {
        let body = match serde_json::to_vec_pretty(&*rx.borrow_and_update()) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Failed to encode assessment: {}", e);
                continue;
            }
        };
        if let Err(e) = std::fs::write(&path, body) {
            tracing::warn!("Failed to write {:?}: {}", path, e);
        }
    }
}

/// Apply control requests queued by the CLI
async fn poll_control_requests(handle: ControlHandle, dir: PathBuf) {
    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::warn!("Control requests unavailable: {}", e);
        return;
    }
    let mut ticker = tokio::time::interval(CONTROL_POLL);
    loop {
        ticker.tick().await;
        handle.drain_requests(&dir).await;
    }
}

/// The monitor daemon
pub struct Daemon {
    config: Config,
    clock: SharedClock,
    state_file: Arc<StateFile>,
    pid_file_path: Option<PathBuf>,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        let state_file = Arc::new(StateFile::new(config.resolve_state_file()));
        Self {
            config,
            clock: Arc::new(SystemClock),
            state_file,
            pid_file_path: None,
        }
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("Starting cribwatch daemon");

        // Single instance check
        let lock_path = Config::runtime_dir().join("daemon.lock");
        std::fs::create_dir_all(Config::runtime_dir())?;
        let mut pidlock = Pidlock::new(&lock_path.to_string_lossy());
        if pidlock.acquire().is_err() {
            return Err(CribError::Config(
                "Another cribwatch daemon is already running".to_string(),
            ));
        }

        self.pid_file_path = write_pid_file();

        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            CribError::Config(format!("Failed to set up SIGTERM handler: {}", e))
        })?;

        self.config.ensure_directories().map_err(|e| {
            CribError::Config(format!("Failed to create directories: {}", e))
        })?;

        let db_path = self.config.database_path();
        let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::open(&db_path)?);
        tracing::info!("Event log: {:?}", db_path);

        if let Some(path) = self.state_file.path() {
            tracing::info!("State file: {:?}", path);
        }

        // Notification fan-out
        let categories = NotificationCategories::from_names(&self.config.notifications.disabled);
        let dispatcher = Arc::new(Dispatcher::new(
            notify::create_channels(&self.config.notifications),
            chrono::Duration::seconds(self.config.notifications.cooldown_secs as i64),
            categories.clone(),
            Some(store.clone()),
            self.clock.clone(),
        ));
        tracing::info!("Notification channels: {:?}", dispatcher.channel_names());
        let (alert_tx, alert_rx) = mpsc::channel::<Alert>(ALERT_QUEUE);
        tokio::spawn(notify::run_notifications(dispatcher, alert_rx));

        // Shared control state
        let token = RetrainToken::new();
        let focus_path = self.config.focus_region_path();
        let focus = FocusRegion::new(control::load_focus_region(&focus_path));
        match focus.get() {
            Some(region) => tracing::info!("Focus region: {}", region),
            None => tracing::warn!(
                "No focus region set; frames are forwarded but not analysed. \
                 Set one with: cribwatch focus x,y,w,h"
            ),
        }
        let (assessment_tx, assessment_rx) = watch::channel(Assessment::default());
        let sinks = WorkerSinks {
            store: store.clone(),
            alerts: alert_tx.clone(),
            assessment: Arc::new(assessment_tx),
            state_file: self.state_file.clone(),
            clock: self.clock.clone(),
        };

        // Video capture + detection
        let channels = FrameChannels::new(&self.config.pipeline);
        let video = capture::create_video_source(&self.config)?;
        let backoff = Duration::from_secs(self.config.camera.reconnect_backoff_secs);
        {
            let channel = channels.capture.clone();
            let clock = self.clock.clone();
            spawn_worker("video-capture", move || {
                capture::run_video_capture(video, channel, clock, backoff)
            })?;
        }

        let perception = perception::create_perception(&self.config.perception)?;
        let engine = VotingEngine::new(
            self.config.voting.clone(),
            perception,
            token.clone(),
            Some(self.config.occlusion_dir().join(SIDE_CHANNEL_FILE)),
        );
        let detection = DetectionWorker::new(
            &self.config,
            engine,
            focus.clone(),
            channels.clone(),
            sinks.clone(),
        );
        let min_cycle = self.config.pipeline.min_cycle_interval();
        let empty_backoff = self.config.pipeline.empty_backoff();
        spawn_worker("detection", move || detection.run(min_cycle, empty_backoff))?;

        // Audio capture + cry detection
        self.start_audio(&channels, sinks, backoff)?;

        // Reminders
        let reminders = vec![
            Reminder::diaper(&self.config.reminders),
            Reminder::feeding(&self.config.reminders),
        ];
        tokio::spawn(reminder::run_reminders(
            reminders,
            store.clone(),
            self.clock.clone(),
            alert_tx,
            Duration::from_secs(self.config.reminders.poll_interval_secs.max(1)),
        ));

        // Control surface
        let retrain = self.config.perception.retrain_command.as_deref().map(|cmd| {
            RetrainCommand::new(cmd, self.config.perception.retrain_timeout_secs)
        });
        let handle = ControlHandle::new(
            token,
            focus,
            focus_path,
            self.config.occlusion_dir(),
            retrain,
            categories,
            assessment_rx.clone(),
            self.clock.clone(),
        );
        tokio::spawn(poll_control_requests(handle, control_dir()));
        tokio::spawn(publish_assessments(assessment_rx, assessment_path()));

        tracing::info!("Monitoring started");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, shutting down...");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down...");
            }
        }

        self.state_file.cleanup();
        remove_file_quietly(&assessment_path(), "assessment file");
        if let Some(ref path) = self.pid_file_path {
            remove_file_quietly(path, "PID file");
        }
        if let Err(e) = pidlock.release() {
            tracing::debug!("Failed to release daemon lock: {:?}", e);
        }

        tracing::info!("Daemon stopped");
        Ok(())
    }

    /// Audio is optional; any setup failure leaves cry detection off
    fn start_audio(&self, channels: &FrameChannels, sinks: WorkerSinks, backoff: Duration) -> Result<()> {
        let source = match capture::create_audio_source(&self.config) {
            Ok(Some(source)) => source,
            Ok(None) => {
                tracing::info!("Audio disabled; cry detection is off");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!("Audio unavailable ({}); cry detection is off", e);
                return Ok(());
            }
        };
        let classifier = match perception::create_audio_classifier(&self.config) {
            Ok(Some(classifier)) => classifier,
            Ok(None) => {
                tracing::warn!("No audio classifier configured; cry detection is off");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!("Audio classifier unavailable ({}); cry detection is off", e);
                return Ok(());
            }
        };

        {
            let channel = channels.audio.clone();
            let clock = self.clock.clone();
            spawn_worker("audio-capture", move || {
                capture::run_audio_capture(source, channel, clock, backoff)
            })?;
        }

        let worker = AudioWorker::new(&self.config, classifier, sinks);
        let chunks = channels.audio.clone();
        let empty_backoff = self.config.pipeline.empty_backoff();
        spawn_worker("cry-detection", move || worker.run(chunks, empty_backoff))
    }
}
