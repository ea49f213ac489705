//! Detection and audio workers
//!
//! Each worker owns its state machines and runs on a dedicated thread,
//! pulling the newest item from its bounded channel. Transitions are
//! persisted, mirrored into the state file and queued as alerts; none of
//! those side effects can stop the worker.

use crate::clock::{Clock, SharedClock};
use crate::config::Config;
use crate::control::{Assessment, FocusRegion};
use crate::cry::{CryDetector, CryTracker, CryTransition, Intensity};
use crate::frame::{self, AudioChunk, DetectionInput, Frame};
use crate::notify::{Alert, EventKind, Priority};
use crate::perception::AudioClassifier;
use crate::pipeline::{pop_latest_blocking, FrameChannels, Throttle};
use crate::sleep::{SleepState, SleepStateMachine, SleepTransition};
use crate::store::{CryEventUpdate, EventStore};
use crate::voting::VotingEngine;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// The state file mirrors the monitor for external integrations (status
/// bars, scripts). It holds one word: `crying` while a cry episode is
/// open, otherwise the sleep state.
#[derive(Debug)]
pub struct StateFile {
    path: Option<PathBuf>,
    current: Mutex<(SleepState, bool)>,
}

impl StateFile {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            current: Mutex::new((SleepState::Unknown, false)),
        }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub fn set_sleep(&self, state: SleepState) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.0 = state;
        self.write(*current);
    }

    pub fn set_crying(&self, crying: bool) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.1 = crying;
        self.write(*current);
    }

    pub fn render((state, crying): (SleepState, bool)) -> &'static str {
        if crying {
            "crying"
        } else {
            state.as_str()
        }
    }

    fn write(&self, current: (SleepState, bool)) {
        let Some(ref path) = self.path else {
            return;
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("Failed to create state file directory: {}", e);
                return;
            }
        }
        let state = Self::render(current);
        if let Err(e) = std::fs::write(path, state) {
            tracing::warn!("Failed to write state file: {}", e);
        } else {
            tracing::trace!("State file updated: {}", state);
        }
    }

    /// Remove on shutdown
    pub fn cleanup(&self) {
        if let Some(ref path) = self.path {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!("Failed to remove state file: {}", e);
                }
            }
        }
    }
}

/// Queue an alert without blocking the worker
fn queue_alert(alerts: &mpsc::Sender<Alert>, alert: Alert) {
    if let Err(e) = alerts.try_send(alert) {
        tracing::warn!("Alert dropped: {}", e);
    }
}

/// Sinks shared by both workers
#[derive(Clone)]
pub struct WorkerSinks {
    pub store: Arc<dyn EventStore>,
    pub alerts: mpsc::Sender<Alert>,
    pub assessment: Arc<watch::Sender<Assessment>>,
    pub state_file: Arc<StateFile>,
    pub clock: SharedClock,
}

/// Frame processing: crop, vote, evaluate, react
pub struct DetectionWorker {
    engine: VotingEngine,
    sleep: SleepStateMachine,
    focus: FocusRegion,
    channels: FrameChannels,
    sinks: WorkerSinks,
    snapshots_dir: PathBuf,
    wake_command: Option<String>,
    max_size: (u32, u32),
    classifier_width: u32,
}

impl DetectionWorker {
    pub fn new(
        config: &Config,
        engine: VotingEngine,
        focus: FocusRegion,
        channels: FrameChannels,
        sinks: WorkerSinks,
    ) -> Self {
        Self {
            engine,
            sleep: SleepStateMachine::new(&config.sleep),
            focus,
            channels,
            sinks,
            snapshots_dir: config.snapshots_dir(),
            wake_command: config.sleep.wake_command.clone(),
            max_size: (
                config.pipeline.max_frame_width,
                config.pipeline.max_frame_height,
            ),
            classifier_width: config.pipeline.classifier_resolution,
        }
    }

    pub fn sleep_state(&self) -> SleepState {
        self.sleep.state()
    }

    pub fn engine(&self) -> &VotingEngine {
        &self.engine
    }

    /// Process one captured frame. Without a focus region the frame is
    /// only forwarded for preview and no detection runs.
    pub fn process_frame(&mut self, captured: Frame) -> Option<SleepTransition> {
        let now = self.sinks.clock.now();
        let (max_w, max_h) = self.max_size;
        let image = Arc::new(frame::fit_within(
            Arc::unwrap_or_clone(captured.image),
            max_w,
            max_h,
        ));

        let region = self
            .focus
            .get()
            .and_then(|r| r.clamp_to(image.width(), image.height()));
        let Some(region) = region else {
            self.channels.cropped.push(DetectionInput {
                cropped: (*image).clone(),
                raw: image,
                captured_at: captured.captured_at,
            });
            return None;
        };

        let cropped = frame::crop(&image, &region)?;
        let input = DetectionInput {
            cropped: frame::resize_to_width(&cropped, self.classifier_width),
            raw: image,
            captured_at: captured.captured_at,
        };
        self.channels.cropped.push(input.clone());

        let outcome = self.engine.process_cycle(&input, now);
        self.channels.debug.push(outcome.annotated);

        let transition = self.sleep.evaluate(self.engine.confidence(), now);
        if let Some(t) = transition {
            self.on_transition(t);
        }
        self.publish(now);
        transition
    }

    fn publish(&self, now: chrono::DateTime<chrono::Utc>) {
        let snapshot = self.engine.snapshot();
        let state = self.sleep.state();
        let focus = self.focus.get().map(|r| r.to_string());
        self.sinks.assessment.send_modify(|a| {
            a.state = state;
            a.confidence = snapshot.confidence;
            a.reasons = snapshot.reasons;
            a.focus_region = focus;
            a.updated_at = Some(now);
        });
    }

    fn on_transition(&mut self, t: SleepTransition) {
        let reasons: Vec<String> = self
            .engine
            .take_reasons()
            .iter()
            .map(|r| r.as_str().to_string())
            .collect();
        if let Err(e) = self
            .sinks
            .store
            .append_sleep_event(t.to, t.confidence, &reasons, t.at)
        {
            tracing::error!("Failed to log sleep event: {}", e);
        }
        self.sinks.state_file.set_sleep(t.to);

        match t.to {
            SleepState::Asleep => {
                let mut alert = Alert::new(EventKind::BabyFellAsleep, "Baby fell asleep", Priority::Low);
                if let Some(path) = self.save_snapshot(t.at.timestamp()) {
                    alert = alert.with_attachment(path);
                }
                queue_alert(&self.sinks.alerts, alert);
            }
            SleepState::Awake => {
                self.fire_wake_command();
                queue_alert(
                    &self.sinks.alerts,
                    Alert::new(EventKind::BabyWokeUp, "Baby woke up", Priority::Normal),
                );
            }
            SleepState::Unknown => {}
        }
    }

    /// Save the latest annotated frame as `<snapshots>/<unix>.png`
    fn save_snapshot(&self, unix: i64) -> Option<PathBuf> {
        let image = self.channels.debug.peek_latest()?;
        let path = self.snapshots_dir.join(format!("{}.png", unix));
        match frame::save_png(&image, &path) {
            Ok(()) => {
                tracing::debug!("Snapshot saved to {:?}", path);
                Some(path)
            }
            Err(e) => {
                tracing::warn!("Failed to save snapshot {:?}: {}", path, e);
                None
            }
        }
    }

    /// Run the wake indicator command without waiting for it
    fn fire_wake_command(&self) {
        let Some(ref command) = self.wake_command else {
            return;
        };
        let command = command.clone();
        std::thread::spawn(move || {
            match std::process::Command::new("sh")
                .args(["-c", &command])
                .stdin(std::process::Stdio::null())
                .status()
            {
                Ok(status) if status.success() => {}
                Ok(status) => tracing::warn!("Wake command exited with {}", status),
                Err(e) => tracing::warn!("Wake command failed: {}", e),
            }
        });
    }

    /// Pull frames forever at no more than the configured rate
    pub fn run(mut self, min_cycle: std::time::Duration, backoff: std::time::Duration) {
        let capture = self.channels.capture.clone();
        let mut throttle = Throttle::new(min_cycle);
        loop {
            throttle.wait();
            let frame = pop_latest_blocking(&capture, backoff);
            throttle.mark();
            self.process_frame(frame);
        }
    }
}

/// Audio classification and cry tracking
pub struct AudioWorker {
    classifier: Arc<dyn AudioClassifier>,
    detector: CryDetector,
    tracker: CryTracker,
    sinks: WorkerSinks,
}

impl AudioWorker {
    pub fn new(config: &Config, classifier: Arc<dyn AudioClassifier>, sinks: WorkerSinks) -> Self {
        tracing::info!("Cry detection using {} classifier", classifier.name());
        Self {
            classifier,
            detector: CryDetector::new(&config.cry),
            tracker: CryTracker::from_config(&config.cry),
            sinks,
        }
    }

    pub fn is_crying(&self) -> bool {
        self.tracker.is_crying()
    }

    /// Classify one chunk. A classifier failure is no observation.
    pub fn process_chunk(&mut self, chunk: &AudioChunk) -> Option<CryTransition> {
        let score = match self.classifier.classify(&chunk.samples) {
            Ok(score) => score,
            Err(e) => {
                tracing::warn!("Audio classifier failed: {}", e);
                return None;
            }
        };
        let (crying, confidence) = self.detector.observe(score);
        tracing::trace!("Cry score {:.2} smoothed {:.2}", score, confidence);

        let now = self.sinks.clock.now();
        let transition = self.tracker.update(crying, confidence, now)?;
        self.on_transition(transition);
        Some(transition)
    }

    fn on_transition(&self, transition: CryTransition) {
        let update = match transition {
            CryTransition::Started {
                confidence,
                intensity,
                at,
            } => {
                let priority = if intensity == Intensity::Screaming {
                    Priority::Urgent
                } else {
                    Priority::High
                };
                queue_alert(
                    &self.sinks.alerts,
                    Alert::new(
                        EventKind::CryStarted,
                        format!("Baby is {} ({:.0}% confidence)", intensity, confidence * 100.0),
                        priority,
                    ),
                );
                CryEventUpdate::Open {
                    start: at,
                    intensity,
                }
            }
            CryTransition::Stopped { duration, at } => CryEventUpdate::Close {
                end: at,
                duration_seconds: duration.num_seconds(),
            },
        };
        if let Err(e) = self.sinks.store.append_cry_event(update) {
            tracing::error!("Failed to log cry event: {}", e);
        }

        let crying = matches!(transition, CryTransition::Started { .. });
        self.sinks.state_file.set_crying(crying);
        self.sinks.assessment.send_modify(|a| a.crying = crying);
    }

    pub fn run(mut self, chunks: Arc<crate::pipeline::BoundedChannel<AudioChunk>>, backoff: std::time::Duration) {
        loop {
            let chunk = pop_latest_blocking(&chunks, backoff);
            self.process_chunk(&chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::control::RetrainToken;
    use crate::error::PerceptionError;
    use crate::frame::Region;
    use crate::perception::{OcclusionClassifier, Perception};
    use crate::store::{EventRecord, RecordKind, SqliteEventStore};
    use chrono::{Duration, TimeZone, Utc};
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    struct Absent;

    impl OcclusionClassifier for Absent {
        fn predict(&self, _: &RgbImage) -> Result<[f32; 2], PerceptionError> {
            Ok([0.1, 0.9])
        }
    }

    struct Scripted(Mutex<Vec<f32>>);

    impl AudioClassifier for Scripted {
        fn classify(&self, _: &[f32]) -> Result<f32, PerceptionError> {
            let mut s = self.0.lock().unwrap();
            if s.is_empty() {
                Err(PerceptionError::Status(503))
            } else {
                Ok(s.remove(0))
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    struct Fixture {
        dir: TempDir,
        config: Config,
        clock: Arc<ManualClock>,
        store: Arc<SqliteEventStore>,
        sinks: WorkerSinks,
        alerts: mpsc::Receiver<Alert>,
        assessment: watch::Receiver<Assessment>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().display().to_string();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 21, 0, 0).unwrap(),
        ));
        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        let (tx, alerts) = mpsc::channel(16);
        let (assessment_tx, assessment) = watch::channel(Assessment::default());
        let sinks = WorkerSinks {
            store: store.clone(),
            alerts: tx,
            assessment: Arc::new(assessment_tx),
            state_file: Arc::new(StateFile::new(Some(dir.path().join("state")))),
            clock: clock.clone(),
        };
        Fixture {
            dir,
            config,
            clock,
            store,
            sinks,
            alerts,
            assessment,
        }
    }

    fn detection(f: &Fixture, focus: Option<Region>) -> (DetectionWorker, FrameChannels) {
        let perception = Perception {
            occlusion: Some(Arc::new(Absent)),
            ..Default::default()
        };
        let engine = VotingEngine::new(
            f.config.voting.clone(),
            perception,
            RetrainToken::new(),
            None,
        );
        let channels = FrameChannels::new(&f.config.pipeline);
        let worker = DetectionWorker::new(
            &f.config,
            engine,
            FocusRegion::new(focus),
            channels.clone(),
            f.sinks.clone(),
        );
        (worker, channels)
    }

    fn frame(f: &Fixture) -> Frame {
        Frame::new(RgbImage::from_pixel(64, 48, Rgb([30, 30, 30])), f.clock.now())
    }

    #[test]
    fn test_no_focus_region_skips_detection() {
        let f = fixture();
        let (mut worker, channels) = detection(&f, None);
        for _ in 0..5 {
            assert!(worker.process_frame(frame(&f)).is_none());
            f.clock.advance(Duration::seconds(1));
        }
        assert_eq!(worker.engine().confidence(), None);
        assert_eq!(channels.cropped.len(), 3);
        assert!(channels.debug.is_empty());
    }

    #[test]
    fn test_absent_baby_wakes_and_alerts() {
        let mut f = fixture();
        let (mut worker, channels) = detection(&f, Some(Region::new(8, 8, 32, 32)));

        let transition = worker.process_frame(frame(&f)).unwrap();
        assert_eq!(transition.to, SleepState::Awake);
        assert!(!channels.debug.is_empty());

        let events = f.store.read_recent(RecordKind::Sleep, 10, None).unwrap();
        match &events[0] {
            EventRecord::Sleep(e) => {
                assert_eq!(e.state, SleepState::Awake);
                assert_eq!(e.reasons, vec!["No baby present".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let alert = f.alerts.try_recv().unwrap();
        assert_eq!(alert.kind, EventKind::BabyWokeUp);
        assert_eq!(
            std::fs::read_to_string(f.dir.path().join("state")).unwrap(),
            "awake"
        );
        assert_eq!(f.assessment.borrow().state, SleepState::Awake);
        assert_eq!(f.assessment.borrow().focus_region.as_deref(), Some("8,8,32,32"));

        // Subsequent frames within the transition debounce change nothing
        f.clock.advance(Duration::seconds(30));
        assert!(worker.process_frame(frame(&f)).is_none());
        assert!(f.alerts.try_recv().is_err());
    }

    #[test]
    fn test_cry_episode_logged_and_alerted() {
        let mut f = fixture();
        let scores = vec![0.9; 7].into_iter().chain(vec![0.0; 12]).collect();
        let mut worker = AudioWorker::new(
            &f.config,
            Arc::new(Scripted(Mutex::new(scores))),
            f.sinks.clone(),
        );
        let chunk = AudioChunk {
            samples: vec![0.0; 16],
            captured_at: f.clock.now(),
        };

        let mut transitions = Vec::new();
        for _ in 0..19 {
            if let Some(t) = worker.process_chunk(&chunk) {
                transitions.push(t);
            }
            f.clock.advance(Duration::seconds(2));
        }
        assert_eq!(transitions.len(), 2);
        assert!(matches!(transitions[0], CryTransition::Started { .. }));
        assert!(matches!(transitions[1], CryTransition::Stopped { .. }));

        let alert = f.alerts.try_recv().unwrap();
        assert_eq!(alert.kind, EventKind::CryStarted);
        assert_eq!(alert.priority, Priority::Urgent);

        let events = f.store.read_recent(RecordKind::Cry, 10, None).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            EventRecord::Cry(e) => assert!(e.duration_seconds.unwrap() > 0),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!f.assessment.borrow().crying);
        assert!(!worker.is_crying());

        // Classifier failure: no observation, no panic
        assert!(worker.process_chunk(&chunk).is_none());
    }

    #[test]
    fn test_state_file_prefers_crying() {
        assert_eq!(StateFile::render((SleepState::Asleep, true)), "crying");
        assert_eq!(StateFile::render((SleepState::Asleep, false)), "asleep");

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/state");
        let file = StateFile::new(Some(path.clone()));
        file.set_sleep(SleepState::Asleep);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "asleep");
        file.set_crying(true);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "crying");
        file.cleanup();
        assert!(!path.exists());
    }
}
