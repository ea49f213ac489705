//! Inbound control surface
//!
//! Focus region changes, retraining samples and notification toggles
//! arrive here. Operations that touch the occlusion model hold the
//! [`RetrainToken`] while they run; the detection worker only ever
//! try-acquires it and skips its occlusion vote when it is taken.
//!
//! # Example Configuration
//!
//! ```toml
//! [perception]
//! retrain_command = "python3 -m occlusion_trainer"
//! retrain_timeout_secs = 300
//! ```
//!
//! The retraining command runs through `sh -c` with `CRIBWATCH_FOCUS_REGION`
//! (empty when unset), `CRIBWATCH_SAMPLES_DIR` and, for new samples,
//! `CRIBWATCH_SAMPLE` in its environment.

use crate::clock::SharedClock;
use crate::error::ControlError;
use crate::frame::Region;
use crate::notify::{EventKind, NotificationCategories};
use crate::sleep::SleepState;
use crate::voting::VoteReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::timeout;

/// File the detection worker keeps the latest raw frame in
pub const SIDE_CHANNEL_FILE: &str = "current.png";

/// Exclusive-use token for the occlusion model
#[derive(Debug, Clone, Default)]
pub struct RetrainToken {
    held: Arc<AtomicBool>,
}

/// Releases the token when dropped
#[derive(Debug)]
pub struct RetrainGuard {
    held: Arc<AtomicBool>,
}

impl Drop for RetrainGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

impl RetrainToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the token if it is free
    pub fn try_acquire(&self) -> Option<RetrainGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RetrainGuard {
                held: self.held.clone(),
            })
    }

    /// Wait for the token, polling every `backoff`
    pub async fn acquire(&self, backoff: Duration) -> RetrainGuard {
        loop {
            if let Some(guard) = self.try_acquire() {
                return guard;
            }
            tokio::time::sleep(backoff).await;
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Current focus region, shared with the detection worker
#[derive(Debug, Clone, Default)]
pub struct FocusRegion {
    inner: Arc<RwLock<Option<Region>>>,
}

impl FocusRegion {
    pub fn new(initial: Option<Region>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn get(&self) -> Option<Region> {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, region: Option<Region>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = region;
    }
}

/// Read a persisted focus region. Missing or unparsable files mean none.
pub fn load_focus_region(path: &Path) -> Option<Region> {
    let contents = std::fs::read_to_string(path).ok()?;
    match contents.trim().parse::<Region>() {
        Ok(region) => {
            tracing::info!("Loaded focus region {} from {:?}", region, path);
            Some(region)
        }
        Err(e) => {
            tracing::warn!("Ignoring focus region file {:?}: {}", path, e);
            None
        }
    }
}

/// Label of a retraining sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleLabel {
    Present,
    Absent,
}

impl SampleLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleLabel::Present => "present",
            SampleLabel::Absent => "absent",
        }
    }
}

impl fmt::Display for SampleLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleLabel {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "present" => Ok(SampleLabel::Present),
            "absent" => Ok(SampleLabel::Absent),
            _ => Err(ControlError::InvalidLabel(s.to_string())),
        }
    }
}

/// What the monitor currently thinks, published by the detection worker
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Assessment {
    pub state: SleepState,
    pub confidence: Option<f32>,
    pub reasons: Vec<VoteReason>,
    pub crying: bool,
    pub focus_region: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Publishes assessments; cheap to clone
pub type AssessmentSender = watch::Sender<Assessment>;

/// External retraining command
#[derive(Debug, Clone)]
pub struct RetrainCommand {
    command: String,
    timeout: Duration,
}

impl RetrainCommand {
    pub fn new(command: &str, timeout_secs: u64) -> Self {
        Self {
            command: command.to_string(),
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    async fn run(&self, env: &[(&str, String)]) -> Result<(), ControlError> {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &self.command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = cmd
            .spawn()
            .map_err(|e| ControlError::Retrain(format!("failed to spawn: {}", e)))?;

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ControlError::Retrain(format!("timed out after {}s", self.timeout.as_secs()))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ControlError::Retrain(format!(
                "exited with code {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Handle used by the CLI/daemon to steer the running monitor
#[derive(Clone)]
pub struct ControlHandle {
    token: RetrainToken,
    focus: FocusRegion,
    focus_path: PathBuf,
    occlusion_dir: PathBuf,
    retrain: Option<RetrainCommand>,
    categories: NotificationCategories,
    assessment: watch::Receiver<Assessment>,
    clock: SharedClock,
    backoff: Duration,
}

impl ControlHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        token: RetrainToken,
        focus: FocusRegion,
        focus_path: PathBuf,
        occlusion_dir: PathBuf,
        retrain: Option<RetrainCommand>,
        categories: NotificationCategories,
        assessment: watch::Receiver<Assessment>,
        clock: SharedClock,
    ) -> Self {
        Self {
            token,
            focus,
            focus_path,
            occlusion_dir,
            retrain,
            categories,
            assessment,
            clock,
            backoff: Duration::from_millis(100),
        }
    }

    /// Narrow the focus region. Coordinates are relative to the current
    /// region when one is set. Returns the absolute region now in effect.
    pub async fn set_focus_region(&self, region: Region) -> Result<Region, ControlError> {
        if region.width == 0 || region.height == 0 {
            return Err(ControlError::InvalidRegion(region.to_string()));
        }
        let _guard = self.token.acquire(self.backoff).await;

        let absolute = match self.focus.get() {
            Some(current) => region.relative_to(&current),
            None => region,
        };
        if absolute.width == 0 || absolute.height == 0 {
            return Err(ControlError::InvalidRegion(region.to_string()));
        }

        if let Some(parent) = self.focus_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.focus_path, absolute.to_string())?;
        self.focus.set(Some(absolute));
        tracing::info!("Focus region set to {}", absolute);

        self.run_retrain(None).await;
        Ok(absolute)
    }

    /// Go back to the full frame
    pub async fn reset_focus_region(&self) -> Result<(), ControlError> {
        let _guard = self.token.acquire(self.backoff).await;
        match std::fs::remove_file(&self.focus_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.focus.set(None);
        tracing::info!("Focus region reset");
        self.run_retrain(None).await;
        Ok(())
    }

    pub fn samples_dir(&self) -> PathBuf {
        self.occlusion_dir.join("samples")
    }

    /// File the current side-channel frame into the labelled sample set.
    /// Returns the sample's new path.
    pub async fn submit_retraining_sample(
        &self,
        label: SampleLabel,
    ) -> Result<PathBuf, ControlError> {
        let _guard = self.token.acquire(self.backoff).await;

        let source = self.occlusion_dir.join(SIDE_CHANNEL_FILE);
        if !source.exists() {
            return Err(ControlError::NoSampleFrame);
        }
        let dir = self.samples_dir().join(label.as_str());
        std::fs::create_dir_all(&dir)?;
        let dest = dir.join(format!(
            "{}_{}.png",
            label.as_str(),
            self.clock.now().timestamp()
        ));
        if std::fs::rename(&source, &dest).is_err() {
            // Different filesystem
            std::fs::copy(&source, &dest)?;
            std::fs::remove_file(&source)?;
        }
        tracing::info!("Stored {} sample at {:?}", label, dest);

        self.run_retrain(Some(&dest)).await;
        Ok(dest)
    }

    /// Retrain failures are logged; the previous model stays in use
    async fn run_retrain(&self, sample: Option<&Path>) {
        let Some(ref retrain) = self.retrain else {
            return;
        };
        let mut env = vec![
            (
                "CRIBWATCH_FOCUS_REGION",
                self.focus.get().map(|r| r.to_string()).unwrap_or_default(),
            ),
            (
                "CRIBWATCH_SAMPLES_DIR",
                self.samples_dir().display().to_string(),
            ),
        ];
        if let Some(sample) = sample {
            env.push(("CRIBWATCH_SAMPLE", sample.display().to_string()));
        }

        let start = std::time::Instant::now();
        match retrain.run(&env).await {
            Ok(()) => tracing::info!(
                "Retraining finished in {:.1}s",
                start.elapsed().as_secs_f32()
            ),
            Err(e) => tracing::error!("Retraining failed: {}", e),
        }
    }

    pub fn set_category_enabled(&self, kind: EventKind, enabled: bool) {
        self.categories.set_enabled(kind, enabled);
        tracing::info!(
            "Notifications for {} {}",
            kind,
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn current_assessment(&self) -> Assessment {
        self.assessment.borrow().clone()
    }

    pub fn focus_region(&self) -> Option<Region> {
        self.focus.get()
    }
}

/// A control operation queued by the CLI for the running daemon.
///
/// Requests are JSON files in the daemon's runtime `control/` directory,
/// applied in file name order and removed once handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    SetFocus { region: String },
    ResetFocus,
    Sample { label: String },
    Notifications { category: String, enabled: bool },
}

/// Write a request for the daemon to pick up. Returns the file written.
pub fn queue_request(dir: &Path, request: &ControlRequest) -> Result<PathBuf, ControlError> {
    std::fs::create_dir_all(dir)?;
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let body =
        serde_json::to_vec(request).map_err(|e| ControlError::Request(e.to_string()))?;
    // Written under a temporary name so the daemon never sees a partial file
    let tmp = dir.join(format!(".{}.tmp", nanos));
    let path = dir.join(format!("{}.json", nanos));
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Pending request files, oldest first
pub fn pending_requests(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();
    paths
}

impl ControlHandle {
    /// Apply one request. Returns a one-line summary for the log.
    pub async fn apply(&self, request: ControlRequest) -> Result<String, ControlError> {
        match request {
            ControlRequest::SetFocus { region } => {
                let region: Region = region
                    .parse()
                    .map_err(ControlError::InvalidRegion)?;
                let absolute = self.set_focus_region(region).await?;
                Ok(format!("focus region {}", absolute))
            }
            ControlRequest::ResetFocus => {
                self.reset_focus_region().await?;
                Ok("focus region reset".to_string())
            }
            ControlRequest::Sample { label } => {
                let label: SampleLabel = label.parse()?;
                let path = self.submit_retraining_sample(label).await?;
                Ok(format!("{} sample {}", label, path.display()))
            }
            ControlRequest::Notifications { category, enabled } => {
                let kind = EventKind::parse(&category)
                    .ok_or(ControlError::UnknownCategory(category))?;
                self.set_category_enabled(kind, enabled);
                Ok(format!(
                    "{} notifications {}",
                    kind,
                    if enabled { "on" } else { "off" }
                ))
            }
        }
    }

    /// Apply and remove every pending request file in `dir`
    pub async fn drain_requests(&self, dir: &Path) -> usize {
        let mut handled = 0;
        for path in pending_requests(dir) {
            let parsed = std::fs::read(&path)
                .map_err(ControlError::from)
                .and_then(|body| {
                    serde_json::from_slice::<ControlRequest>(&body)
                        .map_err(|e| ControlError::Request(e.to_string()))
                });
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to remove control request {:?}: {}", path, e);
            }
            match parsed {
                Ok(request) => match self.apply(request).await {
                    Ok(summary) => tracing::info!("Control: {}", summary),
                    Err(e) => tracing::warn!("Control request failed: {}", e),
                },
                Err(e) => tracing::warn!("Ignoring control request {:?}: {}", path, e),
            }
            handled += 1;
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct Fixture {
        handle: ControlHandle,
        token: RetrainToken,
        dir: TempDir,
        tx: AssessmentSender,
    }

    fn fixture(retrain: Option<RetrainCommand>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let token = RetrainToken::new();
        let (tx, rx) = watch::channel(Assessment::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap(),
        ));
        let handle = ControlHandle::new(
            token.clone(),
            FocusRegion::default(),
            dir.path().join("focus_region.txt"),
            dir.path().join("occlusion"),
            retrain,
            NotificationCategories::default(),
            rx,
            clock,
        );
        Fixture {
            handle,
            token,
            dir,
            tx,
        }
    }

    #[test]
    fn test_try_acquire_is_exclusive() {
        let token = RetrainToken::new();
        let guard = token.try_acquire().unwrap();
        assert!(token.is_held());
        assert!(token.clone().try_acquire().is_none());
        drop(guard);
        assert!(!token.is_held());
        assert!(token.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let token = RetrainToken::new();
        let guard = token.try_acquire().unwrap();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move {
                let _g = token.acquire(Duration::from_millis(5)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
        assert!(!token.is_held());
    }

    #[tokio::test]
    async fn test_focus_region_nests_and_persists() {
        let f = fixture(None);
        let first = f
            .handle
            .set_focus_region(Region::new(100, 50, 800, 600))
            .await
            .unwrap();
        assert_eq!(first, Region::new(100, 50, 800, 600));

        let nested = f
            .handle
            .set_focus_region(Region::new(10, 20, 300, 200))
            .await
            .unwrap();
        assert_eq!(nested, Region::new(110, 70, 300, 200));
        assert_eq!(f.handle.focus_region(), Some(nested));

        let path = f.dir.path().join("focus_region.txt");
        assert_eq!(load_focus_region(&path), Some(nested));
        assert!(!f.token.is_held());

        f.handle.reset_focus_region().await.unwrap();
        assert_eq!(f.handle.focus_region(), None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_sample_moved_into_label_dir() {
        let f = fixture(None);
        assert!(matches!(
            f.handle
                .submit_retraining_sample(SampleLabel::Absent)
                .await,
            Err(ControlError::NoSampleFrame)
        ));

        let occlusion = f.dir.path().join("occlusion");
        std::fs::create_dir_all(&occlusion).unwrap();
        std::fs::write(occlusion.join(SIDE_CHANNEL_FILE), b"frame").unwrap();

        let dest = f
            .handle
            .submit_retraining_sample(SampleLabel::Absent)
            .await
            .unwrap();
        let expected = occlusion.join(format!(
            "samples/absent/absent_{}.png",
            Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap().timestamp()
        ));
        assert_eq!(dest, expected);
        assert_eq!(std::fs::read(&dest).unwrap(), b"frame");
        assert!(!occlusion.join(SIDE_CHANNEL_FILE).exists());
    }

    #[tokio::test]
    async fn test_retrain_command_sees_environment() {
        let marker = tempfile::NamedTempFile::new().unwrap();
        let command = format!(
            "echo \"$CRIBWATCH_FOCUS_REGION\" > {}",
            marker.path().display()
        );
        let f = fixture(Some(RetrainCommand::new(&command, 5)));
        f.handle
            .set_focus_region(Region::new(1, 2, 3, 4))
            .await
            .unwrap();
        let written = std::fs::read_to_string(marker.path()).unwrap();
        assert_eq!(written.trim(), "1,2,3,4");
    }

    #[tokio::test]
    async fn test_retrain_timeout_is_reported() {
        let retrain = RetrainCommand::new("sleep 5", 1);
        let err = retrain.run(&[]).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_retrain_failure_keeps_region() {
        let f = fixture(Some(RetrainCommand::new("exit 3", 5)));
        let region = f
            .handle
            .set_focus_region(Region::new(0, 0, 10, 10))
            .await
            .unwrap();
        assert_eq!(f.handle.focus_region(), Some(region));
    }

    #[test]
    fn test_label_parse() {
        assert_eq!("Present".parse::<SampleLabel>().unwrap(), SampleLabel::Present);
        assert!(matches!(
            "maybe".parse::<SampleLabel>(),
            Err(ControlError::InvalidLabel(_))
        ));
    }

    #[test]
    fn test_assessment_published() {
        let f = fixture(None);
        f.tx.send_replace(Assessment {
            state: SleepState::Asleep,
            confidence: Some(0.2),
            ..Default::default()
        });
        assert_eq!(f.handle.current_assessment().state, SleepState::Asleep);
    }

    #[test]
    fn test_category_toggle_shared() {
        let categories = NotificationCategories::default();
        let (_tx, rx) = watch::channel(Assessment::default());
        let handle = ControlHandle::new(
            RetrainToken::new(),
            FocusRegion::default(),
            PathBuf::from("/nonexistent/focus"),
            PathBuf::from("/nonexistent/occlusion"),
            None,
            categories.clone(),
            rx,
            Arc::new(ManualClock::new(Utc::now())),
        );
        handle.set_category_enabled(EventKind::CryStarted, false);
        assert!(!categories.is_enabled(EventKind::CryStarted));
    }

    #[tokio::test]
    async fn test_queued_requests_applied_in_order() {
        let f = fixture(None);
        let queue = f.dir.path().join("control");
        queue_request(
            &queue,
            &ControlRequest::SetFocus {
                region: "100,50,400,300".into(),
            },
        )
        .unwrap();
        queue_request(
            &queue,
            &ControlRequest::SetFocus {
                region: "10,10,100,100".into(),
            },
        )
        .unwrap();
        queue_request(
            &queue,
            &ControlRequest::Notifications {
                category: "baby_crying".into(),
                enabled: false,
            },
        )
        .unwrap();
        std::fs::write(queue.join("0.json"), b"not json").unwrap();

        assert_eq!(f.handle.drain_requests(&queue).await, 4);
        assert_eq!(
            f.handle.focus_region(),
            Some(Region::new(110, 60, 100, 100))
        );
        assert!(pending_requests(&queue).is_empty());
    }

    #[tokio::test]
    async fn test_bad_requests_rejected() {
        let f = fixture(None);
        let err = f
            .handle
            .apply(ControlRequest::Notifications {
                category: "baby_dancing".into(),
                enabled: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::UnknownCategory(_)));

        let err = f
            .handle
            .apply(ControlRequest::SetFocus {
                region: "1,2,3".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidRegion(_)));

        let err = f
            .handle
            .apply(ControlRequest::Sample {
                label: "present".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NoSampleFrame));
    }

    #[tokio::test]
    async fn test_oversized_focus_requests_do_not_wrap() {
        let f = fixture(None);
        let err = f
            .handle
            .apply(ControlRequest::SetFocus {
                region: "4000000000,0,1000000000,10".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidRegion(_)));

        f.handle
            .set_focus_region(Region::new(4_294_967_200, 0, 95, 10))
            .await
            .unwrap();
        let nested = f
            .handle
            .set_focus_region(Region::new(1, 1, 1_000_000_000, 5))
            .await
            .unwrap();
        assert_eq!(nested, Region::new(4_294_967_201, 1, 94, 5));
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_string(&ControlRequest::ResetFocus).unwrap();
        assert_eq!(json, r#"{"op":"reset_focus"}"#);
        let parsed: ControlRequest =
            serde_json::from_str(r#"{"op":"sample","label":"absent"}"#).unwrap();
        assert_eq!(
            parsed,
            ControlRequest::Sample {
                label: "absent".into()
            }
        );
    }
}
