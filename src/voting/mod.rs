//! Voting and debounce engine
//!
//! Every detection cycle turns perception output into weighted votes in a
//! shared rolling window. The window mean is the aggregate "awake"
//! confidence; it is not normalized, so the eye vote's weight (3.0 by
//! default) can outvote several movement votes.
//!
//! Per-cycle flow:
//!
//! ```text
//!   cropped frame ──▶ face ──▶ eye window ──▶ eye vote ─────────┐
//!                 └─▶ pose ──▶ wrist window ─▶ movement vote ───┤
//!                      │ (no body)                              ├──▶ awake window ──▶ mean
//!                      └──────▶ occlusion classifier ──▶ vote ──┘
//! ```
//!
//! Each vote is appended under its own debounce timer, so at most one
//! sample per signal enters the awake window per interval.

pub mod signals;
pub mod window;

use crate::config::VotingConfig;
use crate::control::RetrainToken;
use crate::debounce::{Action, DebounceRegistry};
use crate::frame::{self, DetectionInput};
use crate::perception::{geometry, Perception, Pose, WristPair};
use chrono::{DateTime, Duration, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use window::RollingWindow;

/// Why a vote was cast
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VoteReason {
    #[serde(rename = "Eyes Open")]
    EyesOpen,
    #[serde(rename = "Eyes Closed")]
    EyesClosed,
    #[serde(rename = "Moving")]
    Moving,
    #[serde(rename = "Not moving")]
    NotMoving,
    #[serde(rename = "No baby present")]
    NoBabyPresent,
    #[serde(rename = "Movement")]
    Movement,
}

impl VoteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteReason::EyesOpen => "Eyes Open",
            VoteReason::EyesClosed => "Eyes Closed",
            VoteReason::Moving => "Moving",
            VoteReason::NotMoving => "Not moving",
            VoteReason::NoBabyPresent => "No baby present",
            VoteReason::Movement => "Movement",
        }
    }
}

impl fmt::Display for VoteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the awake window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoteSample {
    pub weight: f32,
    pub reason: VoteReason,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of the engine for the control surface
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineSnapshot {
    /// Mean of the awake window; None while it is empty
    pub confidence: Option<f32>,
    /// Reasons accumulated since the last logged transition
    pub reasons: Vec<VoteReason>,
    pub window_len: usize,
}

/// What one cycle observed and voted
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub face_found: bool,
    pub body_found: bool,
    pub votes: Vec<VoteSample>,
    /// Cropped frame with detected keypoints marked
    pub annotated: RgbImage,
}

/// Fuses per-signal votes into an aggregate awake confidence
pub struct VotingEngine {
    config: VotingConfig,
    perception: Perception,
    retrain: RetrainToken,
    /// Where the raw frame is written for the retraining workflow
    side_channel: Option<PathBuf>,
    debounce: DebounceRegistry,
    awake: RollingWindow<VoteSample>,
    eyes: RollingWindow<bool>,
    wrists: RollingWindow<WristPair>,
    previous_blurred: Option<RgbImage>,
    reasons: BTreeSet<VoteReason>,
}

impl VotingEngine {
    pub fn new(
        config: VotingConfig,
        perception: Perception,
        retrain: RetrainToken,
        side_channel: Option<PathBuf>,
    ) -> Self {
        let debounce = DebounceRegistry::new()
            .with(Action::EyeVote, Duration::seconds(config.vote_debounce_secs as i64))
            .with(
                Action::MovementVote,
                Duration::seconds(config.vote_debounce_secs as i64),
            )
            .with(
                Action::NoFaceDecay,
                Duration::seconds(config.no_face_debounce_secs as i64),
            )
            .with(
                Action::NoBodyDecay,
                Duration::seconds(config.no_face_debounce_secs as i64),
            )
            .with(
                Action::OcclusionVote,
                Duration::seconds(config.occlusion_debounce_secs as i64),
            );

        Self {
            awake: RollingWindow::new(config.awake_window),
            eyes: RollingWindow::new(config.eyes_window),
            wrists: RollingWindow::new(config.movement_window),
            config,
            perception,
            retrain,
            side_channel,
            debounce,
            previous_blurred: None,
            reasons: BTreeSet::new(),
        }
    }

    /// Run one detection cycle on a cropped frame
    pub fn process_cycle(&mut self, input: &DetectionInput, now: DateTime<Utc>) -> CycleOutcome {
        let image = &input.cropped;
        let mut annotated = image.clone();
        let mut votes = Vec::new();

        let face_found = self.observe_face(image, now);

        let pose = self.detect_body(image);
        let body_found = pose.is_some();
        if let Some(ref pose) = pose {
            if let Some(wrists) = pose.wrists(image.width(), image.height()) {
                self.wrists.push(wrists);
            }
            let points = pose.visible_points(image.width(), image.height());
            frame::mark_points(&mut annotated, &points, [0, 255, 0]);
        }

        if self.debounce.try_run(Action::EyeVote, now) {
            if let Some((weight, reason)) = signals::eye_vote(&self.eyes, &self.config) {
                votes.push(self.cast(weight, reason, now));
            }
        }

        if body_found {
            if self.debounce.try_run(Action::MovementVote, now) {
                if let Some((weight, reason)) = signals::movement_vote(&self.wrists, &self.config)
                {
                    votes.push(self.cast(weight, reason, now));
                }
            }
        } else if self.debounce.try_run(Action::NoBodyDecay, now) && self.wrists.pop_oldest().is_some()
        {
            tracing::trace!("No body found, aging out oldest wrist sample");
        }

        if let Some(vote) = self.occlusion_step(input, body_found, now) {
            votes.push(vote);
        }

        tracing::debug!(
            "Cycle: face={} body={} votes={} confidence={:?}",
            face_found,
            body_found,
            votes.len(),
            self.confidence()
        );

        CycleOutcome {
            face_found,
            body_found,
            votes,
            annotated,
        }
    }

    /// Run the face landmarker and record an eye sample.
    ///
    /// Returns whether a usable face was found.
    fn observe_face(&mut self, image: &RgbImage, now: DateTime<Utc>) -> bool {
        let Some(ref landmarker) = self.perception.face else {
            return false;
        };
        let awake = match landmarker.detect(image) {
            Ok(Some(face)) => geometry::looks_awake(&face),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Face landmarker failed: {}", e);
                None
            }
        };
        match awake {
            Some(open) => {
                self.eyes.push(open);
                true
            }
            None => {
                if self.debounce.try_run(Action::NoFaceDecay, now)
                    && self.eyes.pop_oldest().is_some()
                {
                    tracing::trace!("No face found, aging out oldest eye sample");
                }
                false
            }
        }
    }

    /// Primary pose estimator, then the secondary one if the primary
    /// found nobody. Returns a pose only when it counts as a person.
    fn detect_body(&self, image: &RgbImage) -> Option<Pose> {
        let estimators = [&self.perception.pose, &self.perception.secondary_pose];
        for estimator in estimators.into_iter().flatten() {
            match estimator.detect(image) {
                Ok(Some(pose)) if pose.is_person() => {
                    tracing::trace!("Body found by {}", estimator.name());
                    return Some(pose);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Pose estimator {} failed: {}", estimator.name(), e),
            }
        }
        None
    }

    fn occlusion_step(
        &mut self,
        input: &DetectionInput,
        body_found: bool,
        now: DateTime<Utc>,
    ) -> Option<VoteSample> {
        if !self.debounce.try_run(Action::OcclusionVote, now) {
            return None;
        }
        let Some(_guard) = self.retrain.try_acquire() else {
            tracing::debug!("Retraining in progress, skipping occlusion vote");
            return None;
        };

        let blurred = frame::blur(&input.cropped);
        let diff = self
            .previous_blurred
            .as_ref()
            .and_then(|prev| frame::mean_abs_diff(prev, &blurred));
        self.previous_blurred = Some(blurred);

        if let Some(ref path) = self.side_channel {
            if let Err(e) = frame::save_png(&input.raw, path) {
                tracing::warn!("Failed to write occlusion frame to {:?}: {}", path, e);
            }
        }

        if body_found {
            return None;
        }
        let classifier = self.perception.occlusion.as_ref()?;
        let probabilities = match classifier.predict(&input.cropped) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Occlusion classifier failed: {}", e);
                return None;
            }
        };
        tracing::debug!(
            "Occlusion: present={:.2} absent={:.2} diff={:?}",
            probabilities[0],
            probabilities[1],
            diff
        );
        let (weight, reason) = signals::occlusion_vote(probabilities, diff, &self.config)?;
        Some(self.cast(weight, reason, now))
    }

    fn cast(&mut self, weight: f32, reason: VoteReason, at: DateTime<Utc>) -> VoteSample {
        let sample = VoteSample { weight, reason, at };
        self.awake.push(sample);
        self.reasons.insert(reason);
        sample
    }

    /// Mean of the awake window; None while it is empty
    pub fn confidence(&self) -> Option<f32> {
        if self.awake.is_empty() {
            return None;
        }
        let total: f32 = self.awake.iter().map(|v| v.weight).sum();
        Some(total / self.awake.len() as f32)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            confidence: self.confidence(),
            reasons: self.reasons.iter().copied().collect(),
            window_len: self.awake.len(),
        }
    }

    /// Take the accumulated reason set, leaving it empty
    pub fn take_reasons(&mut self) -> Vec<VoteReason> {
        std::mem::take(&mut self.reasons).into_iter().collect()
    }
}
