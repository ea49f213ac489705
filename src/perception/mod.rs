//! Perception adapters
//!
//! Face landmarks, body pose, occlusion and cry classification are black
//! boxes behind four capability traits. Adapters are synchronous and block
//! the calling worker; the frame worker being single-threaded is what keeps
//! slow perception from building a backlog.
//!
//! Implementations:
//! - [`remote::RemotePerception`]: HTTP perception service (all four traits)
//! - [`energy::EnergyCryClassifier`]: RMS-energy audio fallback

pub mod energy;
pub mod geometry;
pub mod remote;

use crate::config::{Config, PerceptionConfig};
use crate::error::PerceptionError;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// COCO keypoint indices used by the movement vote
pub const LEFT_WRIST: usize = 9;
pub const RIGHT_WRIST: usize = 10;

/// Keypoint confidence that must be exceeded to count as visible
pub const KEYPOINT_CONFIDENCE: f32 = 0.2;
/// Visible keypoints needed to count a person as detected
pub const MIN_VISIBLE_KEYPOINTS: usize = 4;

/// One face-mesh landmark in normalized image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
}

/// Dense face mesh for a single face (468+ points)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FaceLandmarks {
    pub points: Vec<Landmark>,
}

/// One body keypoint in normalized image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn is_visible(&self) -> bool {
        self.confidence > KEYPOINT_CONFIDENCE
    }
}

/// Body pose with keypoints in COCO order (17 points)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pose {
    pub keypoints: Vec<Keypoint>,
}

/// Left and right wrist in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WristPair {
    pub left: (f32, f32),
    pub right: (f32, f32),
}

impl Pose {
    /// Whether enough keypoints are confidently visible to call it a body
    pub fn is_person(&self) -> bool {
        self.keypoints
            .iter()
            .filter(|k| k.is_visible())
            .count()
            >= MIN_VISIBLE_KEYPOINTS
    }

    /// Wrist positions scaled to a `width` x `height` image
    pub fn wrists(&self, width: u32, height: u32) -> Option<WristPair> {
        let left = self.keypoints.get(LEFT_WRIST)?;
        let right = self.keypoints.get(RIGHT_WRIST)?;
        let (w, h) = (width as f32, height as f32);
        Some(WristPair {
            left: (left.x * w, left.y * h),
            right: (right.x * w, right.y * h),
        })
    }

    /// All keypoints above the visibility threshold, in pixel coordinates
    pub fn visible_points(&self, width: u32, height: u32) -> Vec<(f32, f32)> {
        self.keypoints
            .iter()
            .filter(|k| k.is_visible())
            .map(|k| (k.x * width as f32, k.y * height as f32))
            .collect()
    }
}

/// Detects a face mesh
pub trait FaceLandmarker: Send + Sync {
    /// Ok(None) when no face is visible
    fn detect(&self, image: &RgbImage) -> Result<Option<FaceLandmarks>, PerceptionError>;
}

/// Estimates a body pose
pub trait PoseEstimator: Send + Sync {
    /// Ok(None) when no body is visible
    fn detect(&self, image: &RgbImage) -> Result<Option<Pose>, PerceptionError>;

    /// Name for logging
    fn name(&self) -> &'static str {
        "pose"
    }
}

/// Classifies whether the baby is in frame
pub trait OcclusionClassifier: Send + Sync {
    /// Returns [P(present), P(absent)]
    fn predict(&self, image: &RgbImage) -> Result<[f32; 2], PerceptionError>;
}

/// Scores a mono PCM chunk for crying
pub trait AudioClassifier: Send + Sync {
    /// Cry confidence in [0, 1]
    fn classify(&self, samples: &[f32]) -> Result<f32, PerceptionError>;

    fn name(&self) -> &'static str;
}

/// The set of video adapters available to the voting engine
#[derive(Clone, Default)]
pub struct Perception {
    pub face: Option<Arc<dyn FaceLandmarker>>,
    pub pose: Option<Arc<dyn PoseEstimator>>,
    /// Consulted when the primary estimator finds no body
    pub secondary_pose: Option<Arc<dyn PoseEstimator>>,
    pub occlusion: Option<Arc<dyn OcclusionClassifier>>,
}

impl std::fmt::Debug for Perception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Perception")
            .field("face", &self.face.is_some())
            .field("pose", &self.pose.is_some())
            .field("secondary_pose", &self.secondary_pose.is_some())
            .field("occlusion", &self.occlusion.is_some())
            .finish()
    }
}

/// Build the video adapters from config
pub fn create_perception(config: &PerceptionConfig) -> Result<Perception, PerceptionError> {
    let mut perception = Perception::default();

    if let Some(ref endpoint) = config.endpoint {
        let remote = Arc::new(remote::RemotePerception::new(endpoint, config.timeout_secs)?);
        perception.face = Some(remote.clone());
        perception.pose = Some(remote.clone());
        perception.occlusion = Some(remote);
    } else {
        tracing::warn!("No perception endpoint configured; sleep detection is inactive");
    }

    if let Some(ref endpoint) = config.secondary_pose_endpoint {
        let secondary = remote::RemotePerception::new(endpoint, config.timeout_secs)?
            .with_name("secondary-pose");
        perception.secondary_pose = Some(Arc::new(secondary));
    }

    Ok(perception)
}

/// Build the audio classifier from config, if cry detection can run at all
pub fn create_audio_classifier(
    config: &Config,
) -> Result<Option<Arc<dyn AudioClassifier>>, PerceptionError> {
    if let Some(ref endpoint) = config.perception.endpoint {
        let remote = remote::RemotePerception::new(endpoint, config.perception.timeout_secs)?;
        return Ok(Some(Arc::new(remote)));
    }
    if config.perception.energy_audio_fallback {
        tracing::info!("Using energy-based cry classifier");
        return Ok(Some(Arc::new(energy::EnergyCryClassifier::new(
            config.audio.sample_rate,
        ))));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose_with(confidences: &[f32]) -> Pose {
        Pose {
            keypoints: confidences
                .iter()
                .enumerate()
                .map(|(i, &c)| Keypoint {
                    x: i as f32 / 20.0,
                    y: 0.5,
                    confidence: c,
                })
                .collect(),
        }
    }

    #[test]
    fn test_person_needs_four_visible_keypoints() {
        assert!(!pose_with(&[0.9, 0.9, 0.9, 0.1, 0.2]).is_person());
        assert!(pose_with(&[0.9, 0.9, 0.9, 0.3, 0.0]).is_person());
        assert!(!Pose::default().is_person());
    }

    #[test]
    fn test_threshold_confidence_is_not_visible() {
        let pose = pose_with(&[0.9, 0.9, 0.9, 0.2, 0.21]);
        assert!(pose.is_person());
        assert_eq!(pose.visible_points(20, 10).len(), 4);

        let edge = pose_with(&[0.9, 0.9, 0.9, 0.2]);
        assert!(!edge.is_person());
        assert_eq!(edge.visible_points(20, 10).len(), 3);
    }

    #[test]
    fn test_wrists_scaled_to_pixels() {
        let mut keypoints = vec![Keypoint::default(); 17];
        keypoints[LEFT_WRIST] = Keypoint {
            x: 0.25,
            y: 0.5,
            confidence: 0.9,
        };
        keypoints[RIGHT_WRIST] = Keypoint {
            x: 0.75,
            y: 0.5,
            confidence: 0.9,
        };
        let pose = Pose { keypoints };
        let wrists = pose.wrists(200, 100).unwrap();
        assert_eq!(wrists.left, (50.0, 50.0));
        assert_eq!(wrists.right, (150.0, 50.0));
    }

    #[test]
    fn test_wrists_missing_on_short_pose() {
        assert!(pose_with(&[0.9; 5]).wrists(100, 100).is_none());
    }

    #[test]
    fn test_no_endpoint_means_no_video_adapters() {
        let perception = create_perception(&PerceptionConfig::default()).unwrap();
        assert!(perception.face.is_none());
        assert!(perception.pose.is_none());
        assert!(perception.occlusion.is_none());
    }

    #[test]
    fn test_energy_fallback_for_audio() {
        let config = Config::default();
        let classifier = create_audio_classifier(&config).unwrap().unwrap();
        assert_eq!(classifier.name(), "energy");

        let mut config = Config::default();
        config.perception.energy_audio_fallback = false;
        assert!(create_audio_classifier(&config).unwrap().is_none());
    }
}
