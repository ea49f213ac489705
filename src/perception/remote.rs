//! HTTP perception service client
//!
//! Talks to a perception server that wraps the actual models. One request
//! per call, blocking the calling worker:
//!
//! | route        | body                         | response                                   |
//! |--------------|------------------------------|--------------------------------------------|
//! | `/face`      | PNG                          | `{"landmarks": [[x, y, z], ...] \| null}`  |
//! | `/pose`      | PNG                          | `{"keypoints": [[x, y, conf], ...] \| null}` |
//! | `/occlusion` | PNG                          | `{"probabilities": [present, absent]}`     |
//! | `/audio`     | f32 little-endian mono PCM   | `{"confidence": 0.0..1.0}`                 |

use super::{
    AudioClassifier, FaceLandmarker, FaceLandmarks, Keypoint, Landmark, OcclusionClassifier, Pose,
    PoseEstimator,
};
use crate::error::PerceptionError;
use crate::frame;
use image::RgbImage;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct FaceResponse {
    landmarks: Option<Vec<[f32; 3]>>,
}

#[derive(Debug, Deserialize)]
struct PoseResponse {
    keypoints: Option<Vec<[f32; 3]>>,
}

#[derive(Debug, Deserialize)]
struct OcclusionResponse {
    probabilities: [f32; 2],
}

#[derive(Debug, Deserialize)]
struct AudioResponse {
    confidence: f32,
}

/// Client for a remote perception server
#[derive(Debug)]
pub struct RemotePerception {
    /// Base endpoint URL (e.g., "http://127.0.0.1:8500")
    endpoint: String,
    agent: ureq::Agent,
    timeout: Duration,
    name: &'static str,
}

impl RemotePerception {
    pub fn new(endpoint: &str, timeout_secs: u64) -> Result<Self, PerceptionError> {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(PerceptionError::Network(format!(
                "perception endpoint must start with http:// or https://, got: {}",
                endpoint
            )));
        }

        let timeout = Duration::from_secs(timeout_secs.max(1));
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();

        tracing::info!(
            "Configured remote perception: endpoint={}, timeout={}s",
            endpoint,
            timeout.as_secs()
        );

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            agent,
            timeout,
            name: "remote",
        })
    }

    /// Override the name reported in logs
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    fn url(&self, route: &str) -> String {
        format!("{}/{}", self.endpoint, route)
    }

    fn post<T: serde::de::DeserializeOwned>(
        &self,
        route: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<T, PerceptionError> {
        let start = std::time::Instant::now();
        let response = self
            .agent
            .post(&self.url(route))
            .set("Content-Type", content_type)
            .send_bytes(body)
            .map_err(|e| match e {
                ureq::Error::Status(code, _) => PerceptionError::Status(code),
                ureq::Error::Transport(t) => PerceptionError::Network(t.to_string()),
            })?;

        let parsed = response
            .into_json::<T>()
            .map_err(|e| PerceptionError::Malformed(format!("{} response: {}", route, e)))?;

        tracing::trace!(
            "{} /{} answered in {}ms",
            self.name,
            route,
            start.elapsed().as_millis()
        );
        Ok(parsed)
    }

    fn post_image<T: serde::de::DeserializeOwned>(
        &self,
        route: &str,
        image: &RgbImage,
    ) -> Result<T, PerceptionError> {
        let png = frame::encode_png(image).map_err(|e| PerceptionError::Encode(e.to_string()))?;
        self.post(route, "image/png", &png)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Serialize f32 samples as little-endian bytes
pub fn encode_pcm(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

fn face_from_response(response: FaceResponse) -> Option<FaceLandmarks> {
    let points: Vec<Landmark> = response
        .landmarks?
        .into_iter()
        .map(|[x, y, z]| Landmark { x, y, z })
        .collect();
    if points.is_empty() {
        None
    } else {
        Some(FaceLandmarks { points })
    }
}

fn pose_from_response(response: PoseResponse) -> Option<Pose> {
    let keypoints: Vec<Keypoint> = response
        .keypoints?
        .into_iter()
        .map(|[x, y, confidence]| Keypoint { x, y, confidence })
        .collect();
    if keypoints.is_empty() {
        None
    } else {
        Some(Pose { keypoints })
    }
}

fn validate_probabilities(p: [f32; 2]) -> Result<[f32; 2], PerceptionError> {
    if p.iter().any(|v| !v.is_finite() || *v < 0.0 || *v > 1.0) {
        return Err(PerceptionError::Malformed(format!(
            "occlusion probabilities out of range: {:?}",
            p
        )));
    }
    Ok(p)
}

impl FaceLandmarker for RemotePerception {
    fn detect(&self, image: &RgbImage) -> Result<Option<FaceLandmarks>, PerceptionError> {
        let response: FaceResponse = self.post_image("face", image)?;
        Ok(face_from_response(response))
    }
}

impl PoseEstimator for RemotePerception {
    fn detect(&self, image: &RgbImage) -> Result<Option<Pose>, PerceptionError> {
        let response: PoseResponse = self.post_image("pose", image)?;
        Ok(pose_from_response(response))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

impl OcclusionClassifier for RemotePerception {
    fn predict(&self, image: &RgbImage) -> Result<[f32; 2], PerceptionError> {
        let response: OcclusionResponse = self.post_image("occlusion", image)?;
        validate_probabilities(response.probabilities)
    }
}

impl AudioClassifier for RemotePerception {
    fn classify(&self, samples: &[f32]) -> Result<f32, PerceptionError> {
        if samples.is_empty() {
            return Err(PerceptionError::Encode("Empty audio chunk".into()));
        }
        let response: AudioResponse =
            self.post("audio", "application/octet-stream", &encode_pcm(samples))?;
        Ok(response.confidence.clamp(0.0, 1.0))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
