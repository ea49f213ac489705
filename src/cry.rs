//! Cry onset/offset tracking
//!
//! [`CryDetector`] smooths raw classifier scores into a crying/not-crying
//! observation. [`CryTracker`] turns those observations into cry episodes
//! with asymmetric thresholds: 3 consecutive positives open an episode,
//! 5 consecutive negatives close it.

use crate::config::CryConfig;
use crate::voting::window::RollingWindow;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How hard the baby is crying, banded by classifier confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    Fussing,
    Crying,
    Screaming,
}

impl Intensity {
    /// >0.85 screaming, >0.7 crying, else fussing
    pub fn from_confidence(confidence: f32) -> Self {
        if confidence > 0.85 {
            Intensity::Screaming
        } else if confidence > 0.7 {
            Intensity::Crying
        } else {
            Intensity::Fussing
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Intensity::Fussing => "fussing",
            Intensity::Crying => "crying",
            Intensity::Screaming => "screaming",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fussing" => Some(Intensity::Fussing),
            "crying" => Some(Intensity::Crying),
            "screaming" => Some(Intensity::Screaming),
            _ => None,
        }
    }
}

impl fmt::Display for Intensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opening or closing of a cry episode
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CryTransition {
    Started {
        confidence: f32,
        intensity: Intensity,
        at: DateTime<Utc>,
    },
    Stopped {
        duration: Duration,
        at: DateTime<Utc>,
    },
}

/// Onset/offset counter state machine
#[derive(Debug)]
pub struct CryTracker {
    crying_since: Option<DateTime<Utc>>,
    consecutive_positive: u32,
    consecutive_negative: u32,
    onset_threshold: u32,
    offset_threshold: u32,
}

impl CryTracker {
    pub fn new(onset_threshold: u32, offset_threshold: u32) -> Self {
        Self {
            crying_since: None,
            consecutive_positive: 0,
            consecutive_negative: 0,
            onset_threshold: onset_threshold.max(1),
            offset_threshold: offset_threshold.max(1),
        }
    }

    pub fn from_config(config: &CryConfig) -> Self {
        Self::new(config.onset_threshold, config.offset_threshold)
    }

    pub fn is_crying(&self) -> bool {
        self.crying_since.is_some()
    }

    pub fn consecutive_positive(&self) -> u32 {
        self.consecutive_positive
    }

    pub fn consecutive_negative(&self) -> u32 {
        self.consecutive_negative
    }

    /// Feed one classification
    pub fn update(
        &mut self,
        is_crying: bool,
        confidence: f32,
        now: DateTime<Utc>,
    ) -> Option<CryTransition> {
        if is_crying {
            self.consecutive_positive += 1;
            self.consecutive_negative = 0;
            if self.crying_since.is_none() && self.consecutive_positive >= self.onset_threshold {
                self.crying_since = Some(now);
                let intensity = Intensity::from_confidence(confidence);
                tracing::info!(
                    "Cry started (confidence: {:.2}, intensity: {})",
                    confidence,
                    intensity
                );
                return Some(CryTransition::Started {
                    confidence,
                    intensity,
                    at: now,
                });
            }
        } else {
            self.consecutive_negative += 1;
            self.consecutive_positive = 0;
            if self.consecutive_negative >= self.offset_threshold {
                if let Some(started) = self.crying_since.take() {
                    let duration = now - started;
                    tracing::info!("Cry stopped after {} seconds", duration.num_seconds());
                    return Some(CryTransition::Stopped { duration, at: now });
                }
            }
        }
        None
    }
}

/// Smooths raw classifier scores over a short window
#[derive(Debug)]
pub struct CryDetector {
    scores: RollingWindow<f32>,
    threshold: f32,
}

impl CryDetector {
    pub fn new(config: &CryConfig) -> Self {
        Self {
            scores: RollingWindow::new(config.smoothing_window),
            threshold: config.confidence_threshold,
        }
    }

    /// Add a raw score; returns (is_crying, smoothed confidence)
    pub fn observe(&mut self, score: f32) -> (bool, f32) {
        self.scores.push(score.clamp(0.0, 1.0));
        let mean = self.scores.mean().unwrap_or(0.0);
        (mean > self.threshold, mean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_onset_three_offset_five() {
        let mut tracker = CryTracker::new(3, 5);
        let sequence = [0, 1, 1, 1, 0, 0, 0, 0, 0];
        let mut events = Vec::new();
        for (i, &v) in sequence.iter().enumerate() {
            if let Some(e) = tracker.update(v == 1, 0.9, t(i as i64 * 2)) {
                events.push((i, e));
            }
        }
        assert_eq!(events.len(), 2);

        let (start_idx, start) = events[0];
        assert_eq!(start_idx, 3);
        assert!(matches!(
            start,
            CryTransition::Started {
                intensity: Intensity::Screaming,
                ..
            }
        ));

        let (stop_idx, stop) = events[1];
        assert_eq!(stop_idx, 8);
        match stop {
            CryTransition::Stopped { duration, .. } => assert_eq!(duration, Duration::seconds(10)),
            other => panic!("expected stop, got {:?}", other),
        }
        assert!(!tracker.is_crying());
    }

    #[test]
    fn test_negative_resets_positive_streak() {
        let mut tracker = CryTracker::new(3, 5);
        assert!(tracker.update(true, 0.8, t(0)).is_none());
        assert!(tracker.update(true, 0.8, t(2)).is_none());
        assert_eq!(tracker.consecutive_positive(), 2);

        assert!(tracker.update(false, 0.1, t(4)).is_none());
        assert_eq!(tracker.consecutive_positive(), 0);
        assert_eq!(tracker.consecutive_negative(), 1);

        assert!(tracker.update(true, 0.8, t(6)).is_none());
        assert!(tracker.update(true, 0.8, t(8)).is_none());
        assert!(!tracker.is_crying());
    }

    #[test]
    fn test_short_quiet_does_not_end_episode() {
        let mut tracker = CryTracker::new(3, 5);
        for i in 0..3 {
            tracker.update(true, 0.75, t(i));
        }
        assert!(tracker.is_crying());
        for i in 3..7 {
            assert!(tracker.update(false, 0.1, t(i)).is_none());
        }
        // A single positive resets the quiet streak
        assert!(tracker.update(true, 0.75, t(7)).is_none());
        assert_eq!(tracker.consecutive_negative(), 0);
        assert!(tracker.is_crying());
    }

    #[test]
    fn test_no_second_start_while_crying() {
        let mut tracker = CryTracker::new(3, 5);
        let starts = (0..20)
            .filter_map(|i| tracker.update(true, 0.9, t(i)))
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_quiet_without_episode_emits_nothing() {
        let mut tracker = CryTracker::new(3, 5);
        for i in 0..20 {
            assert!(tracker.update(false, 0.0, t(i)).is_none());
        }
    }

    #[test]
    fn test_intensity_bands() {
        assert_eq!(Intensity::from_confidence(0.9), Intensity::Screaming);
        assert_eq!(Intensity::from_confidence(0.85), Intensity::Crying);
        assert_eq!(Intensity::from_confidence(0.71), Intensity::Crying);
        assert_eq!(Intensity::from_confidence(0.7), Intensity::Fussing);
        assert_eq!(Intensity::from_confidence(0.1), Intensity::Fussing);
    }

    #[test]
    fn test_detector_smooths_spikes() {
        let mut detector = CryDetector::new(&CryConfig::default());
        // One loud spike among quiet chunks stays below threshold
        assert_eq!(detector.observe(0.0), (false, 0.0));
        let (crying, _) = detector.observe(1.0);
        assert!(!crying);
        for _ in 0..5 {
            detector.observe(0.9);
        }
        let (crying, confidence) = detector.observe(0.9);
        assert!(crying);
        assert!((confidence - 0.9).abs() < 1e-5);
    }
}
