//! Energy-based cry classifier
//!
//! A crude stand-in for a real cry model: scores a chunk by the share of
//! 20ms frames that are loud. Sustained loud audio next to a sleeping baby
//! is almost always crying, and this needs no model download.

use super::AudioClassifier;
use crate::error::PerceptionError;

/// Default RMS level above which a frame counts as loud
const DEFAULT_LOUDNESS: f32 = 0.75;

/// Scores audio by the fraction of loud frames
#[derive(Debug)]
pub struct EnergyCryClassifier {
    /// RMS threshold for a loud frame
    threshold: f32,
    /// Samples per 20ms frame
    frame_size: usize,
}

impl EnergyCryClassifier {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_sensitivity(sample_rate, DEFAULT_LOUDNESS)
    }

    /// `loudness` in 0.0-1.0; higher demands louder audio
    pub fn with_sensitivity(sample_rate: u32, loudness: f32) -> Self {
        const FRAME_MS: usize = 20;
        Self {
            threshold: map_threshold_to_energy(loudness),
            frame_size: (sample_rate as usize * FRAME_MS / 1000).max(1),
        }
    }

    /// Calculate RMS energy of a sample slice
    fn calculate_rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_squares: f32 = samples.iter().map(|&s| s * s).sum();
        (sum_squares / samples.len() as f32).sqrt()
    }
}

/// Map a 0.0-1.0 loudness setting to an RMS threshold (0.001 to 0.1)
fn map_threshold_to_energy(loudness: f32) -> f32 {
    let t = loudness.clamp(0.0, 1.0);
    0.001 * (100.0_f32).powf(t)
}

impl AudioClassifier for EnergyCryClassifier {
    fn classify(&self, samples: &[f32]) -> Result<f32, PerceptionError> {
        if samples.is_empty() {
            return Ok(0.0);
        }

        let mut loud_frames = 0usize;
        let mut total_frames = 0usize;
        for frame in samples.chunks(self.frame_size) {
            total_frames += 1;
            if Self::calculate_rms(frame) >= self.threshold {
                loud_frames += 1;
            }
        }

        let score = loud_frames as f32 / total_frames as f32;
        tracing::trace!(
            "Energy cry score {:.2} ({} of {} frames loud, threshold {:.4})",
            score,
            loud_frames,
            total_frames,
            self.threshold
        );
        Ok(score)
    }

    fn name(&self) -> &'static str {
        "energy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(amplitude: f32, samples: usize) -> Vec<f32> {
        (0..samples)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 16000.0).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_silence_scores_zero() {
        let classifier = EnergyCryClassifier::new(16000);
        assert_eq!(classifier.classify(&vec![0.0; 32000]).unwrap(), 0.0);
        assert_eq!(classifier.classify(&[]).unwrap(), 0.0);
    }

    #[test]
    fn test_loud_audio_scores_high() {
        let classifier = EnergyCryClassifier::new(16000);
        let score = classifier.classify(&sine(0.5, 32000)).unwrap();
        assert!(score > 0.9);
    }

    #[test]
    fn test_partial_loudness() {
        let classifier = EnergyCryClassifier::new(16000);
        let mut samples = sine(0.5, 16000);
        samples.extend(vec![0.0; 16000]);
        let score = classifier.classify(&samples).unwrap();
        assert!((score - 0.5).abs() < 0.05);
    }

    #[test]
    fn test_quiet_audio_below_threshold() {
        let classifier = EnergyCryClassifier::new(16000);
        let score = classifier.classify(&sine(0.005, 32000)).unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_threshold_mapping() {
        let low = map_threshold_to_energy(0.0);
        let mid = map_threshold_to_energy(0.5);
        let high = map_threshold_to_energy(1.0);
        assert!(low < mid);
        assert!(mid < high);
        assert!(low >= 0.001);
        assert!(high <= 0.1001);
    }

    #[test]
    fn test_calculate_rms() {
        let ones = vec![1.0f32; 100];
        assert!((EnergyCryClassifier::calculate_rms(&ones) - 1.0).abs() < 0.001);
        assert_eq!(EnergyCryClassifier::calculate_rms(&[]), 0.0);
    }
}
