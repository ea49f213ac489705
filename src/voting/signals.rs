//! Pure per-signal vote rules

use super::window::RollingWindow;
use super::VoteReason;
use crate::config::VotingConfig;
use crate::perception::WristPair;

/// A vote value and the reason recorded with it
pub type Vote = (f32, VoteReason);

/// Eye-state vote over the window of open/closed samples.
///
/// None until the window is more than half full. Otherwise the full eye
/// weight if the open fraction exceeds the threshold, else 0.
pub fn eye_vote(window: &RollingWindow<bool>, config: &VotingConfig) -> Option<Vote> {
    if !window.is_populated() {
        return None;
    }
    let open = window.iter().filter(|&&o| o).count() as f32;
    let fraction = open / window.len() as f32;
    if fraction > config.eyes_open_threshold {
        Some((config.eyes_vote_weight, VoteReason::EyesOpen))
    } else {
        Some((0.0, VoteReason::EyesClosed))
    }
}

/// Population standard deviation
pub fn pstdev(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    variance.sqrt()
}

/// Mean of the population standard deviations of left-x, left-y, right-x
/// and right-y. None until the window is more than half full.
pub fn movement_value(window: &RollingWindow<WristPair>) -> Option<f32> {
    if !window.is_populated() {
        return None;
    }
    let lx: Vec<f32> = window.iter().map(|w| w.left.0).collect();
    let ly: Vec<f32> = window.iter().map(|w| w.left.1).collect();
    let rx: Vec<f32> = window.iter().map(|w| w.right.0).collect();
    let ry: Vec<f32> = window.iter().map(|w| w.right.1).collect();
    Some((pstdev(&lx) + pstdev(&ly) + pstdev(&rx) + pstdev(&ry)) / 4.0)
}

pub fn movement_vote(window: &RollingWindow<WristPair>, config: &VotingConfig) -> Option<Vote> {
    let value = movement_value(window)?;
    if value >= config.movement_std_threshold {
        tracing::debug!("Wrist spread {:.1}: moving", value);
        Some((1.0, VoteReason::Moving))
    } else {
        tracing::debug!("Wrist spread {:.1}: not moving", value);
        Some((0.0, VoteReason::NotMoving))
    }
}

/// Occlusion vote from classifier output and the blurred frame difference.
///
/// Absent → full awake vote. Present → no vote unless the frame changed
/// by more than the diff threshold, then `diff / scale`.
pub fn occlusion_vote(
    probabilities: [f32; 2],
    frame_diff: Option<f32>,
    config: &VotingConfig,
) -> Option<Vote> {
    let present = probabilities[0] > 0.5;
    if !present {
        return Some((1.0, VoteReason::NoBabyPresent));
    }
    match frame_diff {
        Some(diff) if diff > config.image_diff_threshold => {
            Some((diff / config.image_diff_scale, VoteReason::Movement))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eyes(samples: &[bool], capacity: usize) -> RollingWindow<bool> {
        let mut w = RollingWindow::new(capacity);
        for &s in samples {
            w.push(s);
        }
        w
    }

    fn wrists(points: &[(f32, f32)]) -> RollingWindow<WristPair> {
        let mut w = RollingWindow::new(10);
        for &p in points {
            w.push(WristPair { left: p, right: p });
        }
        w
    }

    #[test]
    fn test_eye_vote_needs_half_window() {
        let config = VotingConfig::default();
        assert_eq!(eye_vote(&eyes(&[true; 15], 30), &config), None);
        assert_eq!(
            eye_vote(&eyes(&[true; 16], 30), &config),
            Some((3.0, VoteReason::EyesOpen))
        );
    }

    #[test]
    fn test_eye_vote_threshold_is_strict() {
        let config = VotingConfig::default();
        // exactly 75% open is not "more than" the threshold
        let mut samples = vec![true; 15];
        samples.extend([false; 5]);
        assert_eq!(
            eye_vote(&eyes(&samples, 30), &config),
            Some((0.0, VoteReason::EyesClosed))
        );
        samples.push(true);
        assert_eq!(
            eye_vote(&eyes(&samples, 30), &config),
            Some((3.0, VoteReason::EyesOpen))
        );
    }

    #[test]
    fn test_pstdev() {
        assert_eq!(pstdev(&[]), 0.0);
        assert_eq!(pstdev(&[5.0, 5.0, 5.0]), 0.0);
        assert!((pstdev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]) - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_still_wrists_vote_not_moving() {
        let config = VotingConfig::default();
        let window = wrists(&[(100.0, 100.0); 6]);
        assert_eq!(movement_value(&window), Some(0.0));
        assert_eq!(
            movement_vote(&window, &config),
            Some((0.0, VoteReason::NotMoving))
        );
    }

    #[test]
    fn test_flailing_wrists_vote_moving() {
        let config = VotingConfig::default();
        let window = wrists(&[(0.0, 0.0), (100.0, 100.0), (0.0, 0.0), (100.0, 100.0), (0.0, 0.0), (100.0, 100.0)]);
        // every axis has a population std of 50
        assert_eq!(movement_value(&window), Some(50.0));
        assert_eq!(movement_vote(&window, &config), Some((1.0, VoteReason::Moving)));
    }

    #[test]
    fn test_movement_needs_half_window() {
        let config = VotingConfig::default();
        assert_eq!(movement_vote(&wrists(&[(0.0, 0.0); 5]), &config), None);
    }

    #[test]
    fn test_occlusion_absent_is_full_vote() {
        let config = VotingConfig::default();
        assert_eq!(
            occlusion_vote([0.2, 0.8], None, &config),
            Some((1.0, VoteReason::NoBabyPresent))
        );
        // exactly 0.5 counts as absent
        assert_eq!(
            occlusion_vote([0.5, 0.5], Some(200.0), &config),
            Some((1.0, VoteReason::NoBabyPresent))
        );
    }

    #[test]
    fn test_occlusion_present_votes_only_on_large_change() {
        let config = VotingConfig::default();
        assert_eq!(occlusion_vote([0.9, 0.1], None, &config), None);
        assert_eq!(occlusion_vote([0.9, 0.1], Some(75.0), &config), None);
        assert_eq!(
            occlusion_vote([0.9, 0.1], Some(90.0), &config),
            Some((1.5, VoteReason::Movement))
        );
    }
}
