//! Eye and mouth openness from a face mesh
//!
//! Ratios are computed on normalized landmark coordinates:
//! - eye: horizontal / vertical extent, averaged over both eyes; a wide,
//!   flat eye (ratio above [`EYE_CLOSED_RATIO`]) is closed
//! - mouth: mean inner-lip gap against the thinner of the two lips

use super::{FaceLandmarks, Landmark};

/// Face mesh indices outlining the left eye
pub const LEFT_EYE: [usize; 16] = [
    362, 382, 381, 380, 374, 373, 390, 249, 263, 466, 388, 387, 386, 385, 384, 398,
];

/// Face mesh indices outlining the right eye
pub const RIGHT_EYE: [usize; 16] = [
    33, 7, 163, 144, 145, 153, 154, 155, 133, 173, 157, 158, 159, 160, 161, 246,
];

/// Eye closed above this horizontal/vertical ratio
pub const EYE_CLOSED_RATIO: f32 = 5.0;

/// Mouth open when its gap exceeds this fraction of the thinner lip
pub const MOUTH_OPEN_RATIO: f32 = 0.8;

const TOP_LIP: [(usize, usize); 3] = [(39, 81), (0, 13), (269, 311)];
const BOTTOM_LIP: [(usize, usize); 3] = [(181, 178), (17, 14), (405, 402)];
const MOUTH_GAP: [(usize, usize); 3] = [(178, 81), (14, 13), (402, 311)];

fn distance_2d(a: &Landmark, b: &Landmark) -> f32 {
    ((b.x - a.x).powi(2) + (b.y - a.y).powi(2)).sqrt()
}

fn distance_3d(a: &Landmark, b: &Landmark) -> f32 {
    ((b.x - a.x).powi(2) + (b.y - a.y).powi(2) + (b.z - a.z).powi(2)).sqrt()
}

fn eye_ratio(points: &[Landmark], eye: &[usize; 16]) -> Option<f32> {
    let horizontal = distance_2d(points.get(eye[0])?, points.get(eye[8])?);
    let vertical = distance_2d(points.get(eye[12])?, points.get(eye[4])?);
    if vertical <= f32::EPSILON {
        return Some(f32::INFINITY);
    }
    Some(horizontal / vertical)
}

fn mean_span(points: &[Landmark], pairs: &[(usize, usize); 3]) -> Option<f32> {
    let mut total = 0.0;
    for &(a, b) in pairs {
        total += distance_3d(points.get(a)?, points.get(b)?);
    }
    Some(total / pairs.len() as f32)
}

/// Average closed-ratio of both eyes; None if the mesh is incomplete
pub fn closed_ratio(face: &FaceLandmarks) -> Option<f32> {
    let right = eye_ratio(&face.points, &RIGHT_EYE)?;
    let left = eye_ratio(&face.points, &LEFT_EYE)?;
    Some((right + left) / 2.0)
}

pub fn eyes_open(face: &FaceLandmarks) -> Option<bool> {
    closed_ratio(face).map(|ratio| ratio <= EYE_CLOSED_RATIO)
}

pub fn mouth_open(face: &FaceLandmarks) -> Option<bool> {
    let top = mean_span(&face.points, &TOP_LIP)?;
    let bottom = mean_span(&face.points, &BOTTOM_LIP)?;
    let gap = mean_span(&face.points, &MOUTH_GAP)?;
    Some(gap > top.min(bottom) * MOUTH_OPEN_RATIO)
}

/// Whether this face counts as "awake" for the eye vote.
///
/// Closed eyes with an open mouth (crying, yawning) count as awake.
pub fn looks_awake(face: &FaceLandmarks) -> Option<bool> {
    if eyes_open(face)? {
        tracing::trace!("Eyes open");
        return Some(true);
    }
    let mouth = mouth_open(face)?;
    if mouth {
        tracing::debug!("Eyes closed, mouth open: crying or yawning");
    }
    Some(mouth)
}
