//! Frames, crop regions and the small set of image operations the
//! detection loop needs (crop, resize, blur, difference, PNG output)

use chrono::{DateTime, Utc};
use image::{imageops, ImageFormat, Rgb, RgbImage};
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// A raw frame from the video capture worker
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Arc<RgbImage>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: DateTime<Utc>) -> Self {
        Self {
            image: Arc::new(image),
            captured_at,
        }
    }
}

/// What one detection cycle works on: the cropped classifier input plus
/// the uncropped frame it came from
#[derive(Debug, Clone)]
pub struct DetectionInput {
    pub cropped: RgbImage,
    pub raw: Arc<RgbImage>,
    pub captured_at: DateTime<Utc>,
}

/// Mono f32 PCM from the audio capture worker
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub captured_at: DateTime<Utc>,
}

/// Rectangular crop region in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Interpret `self` as coordinates inside `parent` and return the
    /// equivalent region in `parent`'s coordinate space
    pub fn relative_to(&self, parent: &Region) -> Region {
        let x = parent.x.saturating_add(self.x.min(parent.width));
        let y = parent.y.saturating_add(self.y.min(parent.height));
        let right = parent.x.saturating_add(parent.width);
        let bottom = parent.y.saturating_add(parent.height);
        Region {
            x,
            y,
            width: self.width.min(right.saturating_sub(x)),
            height: self.height.min(bottom.saturating_sub(y)),
        }
    }

    /// Clip the region to an image of the given size.
    ///
    /// Returns None when nothing of the region is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Region> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(Region::new(self.x, self.y, w, h))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

impl FromStr for Region {
    type Err = String;

    /// Parse "x,y,w,h"; fractional values are truncated
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(s.to_string());
        }
        let mut values = [0u32; 4];
        for (slot, part) in values.iter_mut().zip(&parts) {
            let v: f64 = part.parse().map_err(|_| s.to_string())?;
            if !v.is_finite() || v < 0.0 {
                return Err(s.to_string());
            }
            *slot = v as u32;
        }
        if values[2] == 0 || values[3] == 0 {
            return Err(s.to_string());
        }
        if values[0].checked_add(values[2]).is_none() || values[1].checked_add(values[3]).is_none()
        {
            return Err(s.to_string());
        }
        Ok(Region::new(values[0], values[1], values[2], values[3]))
    }
}

/// Crop an image to a region (clipped to the image bounds)
pub fn crop(image: &RgbImage, region: &Region) -> Option<RgbImage> {
    let r = region.clamp_to(image.width(), image.height())?;
    Some(imageops::crop_imm(image, r.x, r.y, r.width, r.height).to_image())
}

/// Resize to a target width keeping the aspect ratio
pub fn resize_to_width(image: &RgbImage, width: u32) -> RgbImage {
    if image.width() == width || image.width() == 0 {
        return image.clone();
    }
    let ratio = width as f64 / image.width() as f64;
    let height = ((image.height() as f64 * ratio) as u32).max(1);
    imageops::resize(image, width, height, imageops::FilterType::Triangle)
}

/// Downscale frames larger than `max_width` x `max_height`, keeping the
/// aspect ratio. Smaller frames are returned unchanged.
pub fn fit_within(image: RgbImage, max_width: u32, max_height: u32) -> RgbImage {
    if image.width() <= max_width || image.height() <= max_height {
        return image;
    }
    resize_to_width(&image, max_width)
}

/// Light Gaussian blur used before frame differencing
pub fn blur(image: &RgbImage) -> RgbImage {
    imageops::blur(image, 0.8)
}

/// Mean absolute per-channel difference between two equally sized images.
///
/// Returns None when the dimensions differ.
pub fn mean_abs_diff(a: &RgbImage, b: &RgbImage) -> Option<f32> {
    if a.dimensions() != b.dimensions() {
        return None;
    }
    let raw_a = a.as_raw();
    let raw_b = b.as_raw();
    if raw_a.is_empty() {
        return Some(0.0);
    }
    let total: u64 = raw_a
        .iter()
        .zip(raw_b.iter())
        .map(|(&x, &y)| (x as i16 - y as i16).unsigned_abs() as u64)
        .sum();
    Some(total as f32 / raw_a.len() as f32)
}

/// Draw a small filled square at each point (pixel coordinates)
pub fn mark_points(image: &mut RgbImage, points: &[(f32, f32)], color: [u8; 3]) {
    const HALF: i64 = 2;
    let (w, h) = (image.width() as i64, image.height() as i64);
    for &(px, py) in points {
        let (cx, cy) = (px as i64, py as i64);
        for y in (cy - HALF)..=(cy + HALF) {
            for x in (cx - HALF)..=(cx + HALF) {
                if x >= 0 && y >= 0 && x < w && y < h {
                    image.put_pixel(x as u32, y as u32, Rgb(color));
                }
            }
        }
    }
}

/// Encode an image as PNG bytes
pub fn encode_png(image: &RgbImage) -> image::ImageResult<Vec<u8>> {
    let mut buffer = Vec::new();
    image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
    Ok(buffer)
}

/// Write an image as PNG, creating parent directories as needed
pub fn save_png(image: &RgbImage, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(std::io::Error::other)
}
