//! Error types for cribwatch
//!
//! Uses thiserror for ergonomic error definitions. Only startup paths
//! propagate these to the top level; the long-running workers log them
//! and keep going.

use thiserror::Error;

/// Top-level error type for the cribwatch daemon
#[derive(Error, Debug)]
pub enum CribError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Perception error: {0}")]
    Perception(#[from] PerceptionError),

    #[error("Event store error: {0}")]
    Store(#[from] StoreError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the video/audio capture adapters
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("ffmpeg not found in PATH. Install it via your package manager.")]
    FfmpegNotFound,

    #[error("No camera URL configured. Set [camera] url or CRIBWATCH_CAMERA_URL.")]
    NoCameraUrl,

    #[error("Failed to start capture process: {0}")]
    Spawn(String),

    #[error("Stream ended: {0}")]
    StreamEnded(String),

    #[error("Audio device not found: '{0}'")]
    DeviceNotFound(String),

    #[error("Audio stream error: {0}")]
    Stream(String),
}

/// Errors from the external perception services
#[derive(Error, Debug)]
pub enum PerceptionError {
    #[error("Perception service unreachable: {0}")]
    Network(String),

    #[error("Perception service returned status {0}")]
    Status(u16),

    #[error("Malformed perception response: {0}")]
    Malformed(String),

    #[error("Failed to encode input: {0}")]
    Encode(String),
}

/// Errors from the event store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Event store lock poisoned")]
    Poisoned,
}

/// Errors from a single notification channel
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("{channel} returned status {status}")]
    Status { channel: &'static str, status: u16 },

    #[error("Notifier command failed: {0}")]
    Command(String),
}

/// Errors from the inbound control surface
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Invalid focus region '{0}', expected x,y,w,h")]
    InvalidRegion(String),

    #[error("Invalid sample label '{0}', expected 'present' or 'absent'")]
    InvalidLabel(String),

    #[error("No frame available for a retraining sample")]
    NoSampleFrame,

    #[error("Unknown notification category '{0}'")]
    UnknownCategory(String),

    #[error("Malformed control request: {0}")]
    Request(String),

    #[error("Retraining command failed: {0}")]
    Retrain(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using CribError
pub type Result<T> = std::result::Result<T, CribError>;
