//! Camera and audio capture
//!
//! Sources are driven by a dedicated thread each. A session lasts until
//! the source errors; the outer loop then backs off and reconnects,
//! forever. Frames and chunks go into bounded channels with drop-oldest
//! semantics, so a slow consumer never stalls capture.

pub mod ffmpeg;
pub mod microphone;

use crate::clock::{Clock, SharedClock};
use crate::config::{AudioSourceKind, Config};
use crate::error::CaptureError;
use crate::frame::{AudioChunk, Frame};
use crate::pipeline::BoundedChannel;
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;

/// A source of RGB frames
pub trait VideoSource: Send {
    /// (Re)open the underlying stream
    fn connect(&mut self) -> Result<(), CaptureError>;

    /// Block until the next frame
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError>;

    fn name(&self) -> &'static str {
        "video"
    }
}

/// A source of mono f32 audio chunks at the configured sample rate
pub trait AudioSource: Send {
    fn connect(&mut self) -> Result<(), CaptureError>;

    /// Block until the next full chunk
    fn read_chunk(&mut self) -> Result<Vec<f32>, CaptureError>;

    fn name(&self) -> &'static str {
        "audio"
    }
}

fn ensure_ffmpeg() -> Result<(), CaptureError> {
    which::which("ffmpeg")
        .map(|_| ())
        .map_err(|_| CaptureError::FfmpegNotFound)
}

/// Video source for the configured camera
pub fn create_video_source(config: &Config) -> Result<Box<dyn VideoSource>, CaptureError> {
    let url = config.camera.url.as_deref().ok_or(CaptureError::NoCameraUrl)?;
    ensure_ffmpeg()?;
    Ok(Box::new(ffmpeg::FfmpegVideoSource::new(
        url,
        config.camera.frame_width,
        config.camera.frame_height,
        config.camera.output_fps,
    )))
}

/// Audio source per `[audio] source`; None when audio is disabled
pub fn create_audio_source(config: &Config) -> Result<Option<Box<dyn AudioSource>>, CaptureError> {
    let chunk_samples = config.audio.chunk_samples();
    match config.audio.source {
        AudioSourceKind::Disabled => Ok(None),
        AudioSourceKind::Camera => {
            let url = config.camera.url.as_deref().ok_or(CaptureError::NoCameraUrl)?;
            ensure_ffmpeg()?;
            Ok(Some(Box::new(ffmpeg::FfmpegAudioSource::new(
                url,
                config.audio.sample_rate,
                chunk_samples,
            ))))
        }
        AudioSourceKind::Microphone => Ok(Some(Box::new(microphone::MicrophoneSource::new(
            &config.audio.device,
            config.audio.sample_rate,
            chunk_samples,
        )))),
    }
}

/// Run one connection of a video source. Returns the error that ended it.
pub fn video_session(
    source: &mut dyn VideoSource,
    channel: &BoundedChannel<Frame>,
    clock: &dyn Clock,
) -> CaptureError {
    if let Err(e) = source.connect() {
        return e;
    }
    tracing::info!("{} connected", source.name());

    let mut frames = 0u64;
    loop {
        match source.read_frame() {
            Ok(image) => {
                if channel.push(Frame::new(image, clock.now())) {
                    tracing::trace!("Capture channel full, dropped oldest frame");
                }
                frames += 1;
                if frames == 1 {
                    tracing::debug!("First frame received from {}", source.name());
                }
            }
            Err(e) => {
                tracing::debug!("{} ended after {} frames", source.name(), frames);
                return e;
            }
        }
    }
}

/// Run one connection of an audio source. Returns the error that ended it.
pub fn audio_session(
    source: &mut dyn AudioSource,
    channel: &BoundedChannel<AudioChunk>,
    clock: &dyn Clock,
) -> CaptureError {
    if let Err(e) = source.connect() {
        return e;
    }
    tracing::info!("{} connected", source.name());

    loop {
        match source.read_chunk() {
            Ok(samples) => {
                channel.push(AudioChunk {
                    samples,
                    captured_at: clock.now(),
                });
            }
            Err(e) => return e,
        }
    }
}

/// Capture video forever, reconnecting after `backoff`
pub fn run_video_capture(
    mut source: Box<dyn VideoSource>,
    channel: Arc<BoundedChannel<Frame>>,
    clock: SharedClock,
    backoff: Duration,
) {
    loop {
        let e = video_session(source.as_mut(), &channel, clock.as_ref());
        tracing::warn!(
            "{} interrupted ({}), reconnecting in {}s",
            source.name(),
            e,
            backoff.as_secs()
        );
        std::thread::sleep(backoff);
    }
}

/// Capture audio forever, reconnecting after `backoff`
pub fn run_audio_capture(
    mut source: Box<dyn AudioSource>,
    channel: Arc<BoundedChannel<AudioChunk>>,
    clock: SharedClock,
    backoff: Duration,
) {
    loop {
        let e = audio_session(source.as_mut(), &channel, clock.as_ref());
        tracing::warn!(
            "{} interrupted ({}), reconnecting in {}s",
            source.name(),
            e,
            backoff.as_secs()
        );
        std::thread::sleep(backoff);
    }
}
