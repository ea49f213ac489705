//! ffmpeg subprocess capture
//!
//! Video is decoded to fixed-size rgb24 frames on stdout; audio is
//! extracted as mono s16le PCM. RTSP inputs are forced over TCP.

use super::{AudioSource, VideoSource};
use crate::error::CaptureError;
use image::RgbImage;
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};

/// A running ffmpeg process and its stdout; killed on drop
struct FfmpegProcess {
    child: Child,
    stdout: ChildStdout,
}

impl FfmpegProcess {
    fn spawn(args: &[String]) -> Result<Self, CaptureError> {
        tracing::debug!("Spawning ffmpeg {}", args.join(" "));
        let mut child = Command::new("ffmpeg")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CaptureError::Spawn(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Spawn("ffmpeg stdout unavailable".into()))?;
        Ok(Self { child, stdout })
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), CaptureError> {
        self.stdout
            .read_exact(buf)
            .map_err(|e| CaptureError::StreamEnded(e.to_string()))
    }
}

impl Drop for FfmpegProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn input_args(url: &str) -> Vec<String> {
    let mut args = vec!["-hide_banner".to_string(), "-loglevel".into(), "error".into()];
    if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        args.extend(["-rtsp_transport".into(), "tcp".into()]);
    }
    args.extend(["-i".into(), url.to_string()]);
    args
}

/// Build ffmpeg arguments for rgb24 frames of a fixed size
pub fn video_args(url: &str, width: u32, height: u32, fps: u32) -> Vec<String> {
    let mut args = input_args(url);
    args.extend([
        "-an".into(),
        "-r".into(),
        fps.max(1).to_string(),
        "-vf".into(),
        format!("scale={}:{}", width, height),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-".into(),
    ]);
    args
}

/// Build ffmpeg arguments for mono s16le PCM
pub fn audio_args(url: &str, sample_rate: u32) -> Vec<String> {
    let mut args = input_args(url);
    args.extend([
        "-vn".into(),
        "-acodec".into(),
        "pcm_s16le".into(),
        "-ar".into(),
        sample_rate.to_string(),
        "-ac".into(),
        "1".into(),
        "-f".into(),
        "s16le".into(),
        "-".into(),
    ]);
    args
}

/// Convert little-endian s16 PCM to f32 in [-1, 1)
pub fn pcm_s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}

pub struct FfmpegVideoSource {
    url: String,
    width: u32,
    height: u32,
    fps: u32,
    process: Option<FfmpegProcess>,
    buffer: Vec<u8>,
}

impl FfmpegVideoSource {
    pub fn new(url: &str, width: u32, height: u32, fps: u32) -> Self {
        Self {
            url: url.to_string(),
            width: width.max(1),
            height: height.max(1),
            fps,
            process: None,
            buffer: Vec::new(),
        }
    }

    fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl VideoSource for FfmpegVideoSource {
    fn connect(&mut self) -> Result<(), CaptureError> {
        self.process = None;
        let args = video_args(&self.url, self.width, self.height, self.fps);
        self.process = Some(FfmpegProcess::spawn(&args)?);
        self.buffer = vec![0; self.frame_size()];
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| CaptureError::StreamEnded("not connected".into()))?;
        if let Err(e) = process.read_exact(&mut self.buffer) {
            self.process = None;
            return Err(e);
        }
        RgbImage::from_raw(self.width, self.height, self.buffer.clone())
            .ok_or_else(|| CaptureError::StreamEnded("incomplete frame".into()))
    }

    fn name(&self) -> &'static str {
        "ffmpeg video"
    }
}

pub struct FfmpegAudioSource {
    url: String,
    sample_rate: u32,
    chunk_samples: usize,
    process: Option<FfmpegProcess>,
}

impl FfmpegAudioSource {
    pub fn new(url: &str, sample_rate: u32, chunk_samples: usize) -> Self {
        Self {
            url: url.to_string(),
            sample_rate,
            chunk_samples: chunk_samples.max(1),
            process: None,
        }
    }
}

impl AudioSource for FfmpegAudioSource {
    fn connect(&mut self) -> Result<(), CaptureError> {
        self.process = None;
        let args = audio_args(&self.url, self.sample_rate);
        self.process = Some(FfmpegProcess::spawn(&args)?);
        Ok(())
    }

    fn read_chunk(&mut self) -> Result<Vec<f32>, CaptureError> {
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| CaptureError::StreamEnded("not connected".into()))?;
        let mut raw = vec![0u8; self.chunk_samples * 2];
        if let Err(e) = process.read_exact(&mut raw) {
            self.process = None;
            return Err(e);
        }
        Ok(pcm_s16le_to_f32(&raw))
    }

    fn name(&self) -> &'static str {
        "ffmpeg audio"
    }
}
