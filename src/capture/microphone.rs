//! Local microphone capture through cpal
//!
//! Works with PipeWire, PulseAudio and ALSA backends. cpal::Stream is not
//! Send, so the stream lives on its own thread and hands mono, resampled
//! samples back over a channel.

use super::AudioSource;
use crate::error::CaptureError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Silence this long means the device went away
const STALL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MicrophoneSource {
    device: String,
    sample_rate: u32,
    chunk_samples: usize,
    samples: Option<mpsc::Receiver<Vec<f32>>>,
    pending: Vec<f32>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MicrophoneSource {
    pub fn new(device: &str, sample_rate: u32, chunk_samples: usize) -> Self {
        Self {
            device: device.to_string(),
            sample_rate,
            chunk_samples: chunk_samples.max(1),
            samples: None,
            pending: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.samples = None;
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        self.pending.clear();
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Find an input device by name: exact, then case-insensitive, then substring
fn find_input_device(host: &cpal::Host, name: &str) -> Result<cpal::Device, CaptureError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    if name == "default" {
        return host
            .default_input_device()
            .ok_or_else(|| CaptureError::DeviceNotFound("default".to_string()));
    }

    let devices: Vec<(String, cpal::Device)> = host
        .input_devices()
        .map_err(|e| CaptureError::Stream(e.to_string()))?
        .filter_map(|d| d.name().ok().map(|n| (n, d)))
        .collect();

    let lower = name.to_lowercase();
    let position = devices
        .iter()
        .position(|(n, _)| n == name)
        .or_else(|| devices.iter().position(|(n, _)| n.to_lowercase() == lower))
        .or_else(|| devices.iter().position(|(n, _)| n.to_lowercase().contains(&lower)));

    match position {
        Some(i) => {
            let (found, device) = devices.into_iter().nth(i).ok_or_else(|| {
                CaptureError::DeviceNotFound(name.to_string())
            })?;
            tracing::debug!("Matched audio device '{}' for '{}'", found, name);
            Ok(device)
        }
        None => {
            let available: Vec<String> = devices.into_iter().map(|(n, _)| n).collect();
            tracing::warn!("Available input devices: {}", available.join(", "));
            Err(CaptureError::DeviceNotFound(name.to_string()))
        }
    }
}

/// Mix interleaved frames down to mono
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear interpolation resampling
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio).ceil() as usize;
    (0..new_len)
        .map(|i| {
            let src = i as f64 / ratio;
            let idx = src.floor() as usize;
            let frac = (src - idx as f64) as f32;
            match (samples.get(idx), samples.get(idx + 1)) {
                (Some(a), Some(b)) => a * (1.0 - frac) + b * frac,
                (Some(a), None) => *a,
                _ => 0.0,
            }
        })
        .collect()
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    target_rate: u32,
    tx: mpsc::Sender<Vec<f32>>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    use cpal::traits::DeviceTrait;

    let channels = config.channels as usize;
    let source_rate = config.sample_rate.0;
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let as_f32: Vec<f32> = data
                .iter()
                .map(|&s| <f32 as cpal::FromSample<T>>::from_sample_(s))
                .collect();
            let mono = downmix(&as_f32, channels);
            let _ = tx.send(resample(&mono, source_rate, target_rate));
        },
        move |err| {
            tracing::error!("Audio stream error: {}", err);
            failed.store(true, Ordering::Release);
        },
        None,
    )
}

type OpenStream = (cpal::Stream, Arc<AtomicBool>, String);

/// Build and start the input stream. Runs on the capture thread.
fn open_stream(
    device_name: &str,
    target_rate: u32,
    tx: mpsc::Sender<Vec<f32>>,
) -> Result<OpenStream, CaptureError> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let device = find_input_device(&host, device_name)?;
    let supported = device
        .default_input_config()
        .map_err(|e| CaptureError::Stream(e.to_string()))?;
    let config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };
    let failed = Arc::new(AtomicBool::new(false));
    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => {
            build_stream::<f32>(&device, &config, target_rate, tx, failed.clone())
        }
        cpal::SampleFormat::I16 => {
            build_stream::<i16>(&device, &config, target_rate, tx, failed.clone())
        }
        cpal::SampleFormat::U16 => {
            build_stream::<u16>(&device, &config, target_rate, tx, failed.clone())
        }
        format => {
            return Err(CaptureError::Stream(format!(
                "unsupported sample format {:?}",
                format
            )))
        }
    }
    .map_err(|e| CaptureError::Stream(e.to_string()))?;
    stream
        .play()
        .map_err(|e| CaptureError::Stream(e.to_string()))?;

    tracing::debug!(
        "Device config: {} Hz, {} channel(s)",
        config.sample_rate.0,
        config.channels
    );
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());
    Ok((stream, failed, name))
}

impl AudioSource for MicrophoneSource {
    fn connect(&mut self) -> Result<(), CaptureError> {
        self.shutdown();
        self.stop = Arc::new(AtomicBool::new(false));

        let (tx, rx) = mpsc::channel::<Vec<f32>>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<String, CaptureError>>();
        let device_name = self.device.clone();
        let target_rate = self.sample_rate;
        let stop = self.stop.clone();

        let handle = thread::spawn(move || {
            let setup = open_stream(&device_name, target_rate, tx);

            match setup {
                Ok((stream, failed, name)) => {
                    let _ = ready_tx.send(Ok(name));
                    while !stop.load(Ordering::Acquire) && !failed.load(Ordering::Acquire) {
                        thread::sleep(Duration::from_millis(100));
                    }
                    drop(stream);
                    tracing::debug!("Microphone capture thread stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        match ready_rx.recv() {
            Ok(Ok(name)) => {
                tracing::info!("Using audio device: {}", name);
                self.samples = Some(rx);
                self.thread = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CaptureError::Stream("capture thread exited".into()))
            }
        }
    }

    fn read_chunk(&mut self) -> Result<Vec<f32>, CaptureError> {
        let rx = self
            .samples
            .as_ref()
            .ok_or_else(|| CaptureError::StreamEnded("not connected".into()))?;
        while self.pending.len() < self.chunk_samples {
            match rx.recv_timeout(STALL_TIMEOUT) {
                Ok(samples) => self.pending.extend(samples),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    self.shutdown();
                    return Err(CaptureError::StreamEnded("microphone stalled".into()));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    self.shutdown();
                    return Err(CaptureError::StreamEnded("microphone stream closed".into()));
                }
            }
        }
        let rest = self.pending.split_off(self.chunk_samples);
        Ok(std::mem::replace(&mut self.pending, rest))
    }

    fn name(&self) -> &'static str {
        "microphone"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_stereo() {
        assert_eq!(downmix(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
        assert_eq!(downmix(&[0.25, 0.75], 1), vec![0.25, 0.75]);
    }

    #[test]
    fn test_resample_same_rate() {
        let samples = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }

    #[test]
    fn test_resample_downsample() {
        let samples: Vec<f32> = (0..48).map(|i| i as f32).collect();
        let out = resample(&samples, 48000, 16000);
        assert_eq!(out.len(), 16);
        assert_eq!(out[1], 3.0);
    }

    #[test]
    fn test_resample_upsample_interpolates() {
        let out = resample(&[0.0, 1.0], 8000, 16000);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn test_read_before_connect_fails() {
        let mut mic = MicrophoneSource::new("default", 16000, 32000);
        assert!(matches!(
            mic.read_chunk(),
            Err(CaptureError::StreamEnded(_))
        ));
    }
}
