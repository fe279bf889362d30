use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No input device available")]
    NoInputDevice,

    #[error("No output device available")]
    NoOutputDevice,

    #[error("Audio device {0} not found")]
    DeviceNotFound(usize),

    #[error("Audio stream error: {0}")]
    StreamError(String),
}

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size_ms: u32,
    /// Device indices as listed by the host; `None` means system default.
    pub input_device: Option<usize>,
    pub output_device: Option<usize>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            frame_size_ms: 20,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    pub fn frame_size_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_size_ms as usize) / 1000
    }
}

/// PCM source the playback stream pulls from on its own clock. Must return
/// one frame-sized window per call and never block.
pub type PlaybackSource = Arc<dyn Fn() -> Vec<i16> + Send + Sync>;

pub struct AudioEngine {
    config: AudioConfig,
    is_capturing: bool,
    is_muted: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
}

impl AudioEngine {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            is_capturing: false,
            is_muted: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mute_flag(&self) -> Arc<AtomicBool> {
        self.is_muted.clone()
    }

    pub fn start_capture(
        &mut self,
        frame_tx: tokio::sync::mpsc::Sender<Vec<i16>>,
    ) -> Result<(), AudioError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = match self.config.input_device {
            Some(index) => host
                .input_devices()
                .map_err(|e| AudioError::StreamError(e.to_string()))?
                .nth(index)
                .ok_or(AudioError::DeviceNotFound(index))?,
            None => host
                .default_input_device()
                .ok_or(AudioError::NoInputDevice)?,
        };

        info!(device = ?device.name(), "Using input device");

        let config = cpal::StreamConfig {
            channels: self.config.channels,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let frame_size = self.config.frame_size_samples();
        let mut buffer: Vec<i16> = Vec::with_capacity(frame_size);
        let muted = self.is_muted.clone();
        let active = self.active.clone();

        active.store(true, Ordering::SeqCst);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[i16], _info: &cpal::InputCallbackInfo| {
                    if !active.load(Ordering::Relaxed) {
                        return;
                    }
                    if muted.load(Ordering::Relaxed) {
                        // Send silence when muted so playback stays in sync
                        buffer.extend(std::iter::repeat_n(0i16, data.len()));
                    } else {
                        buffer.extend_from_slice(data);
                    }
                    while buffer.len() >= frame_size {
                        let frame: Vec<i16> = buffer.drain(..frame_size).collect();
                        if frame_tx.try_send(frame).is_err() {
                            warn!("Audio frame channel full, dropping frame");
                        }
                    }
                },
                move |err| {
                    error!("Audio input error: {err}");
                },
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        // Keep stream alive (cleaned up via active flag — callback becomes no-op)
        std::mem::forget(stream);

        self.is_capturing = true;
        debug!("Audio capture started");
        Ok(())
    }

    pub fn start_playback(&mut self, source: PlaybackSource) -> Result<(), AudioError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = match self.config.output_device {
            Some(index) => host
                .output_devices()
                .map_err(|e| AudioError::StreamError(e.to_string()))?
                .nth(index)
                .ok_or(AudioError::DeviceNotFound(index))?,
            None => host
                .default_output_device()
                .ok_or(AudioError::NoOutputDevice)?,
        };

        info!(device = ?device.name(), "Using output device");

        let config = cpal::StreamConfig {
            channels: self.config.channels,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let active = self.active.clone();
        active.store(true, Ordering::SeqCst);

        let mut play_buffer: VecDeque<i16> = VecDeque::new();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _info: &cpal::OutputCallbackInfo| {
                    if !active.load(Ordering::Relaxed) {
                        data.fill(0);
                        return;
                    }
                    // Pull frames until this callback window is covered
                    while play_buffer.len() < data.len() {
                        play_buffer.extend(source());
                    }
                    for sample in data.iter_mut() {
                        *sample = play_buffer.pop_front().unwrap_or(0);
                    }
                },
                move |err| {
                    error!("Audio output error: {err}");
                },
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        std::mem::forget(stream);
        debug!("Audio playback started");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.is_capturing = false;
        self.is_muted.store(false, Ordering::SeqCst);
        debug!("Audio engine stopped");
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.is_muted.store(muted, Ordering::SeqCst);
        debug!(muted, "Audio mute state changed");
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted.load(Ordering::Relaxed)
    }

    pub fn is_capturing(&self) -> bool {
        self.is_capturing
    }
}

/// RMS level of an i16 PCM window, normalised to 0.0-1.0.
pub fn rms_level(pcm: &[i16]) -> f32 {
    if pcm.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = pcm.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_squares / pcm.len() as f64).sqrt();
    (rms / 32768.0).min(1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_samples() {
        let config = AudioConfig::default();
        assert_eq!(config.frame_size_samples(), 960);

        let codec2 = AudioConfig {
            sample_rate: 8000,
            frame_size_ms: 40,
            ..AudioConfig::default()
        };
        assert_eq!(codec2.frame_size_samples(), 320);
    }

    #[test]
    fn test_rms_level() {
        assert_eq!(rms_level(&[]), 0.0);
        assert_eq!(rms_level(&[0, 0, 0]), 0.0);
        assert!((rms_level(&[i16::MAX; 8]) - 1.0).abs() < 0.01);
    }
}
