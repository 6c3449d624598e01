//! Audio device output.
//!
//! The engine talks to playback hardware through the [`AudioDevice`] trait;
//! [`CpalOutput`] is the production implementation. Tests drive the engine
//! with a manual device instead, so everything above this module is
//! hardware-independent.

use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Negotiated stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per device callback, best known value.
    pub buffer_frames: usize,
}

/// Block callback: fill the interleaved stereo buffer. Invoked on the
/// device thread.
pub type BlockCallback = Box<dyn FnMut(&mut [f32]) + Send>;

/// Thin interface over an output device.
pub trait AudioDevice: Send {
    /// Negotiate and open a stream. May be called again after `close` to
    /// move to a different device.
    fn open(&mut self, preferred_rate: u32, buffer_frames: Option<u32>) -> Result<StreamSpec>;

    /// Begin invoking `callback` from the device thread.
    fn start(&mut self, callback: BlockCallback) -> Result<()>;

    /// Output latency in frames, used for level-meter compensation.
    fn output_latency_frames(&self) -> usize;

    fn close(&mut self);
}

/// cpal-backed output device.
pub struct CpalOutput {
    requested_device: Option<String>,
    device: Option<Device>,
    config: Option<StreamConfig>,
    sample_format: SampleFormat,
    stream: Option<Stream>,
    spec: Option<StreamSpec>,
    /// Set by the stream error callback; the engine may rebuild the stream.
    error_flag: Arc<AtomicBool>,
}

// cpal's Stream is !Send on some hosts; the engine keeps the device behind
// a mutex and only touches it from the control thread.
unsafe impl Send for CpalOutput {}

impl CpalOutput {
    pub fn new(requested_device: Option<String>) -> Self {
        Self {
            requested_device,
            device: None,
            config: None,
            sample_format: SampleFormat::F32,
            stream: None,
            spec: None,
            error_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Names of all output devices on the default host.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| Error::Device(format!("failed to enumerate devices: {e}")))?
            .filter_map(|device| device.name().ok())
            .collect();
        debug!(count = devices.len(), "enumerated output devices");
        Ok(devices)
    }

    pub fn has_error(&self) -> bool {
        self.error_flag.load(Ordering::SeqCst)
    }

    fn select_device(&self) -> Result<Device> {
        let host = cpal::default_host();

        if let Some(name) = self.requested_device.as_ref() {
            let mut devices = host
                .output_devices()
                .map_err(|e| Error::Device(format!("failed to enumerate devices: {e}")))?;
            if let Some(device) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
                info!(device = %name, "using requested audio device");
                return Ok(device);
            }
            warn!(device = %name, "requested device not found, falling back to default");
        }

        host.default_output_device()
            .ok_or_else(|| Error::Device("no default output device".to_string()))
    }

    /// Pick a stereo config, preferring `preferred_rate` and f32 samples.
    fn best_config(
        device: &Device,
        preferred_rate: u32,
    ) -> Result<(StreamConfig, SampleFormat)> {
        let mut supported = device
            .supported_output_configs()
            .map_err(|e| Error::Device(format!("failed to query device configs: {e}")))?;

        let preferred = supported.find(|config| {
            config.channels() == 2
                && config.min_sample_rate().0 <= preferred_rate
                && config.max_sample_rate().0 >= preferred_rate
                && config.sample_format() == SampleFormat::F32
        });

        if let Some(config) = preferred {
            let sample_format = config.sample_format();
            let config = config
                .with_sample_rate(cpal::SampleRate(preferred_rate))
                .config();
            return Ok((config, sample_format));
        }

        let fallback = device
            .default_output_config()
            .map_err(|e| Error::Device(format!("failed to get default config: {e}")))?;
        let sample_format = fallback.sample_format();
        Ok((fallback.config(), sample_format))
    }

    fn buffer_frames(config: &StreamConfig) -> usize {
        match config.buffer_size {
            cpal::BufferSize::Fixed(frames) => frames as usize,
            // cpal cannot report the default size; assume a common value
            // for latency compensation purposes.
            cpal::BufferSize::Default => 512,
        }
    }
}

impl AudioDevice for CpalOutput {
    fn open(&mut self, preferred_rate: u32, buffer_frames: Option<u32>) -> Result<StreamSpec> {
        self.close();

        let device = self.select_device()?;
        let (mut config, sample_format) = Self::best_config(&device, preferred_rate)?;
        if let Some(frames) = buffer_frames {
            config.buffer_size = cpal::BufferSize::Fixed(frames);
        }

        let spec = StreamSpec {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
            buffer_frames: Self::buffer_frames(&config),
        };

        info!(
            device = %device.name().unwrap_or_else(|_| "<unknown>".into()),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            format = ?sample_format,
            "audio device opened"
        );

        self.device = Some(device);
        self.config = Some(config);
        self.sample_format = sample_format;
        self.spec = Some(spec);
        self.error_flag.store(false, Ordering::SeqCst);
        Ok(spec)
    }

    fn start(&mut self, callback: BlockCallback) -> Result<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| Error::InvalidState("device not opened".to_string()))?;
        let config = self.config.clone().expect("config set with device");
        let channels = config.channels as usize;
        let error_flag = Arc::clone(&self.error_flag);

        // Scratch for formats that need conversion out of f32. Pre-sized to
        // a generous callback; resized (rarely) if the device asks for more.
        let scratch = Mutex::new((callback, vec![0.0f32; 8_192 * 2]));

        let err_fn = move |err| {
            error!(error = %err, "audio stream error");
            error_flag.store(true, Ordering::SeqCst);
        };

        let stream = match self.sample_format {
            SampleFormat::F32 => device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut guard = scratch.lock().unwrap();
                        let (callback, stereo) = &mut *guard;
                        let frames = data.len() / channels;
                        if channels == 2 {
                            callback(data);
                        } else {
                            if stereo.len() < frames * 2 {
                                stereo.resize(frames * 2, 0.0);
                            }
                            callback(&mut stereo[..frames * 2]);
                            for (frame_idx, frame) in data.chunks_mut(channels).enumerate() {
                                frame[0] = stereo[frame_idx * 2];
                                if channels > 1 {
                                    frame[1] = stereo[frame_idx * 2 + 1];
                                }
                                for extra in frame.iter_mut().skip(2) {
                                    *extra = 0.0;
                                }
                            }
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| Error::Device(format!("failed to build stream: {e}")))?,
            SampleFormat::I16 => device
                .build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        let mut guard = scratch.lock().unwrap();
                        let (callback, stereo) = &mut *guard;
                        let frames = data.len() / channels;
                        if stereo.len() < frames * 2 {
                            stereo.resize(frames * 2, 0.0);
                        }
                        callback(&mut stereo[..frames * 2]);
                        for (frame_idx, frame) in data.chunks_mut(channels).enumerate() {
                            let left = stereo[frame_idx * 2].clamp(-1.0, 1.0);
                            let right = stereo[frame_idx * 2 + 1].clamp(-1.0, 1.0);
                            frame[0] = (left * i16::MAX as f32) as i16;
                            if channels > 1 {
                                frame[1] = (right * i16::MAX as f32) as i16;
                            }
                            for extra in frame.iter_mut().skip(2) {
                                *extra = 0;
                            }
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| Error::Device(format!("failed to build stream: {e}")))?,
            SampleFormat::U16 => device
                .build_output_stream(
                    &config,
                    move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                        let mut guard = scratch.lock().unwrap();
                        let (callback, stereo) = &mut *guard;
                        let frames = data.len() / channels;
                        if stereo.len() < frames * 2 {
                            stereo.resize(frames * 2, 0.0);
                        }
                        callback(&mut stereo[..frames * 2]);
                        for (frame_idx, frame) in data.chunks_mut(channels).enumerate() {
                            let left = stereo[frame_idx * 2].clamp(-1.0, 1.0);
                            let right = stereo[frame_idx * 2 + 1].clamp(-1.0, 1.0);
                            frame[0] = ((left + 1.0) * 32_767.5) as u16;
                            if channels > 1 {
                                frame[1] = ((right + 1.0) * 32_767.5) as u16;
                            }
                            for extra in frame.iter_mut().skip(2) {
                                *extra = 32_768;
                            }
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| Error::Device(format!("failed to build stream: {e}")))?,
            format => {
                return Err(Error::Device(format!(
                    "unsupported sample format: {format:?}"
                )))
            }
        };

        stream
            .play()
            .map_err(|e| Error::Device(format!("failed to start stream: {e}")))?;
        self.stream = Some(stream);
        info!("audio stream started");
        Ok(())
    }

    fn output_latency_frames(&self) -> usize {
        self.spec.map(|s| s.buffer_frames * 2).unwrap_or(0)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
            drop(stream);
            info!("audio stream closed");
        }
        self.device = None;
        self.config = None;
        self.spec = None;
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}
