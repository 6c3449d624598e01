//! Shared fixtures for the engine integration tests: a pump-driven audio
//! device, deterministic WAV generation, and an event recorder.
#![allow(dead_code)]

use segue_engine::{
    AudioDevice, BlockCallback, EngineEvent, EngineListener, Result, StreamSpec,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const RATE: u32 = 44_100;
pub const BLOCK_FRAMES: usize = 512;

// ========================================
// Manual audio device
// ========================================

#[derive(Default)]
pub struct DeviceShared {
    callback: Mutex<Option<BlockCallback>>,
}

/// Test-side handle: pump blocks through the engine's callback as if the
/// hardware requested them.
#[derive(Clone)]
pub struct DeviceHandle {
    shared: Arc<DeviceShared>,
}

impl DeviceHandle {
    /// Render one block on "the device thread" and return it.
    pub fn pump(&self) -> Vec<f32> {
        let mut block = vec![0.0f32; BLOCK_FRAMES * 2];
        if let Some(callback) = self.shared.callback.lock().unwrap().as_mut() {
            callback(&mut block);
        }
        block
    }

    /// Pump until `done` returns true, yielding briefly between blocks so
    /// the loader and scanner threads can make progress.
    pub fn pump_until(&self, max_blocks: usize, mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..max_blocks {
            if done() {
                return true;
            }
            self.pump();
            std::thread::sleep(Duration::from_micros(300));
        }
        done()
    }
}

/// Hardware-free [`AudioDevice`] driven by [`DeviceHandle::pump`].
pub struct ManualDevice {
    shared: Arc<DeviceShared>,
}

impl ManualDevice {
    pub fn create() -> (Box<dyn AudioDevice>, DeviceHandle) {
        let shared = Arc::new(DeviceShared::default());
        (
            Box::new(Self {
                shared: Arc::clone(&shared),
            }),
            DeviceHandle { shared },
        )
    }
}

impl AudioDevice for ManualDevice {
    fn open(&mut self, preferred_rate: u32, _buffer_frames: Option<u32>) -> Result<StreamSpec> {
        Ok(StreamSpec {
            sample_rate: preferred_rate,
            channels: 2,
            buffer_frames: BLOCK_FRAMES,
        })
    }

    fn start(&mut self, callback: BlockCallback) -> Result<()> {
        *self.shared.callback.lock().unwrap() = Some(callback);
        Ok(())
    }

    fn output_latency_frames(&self) -> usize {
        BLOCK_FRAMES * 2
    }

    fn close(&mut self) {
        self.shared.callback.lock().unwrap().take();
    }
}

// ========================================
// WAV fixtures
// ========================================

pub fn db(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// Write a stereo 440 Hz WAV shaped by (duration_secs, amplitude) segments.
pub fn write_track(path: &Path, segments: &[(f64, f32)]) {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let mut n = 0u64;
    for &(duration, amplitude) in segments {
        let frames = (duration * RATE as f64) as u64;
        for _ in 0..frames {
            let t = n as f32 / RATE as f32;
            let sample = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * amplitude;
            let value = (sample * i16::MAX as f32) as i16;
            writer.write_sample(value).unwrap();
            writer.write_sample(value).unwrap();
            n += 1;
        }
    }
    writer.finalize().unwrap();
}

/// The standard 10 s test track: loud to 8 s, a −50 dB tail to 9.5 s, then
/// silence. Scans to first≈0, last≈8, end-of-playout≈9.5, so cue≈6.5 and
/// the transition window is [8.0, 9.5] with the default 3 s maximum.
pub fn standard_track(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    write_track(&path, &[(8.0, 0.5), (1.5, db(-50.0)), (0.5, 0.0)]);
    path
}

// ========================================
// Event recorder
// ========================================

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<EngineEvent>>,
}

impl Recorder {
    pub fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&EngineEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    pub fn has(&self, pred: impl Fn(&EngineEvent) -> bool) -> bool {
        self.count(pred) > 0
    }

    /// Index of the first event matching `pred`, for ordering assertions.
    pub fn index_of(&self, pred: impl Fn(&EngineEvent) -> bool) -> Option<usize> {
        self.events().iter().position(|e| pred(e))
    }

    /// Wait (without pumping audio) for a loader/scanner-side event.
    pub fn wait_for(&self, timeout_ms: u64, pred: impl Fn(&EngineEvent) -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if self.has(&pred) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.has(&pred)
    }
}

impl EngineListener for Recorder {
    fn on_event(&self, event: &EngineEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
