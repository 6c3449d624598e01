//! Output level metering with latency compensation.
//!
//! The mixer summarises every rendered block (per-channel mean magnitude
//! and peak) into a bounded pending queue; the low-rate visualisation
//! worker drains it, delays each summary by the device's output latency so
//! the meter tracks what is *audible* rather than what was just rendered,
//! and folds the result into an atomically published readout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::audio::CHANNELS;
use crate::workers::TimeSliceClient;

/// Ballistics per visualisation tick (~5 ms).
const LEVEL_DECAY: f32 = 0.88;
const PEAK_DECAY: f32 = 0.985;
/// Ticks a fresh peak is held before decaying (~0.75 s at 5 ms).
const PEAK_HOLD_TICKS: u32 = 150;

/// Bound on queued-but-unconsumed block summaries.
const PENDING_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy)]
struct BlockSummary {
    frames: usize,
    magnitude: [f32; CHANNELS],
    peak: [f32; CHANNELS],
}

/// UI-visible copy of the meter, readable from any thread.
pub struct LevelReadout {
    level: [AtomicU32; CHANNELS],
    peak: [AtomicU32; CHANNELS],
}

impl LevelReadout {
    fn new() -> Self {
        Self {
            level: [AtomicU32::new(0), AtomicU32::new(0)],
            peak: [AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    /// Smoothed magnitude of `channel` (0 = left, 1 = right), in `[0, 1]`.
    pub fn level(&self, channel: usize) -> f32 {
        self.level
            .get(channel)
            .map(|a| f32::from_bits(a.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }

    /// Held peak of `channel`, in `[0, 1]`.
    pub fn peak(&self, channel: usize) -> f32 {
        self.peak
            .get(channel)
            .map(|a| f32::from_bits(a.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }
}

/// Audio-side half: summarises blocks under a short uncontended lock.
pub(crate) struct LevelTracker {
    shared: Arc<LevelShared>,
}

pub(crate) struct LevelShared {
    pending: Mutex<VecDeque<BlockSummary>>,
    readout: LevelReadout,
    latency_frames: AtomicUsize,
}

impl LevelTracker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LevelShared {
                pending: Mutex::new(VecDeque::with_capacity(PENDING_LIMIT)),
                readout: LevelReadout::new(),
                latency_frames: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_latency_frames(&self, frames: usize) {
        self.shared.latency_frames.store(frames, Ordering::Relaxed);
    }

    pub fn readout(&self) -> Arc<LevelShared> {
        Arc::clone(&self.shared)
    }

    /// Summarise one interleaved stereo block. Called from the audio thread.
    pub fn process(&self, block: &[f32]) {
        let frames = block.len() / CHANNELS;
        if frames == 0 {
            return;
        }

        let mut sum = [0.0f32; CHANNELS];
        let mut peak = [0.0f32; CHANNELS];
        for frame in block.chunks_exact(CHANNELS) {
            for ch in 0..CHANNELS {
                let mag = frame[ch].abs();
                sum[ch] += mag;
                peak[ch] = peak[ch].max(mag);
            }
        }

        let summary = BlockSummary {
            frames,
            magnitude: [sum[0] / frames as f32, sum[1] / frames as f32],
            peak,
        };

        let mut pending = self.shared.pending.lock().unwrap();
        if pending.len() == PENDING_LIMIT {
            pending.pop_front();
        }
        pending.push_back(summary);
    }
}

impl LevelShared {
    pub fn level(&self, channel: usize) -> f32 {
        self.readout.level(channel)
    }

    pub fn peak(&self, channel: usize) -> f32 {
        self.readout.peak(channel)
    }
}

/// Visualisation-thread half: folds pending summaries into the readout.
pub(crate) struct LevelUpdateClient {
    shared: Arc<LevelShared>,
    delayed: Mutex<DelayState>,
}

struct DelayState {
    queue: VecDeque<BlockSummary>,
    queued_frames: usize,
    smoothed: [f32; CHANNELS],
    peak_held: [f32; CHANNELS],
    hold: [u32; CHANNELS],
}

impl LevelUpdateClient {
    pub fn new(shared: Arc<LevelShared>) -> Self {
        Self {
            shared,
            delayed: Mutex::new(DelayState {
                queue: VecDeque::new(),
                queued_frames: 0,
                smoothed: [0.0; CHANNELS],
                peak_held: [0.0; CHANNELS],
                hold: [0; CHANNELS],
            }),
        }
    }
}

impl TimeSliceClient for LevelUpdateClient {
    fn run_slice(&self) -> Duration {
        let latency = self.shared.latency_frames.load(Ordering::Relaxed);
        let mut state = self.delayed.lock().unwrap();

        {
            let mut pending = self.shared.pending.lock().unwrap();
            while let Some(summary) = pending.pop_front() {
                state.queued_frames += summary.frames;
                state.queue.push_back(summary);
            }
        }

        // Release summaries once enough audio has queued up behind them to
        // cover the output latency.
        loop {
            let Some(front) = state.queue.front().copied() else {
                break;
            };
            if state.queued_frames < latency + front.frames {
                break;
            }
            state.queue.pop_front();
            state.queued_frames -= front.frames;

            for ch in 0..CHANNELS {
                if front.magnitude[ch] >= state.smoothed[ch] {
                    state.smoothed[ch] = front.magnitude[ch];
                }
                if front.peak[ch] >= state.peak_held[ch] {
                    state.peak_held[ch] = front.peak[ch];
                    state.hold[ch] = PEAK_HOLD_TICKS;
                }
            }
        }

        for ch in 0..CHANNELS {
            state.smoothed[ch] *= LEVEL_DECAY;
            if state.hold[ch] > 0 {
                state.hold[ch] -= 1;
            } else {
                state.peak_held[ch] *= PEAK_DECAY;
            }
            self.shared.readout.level[ch]
                .store(state.smoothed[ch].to_bits(), Ordering::Relaxed);
            self.shared.readout.peak[ch]
                .store(state.peak_held[ch].to_bits(), Ordering::Relaxed);
        }

        Duration::from_millis(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loud_block_raises_level_and_peak() {
        let tracker = LevelTracker::new();
        let client = LevelUpdateClient::new(tracker.readout());

        let block = vec![0.5f32; 256 * CHANNELS];
        tracker.process(&block);
        client.run_slice();

        let shared = tracker.readout();
        assert!(shared.level(0) > 0.3);
        assert!((shared.peak(0) - 0.5).abs() < 1e-3);
        assert!((shared.peak(1) - 0.5).abs() < 1e-3);
    }

    #[test]
    fn levels_decay_over_ticks() {
        let tracker = LevelTracker::new();
        let client = LevelUpdateClient::new(tracker.readout());

        tracker.process(&vec![0.8f32; 128 * CHANNELS]);
        client.run_slice();
        let shared = tracker.readout();
        let initial = shared.level(0);

        for _ in 0..40 {
            client.run_slice();
        }
        assert!(shared.level(0) < initial * 0.1);
    }

    #[test]
    fn latency_delays_the_readout() {
        let tracker = LevelTracker::new();
        tracker.set_latency_frames(1_024);
        let client = LevelUpdateClient::new(tracker.readout());

        tracker.process(&vec![0.9f32; 256 * CHANNELS]);
        client.run_slice();
        let shared = tracker.readout();
        // Only 256 frames queued against a 1024-frame latency: not audible
        // yet, so the meter must still read silence.
        assert_eq!(shared.peak(0), 0.0);

        for _ in 0..5 {
            tracker.process(&vec![0.9f32; 256 * CHANNELS]);
        }
        client.run_slice();
        assert!(shared.peak(0) > 0.8);
    }

    #[test]
    fn out_of_range_channel_reads_zero() {
        let tracker = LevelTracker::new();
        let shared = tracker.readout();
        assert_eq!(shared.level(7), 0.0);
        assert_eq!(shared.peak(7), 0.0);
    }
}
