//! Block resampler adapting a deck's source rate to the device rate.
//!
//! Wraps rubato's `FastFixedIn` (septic polynomial) with fixed-size input
//! chunks pulled from the buffering reader. The ratio is set at `prepare`;
//! all scratch buffers are sized there so the steady-state path never
//! allocates. A seek on the underlying reader flushes resampler state.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, warn};

use crate::audio::buffering::BufferingReader;
use crate::audio::source::{AudioSource, SourceStatus};
use crate::audio::CHANNELS;

/// Input chunk granularity, in frames.
const RESAMPLE_CHUNK_FRAMES: usize = 1_024;

/// Pull-model resampling stage over a [`BufferingReader`].
pub(crate) struct ResamplingReader {
    inner: BufferingReader,
    source_rate: u32,

    /// `None` when the rates match and the stage passes through.
    resampler: Option<FastFixedIn<f32>>,

    in_interleaved: Vec<f32>,
    in_planar: Vec<Vec<f32>>,
    out_planar: Vec<Vec<f32>>,

    /// Interleaved resampled output awaiting copy-out.
    staged: Vec<f32>,
    staged_offset: usize,

    /// Sticky flags carried from inner reads into block status.
    saw_starvation: bool,
    saw_end: bool,
}

impl ResamplingReader {
    pub fn new(inner: BufferingReader, source_rate: u32) -> Self {
        Self {
            inner,
            source_rate,
            resampler: None,
            in_interleaved: Vec::new(),
            in_planar: Vec::new(),
            out_planar: Vec::new(),
            staged: Vec::new(),
            staged_offset: 0,
            saw_starvation: false,
            saw_end: false,
        }
    }

    /// Absolute position of the stream in *source* frames.
    pub fn position_frames(&self) -> u64 {
        self.inner.position()
    }

    /// Seek the buffering reader and flush resampler state.
    pub fn seek_frames(&mut self, frame: u64) {
        self.inner.seek(frame);
        self.flush();
    }

    fn flush(&mut self) {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        self.staged.clear();
        self.staged_offset = 0;
        self.saw_starvation = false;
        self.saw_end = false;
    }

    fn staged_remaining(&self) -> usize {
        self.staged.len() - self.staged_offset
    }

    /// Pull one source chunk through the resampler into `staged`.
    fn refill_staged(&mut self) {
        let outcome = self.inner.read(&mut self.in_interleaved);
        self.saw_starvation |= outcome.starved;
        self.saw_end |= outcome.ended;

        for (frame_idx, frame) in self.in_interleaved.chunks_exact(CHANNELS).enumerate() {
            self.in_planar[0][frame_idx] = frame[0];
            self.in_planar[1][frame_idx] = frame[1];
        }

        let resampler = self.resampler.as_mut().expect("refill without resampler");
        match resampler.process_into_buffer(&self.in_planar, &mut self.out_planar, None) {
            Ok((_consumed, produced)) => {
                self.staged.clear();
                self.staged_offset = 0;
                for frame_idx in 0..produced {
                    self.staged.push(self.out_planar[0][frame_idx]);
                    self.staged.push(self.out_planar[1][frame_idx]);
                }
            }
            Err(e) => {
                warn!(error = %e, "resample process failed, emitting silence");
                self.staged.clear();
                self.staged_offset = 0;
                self.staged
                    .resize(RESAMPLE_CHUNK_FRAMES * CHANNELS, 0.0);
            }
        }
    }
}

impl AudioSource for ResamplingReader {
    /// Set the conversion ratio and pre-size every scratch buffer. Runs off
    /// the audio thread.
    fn prepare(&mut self, device_rate: u32, _max_block_frames: usize) {
        self.staged.clear();
        self.staged_offset = 0;

        if device_rate == self.source_rate {
            self.resampler = None;
            debug!(rate = device_rate, "resampler in pass-through mode");
            return;
        }

        let ratio = device_rate as f64 / self.source_rate as f64;
        match FastFixedIn::<f32>::new(
            ratio,
            1.0,
            PolynomialDegree::Septic,
            RESAMPLE_CHUNK_FRAMES,
            CHANNELS,
        ) {
            Ok(resampler) => {
                let out_max = resampler.output_frames_max();
                self.in_interleaved = vec![0.0; RESAMPLE_CHUNK_FRAMES * CHANNELS];
                self.in_planar = vec![vec![0.0; RESAMPLE_CHUNK_FRAMES]; CHANNELS];
                self.out_planar = vec![vec![0.0; out_max]; CHANNELS];
                self.staged = Vec::with_capacity(out_max * CHANNELS);
                self.resampler = Some(resampler);
                debug!(
                    source_rate = self.source_rate,
                    device_rate, ratio, "resampler prepared"
                );
            }
            Err(e) => {
                // Degrade to pass-through rather than kill the deck; the
                // pitch shift is audible but playback continues.
                warn!(error = %e, "resampler construction failed, passing through");
                self.resampler = None;
            }
        }
    }

    fn release(&mut self) {
        self.resampler = None;
        self.staged.clear();
        self.staged_offset = 0;
    }

    /// Fill `out` with device-rate audio. Never blocks; shortfalls upstream
    /// surface as zero-filled audio plus a starvation flag.
    fn get_next_block(&mut self, out: &mut [f32]) -> SourceStatus {
        if self.resampler.is_none() {
            // Pass-through: identical rates.
            let outcome = self.inner.read(out);
            return SourceStatus {
                starved: outcome.starved,
                ended: outcome.ended,
            };
        }

        self.saw_starvation = false;
        self.saw_end = false;

        let mut written = 0usize;
        while written < out.len() {
            let available = self.staged_remaining();
            if available > 0 {
                let take = available.min(out.len() - written);
                out[written..written + take]
                    .copy_from_slice(&self.staged[self.staged_offset..self.staged_offset + take]);
                self.staged_offset += take;
                written += take;
                continue;
            }
            self.refill_staged();
        }

        SourceStatus {
            starved: self.saw_starvation,
            ended: self.saw_end,
        }
    }
}
