//! Mixer/master stage.
//!
//! Sums the two deck blocks into the output buffer, applies the pause ramp,
//! runs the post-processor, and feeds the level tracker. Lives behind the
//! engine's audio callback; all buffers are sized in `update_audio_config`
//! so the per-block path does not allocate.

use segue_common::fade::apply_gain_ramp;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error};

use crate::audio::level::LevelTracker;
use crate::audio::StreamSpec;
use crate::events::DeckId;

use super::deck::DeckRender;
use super::engine::EngineCore;

/// Frames over which pause and resume ramps run.
const PAUSE_RAMP_FRAMES: usize = 256;

/// Black-box per-block DSP stage (equaliser, limiter, ...).
///
/// `process` runs on the audio thread; a panic is caught per block and the
/// block replaced with silence.
pub trait PostProcessor: Send {
    /// Called off the audio thread whenever the stream is (re)configured.
    fn prepare(&mut self, _sample_rate: u32, _max_block_frames: usize) {}

    /// Process the interleaved stereo block in place.
    fn process(&mut self, block: &mut [f32]);
}

pub(crate) struct Mixer {
    /// Paused *and* the down-ramp has completed: deck pulls are skipped.
    stalled: bool,
    scratch: Vec<f32>,
    master_last: f32,
    post: Option<Box<dyn PostProcessor>>,
    tracker: LevelTracker,
    spec: Option<StreamSpec>,
}

impl Mixer {
    pub fn new(tracker: LevelTracker) -> Self {
        Self {
            stalled: false,
            scratch: Vec::new(),
            master_last: 1.0,
            post: None,
            tracker,
            spec: None,
        }
    }

    pub fn set_post_processor(&mut self, post: Option<Box<dyn PostProcessor>>) {
        self.post = post;
        if let (Some(post), Some(spec)) = (self.post.as_mut(), self.spec) {
            post.prepare(spec.sample_rate, spec.buffer_frames.max(1));
        }
    }

    /// Re-size buffers for a (new) stream. Runs on the control thread; the
    /// device is not running while this executes.
    pub fn update_audio_config(&mut self, spec: StreamSpec, output_latency_frames: usize) {
        self.spec = Some(spec);
        self.scratch = vec![0.0; spec.buffer_frames.max(512) * 2];
        self.tracker.set_latency_frames(output_latency_frames);
        if let Some(post) = self.post.as_mut() {
            post.prepare(spec.sample_rate, spec.buffer_frames.max(1));
        }
        debug!(
            sample_rate = spec.sample_rate,
            buffer_frames = spec.buffer_frames,
            output_latency_frames,
            "mixer configured"
        );
    }

    /// Render one output block. Returns the per-deck outcomes for the
    /// engine to act on after the mix.
    pub fn render(&mut self, core: &EngineCore, out: &mut [f32]) -> [DeckRender; 2] {
        let frames = out.len() / 2;
        let paused = core.is_paused();

        if paused && self.stalled {
            // Stalled: sources are not pulled at all.
            out.fill(0.0);
            self.tracker.process(out);
            return [DeckRender::default(), DeckRender::default()];
        }

        if self.scratch.len() < out.len() {
            // Device asked for more than it was configured for.
            self.scratch.resize(out.len(), 0.0);
        }

        out.fill(0.0);
        let mut results = [DeckRender::default(), DeckRender::default()];
        for id in [DeckId::A, DeckId::B] {
            let scratch = &mut self.scratch[..out.len()];
            results[id.index()] = core.deck(id).render_block(scratch);
            for (acc, sample) in out.iter_mut().zip(scratch.iter()) {
                *acc += *sample;
            }
        }

        let ramp_frames = PAUSE_RAMP_FRAMES.min(frames);
        if paused && !self.stalled {
            // Going paused: pull the mix, ramp it out, then stall.
            apply_gain_ramp(&mut out[..ramp_frames * 2], 1.0, 0.0);
            for sample in &mut out[ramp_frames * 2..] {
                *sample = 0.0;
            }
            self.stalled = true;
        } else if !paused && self.stalled {
            // Going unpaused: ramp back in.
            apply_gain_ramp(&mut out[..ramp_frames * 2], 0.0, 1.0);
            self.stalled = false;
        }

        let master = core.master_gain();
        apply_gain_ramp(out, self.master_last, master);
        self.master_last = master;

        if let Some(post) = self.post.as_mut() {
            let outcome = catch_unwind(AssertUnwindSafe(|| post.process(out)));
            if outcome.is_err() {
                error!("post-processor panicked, block replaced with silence");
                out.fill(0.0);
            }
        }

        self.tracker.process(out);
        results
    }
}
