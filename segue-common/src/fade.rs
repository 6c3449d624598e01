//! Crossfade curve math.
//!
//! The operator-facing control is a single `fading_curve` knob in `[0, 100]`.
//! It maps onto an exponent (the *fading factor*) applied to the linear
//! crossfade progress on both decks: the outgoing deck plays
//! `(1 - progress)^factor`, the incoming deck `progress^factor`. A curve of
//! 50 lands close to a perceptually linear crossfade; 0 cuts abruptly near
//! the ends; 100 approaches plain linear amplitude.

use serde::{Deserialize, Serialize};

/// Map the operator's fading curve (`0..=100`) onto the crossfade exponent.
///
/// The mapping is `1000 / (((100 - curve) / 100) * 999 + 1)`, which spans
/// `[1, 1000]` and is strictly increasing in `curve`.
pub fn fading_factor(curve: f64) -> f64 {
    let curve = curve.clamp(0.0, 100.0);
    1000.0 / (((100.0 - curve) / 100.0) * 999.0 + 1.0)
}

/// A resolved crossfade shape: the exponent plus the gain evaluators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrossfadeShape {
    factor: f64,
}

impl CrossfadeShape {
    pub fn from_curve(curve: f64) -> Self {
        Self {
            factor: fading_factor(curve),
        }
    }

    pub fn from_factor(factor: f64) -> Self {
        Self { factor }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Gain of the outgoing deck at `progress` through the transition.
    pub fn fade_out(&self, progress: f64) -> f32 {
        let p = progress.clamp(0.0, 1.0);
        (1.0 - p).powf(self.factor) as f32
    }

    /// Gain of the incoming deck at `progress` through its lead-in.
    pub fn fade_in(&self, progress: f64) -> f32 {
        let p = progress.clamp(0.0, 1.0);
        p.powf(self.factor) as f32
    }
}

impl Default for CrossfadeShape {
    fn default() -> Self {
        Self::from_curve(50.0)
    }
}

/// Apply a linear per-frame gain ramp across an interleaved stereo block.
///
/// Frame `i` of `n` is scaled by `start + (end - start) * i / n`; both
/// channels of a frame get the same gain so the stereo image is untouched.
pub fn apply_gain_ramp(samples: &mut [f32], start: f32, end: f32) {
    let frames = samples.len() / 2;
    if frames == 0 {
        return;
    }
    if (start - end).abs() < f32::EPSILON {
        if (start - 1.0).abs() >= f32::EPSILON {
            for s in samples.iter_mut() {
                *s *= start;
            }
        }
        return;
    }
    let step = (end - start) / frames as f32;
    let mut gain = start;
    for frame in samples.chunks_exact_mut(2) {
        frame[0] *= gain;
        frame[1] *= gain;
        gain += step;
    }
}
