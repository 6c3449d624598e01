//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Construction-time configuration for [`crate::Engine`].
///
/// Everything here has a runtime setter as well; the config only seeds the
/// initial state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Output device name; `None` selects the platform default.
    pub device: Option<String>,

    /// Requested device buffer size in frames; `None` uses the device
    /// default.
    pub buffer_frames: Option<u32>,

    /// Preferred output sample rate.
    pub sample_rate: u32,

    /// Longest allowed crossfade, in seconds.
    pub max_transition_time: f64,

    /// Leading durations at or above this are treated as long intros: the
    /// incoming deck is faded in (and repositioned on a forced fade-out).
    pub max_leading_duration: f64,

    /// Crossfade curve control, `0..=100`. 50 is roughly perceptually
    /// linear.
    pub fading_curve: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: None,
            buffer_frames: None,
            sample_rate: 44_100,
            max_transition_time: 3.0,
            max_leading_duration: 2.5,
            fading_curve: 50.0,
        }
    }
}
