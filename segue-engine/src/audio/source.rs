//! Pull-model audio source contract.

/// Per-block status reported by a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStatus {
    /// The source could not deliver the full block in time and zero-filled
    /// the shortfall. Distinct from `ended`: the stream may still recover.
    pub starved: bool,

    /// The underlying stream is exhausted; all future blocks are silence.
    pub ended: bool,
}

/// A pull-model block producer.
///
/// `get_next_block` runs on the audio thread and must never block on I/O,
/// allocate, or wait on a contended lock.
pub trait AudioSource: Send {
    /// Called off the audio thread before playback with the device rate and
    /// the largest block that will ever be requested. May allocate.
    fn prepare(&mut self, sample_rate: u32, max_block_frames: usize);

    /// Counterpart of `prepare`; drops any rate-dependent state.
    fn release(&mut self);

    /// Fill `out` (interleaved stereo) completely, zero-padding whatever the
    /// stream cannot deliver.
    fn get_next_block(&mut self, out: &mut [f32]) -> SourceStatus;
}
