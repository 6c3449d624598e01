//! Read-ahead buffering between the decoder and the audio thread.
//!
//! Each loaded deck owns a [`SharedRing`]: a lock-free ring of interleaved
//! stereo samples filled by a [`RingFeeder`] running on the shared
//! read-ahead worker and drained by the audio thread through a
//! [`BufferingReader`]. The audio-side read never blocks on I/O; when the
//! ring runs short it zero-fills the shortfall and reports starvation.
//!
//! Seeks are generation-tagged: the control thread bumps the generation,
//! clears the ring, and parks a seek request; any chunk the feeder decoded
//! against the old generation is discarded at push time.

use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{trace, warn};

use crate::audio::formats::AudioFileReader;
use crate::audio::CHANNELS;
use crate::workers::TimeSliceClient;

/// Decode chunk granularity for the feeder, in frames.
const FEED_CHUNK_FRAMES: usize = 4_096;

/// Shared state between the audio-side reader and the feeder.
pub(crate) struct SharedRing {
    prod: Mutex<HeapProd<f32>>,
    cons: Mutex<HeapCons<f32>>,

    /// Bumped on every seek; pushes tagged with an older generation are
    /// discarded.
    generation: AtomicU64,

    /// Target frame for the feeder's next reposition, if any.
    pending_seek: Mutex<Option<u64>>,

    /// Decoder reached end of stream (real EOF, not starvation).
    decoder_eof: AtomicBool,

    /// Absolute source frame of the next sample the consumer will pop.
    read_frame: AtomicU64,

    /// Set when the owning chain is dropped; the feeder then retires.
    detached: AtomicBool,
}

impl SharedRing {
    pub fn new(capacity_frames: usize, start_frame: u64) -> Arc<Self> {
        let rb = HeapRb::<f32>::new(capacity_frames * CHANNELS);
        let (prod, cons) = rb.split();
        Arc::new(Self {
            prod: Mutex::new(prod),
            cons: Mutex::new(cons),
            generation: AtomicU64::new(0),
            pending_seek: Mutex::new(None),
            decoder_eof: AtomicBool::new(false),
            read_frame: AtomicU64::new(start_frame),
            detached: AtomicBool::new(false),
        })
    }

    /// Reposition the stream. Called with the deck's callback lock held, so
    /// it cannot race the audio-side reader.
    pub fn begin_seek(&self, frame: u64) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        // Any push still in flight holds the producer lock; taking it here
        // guarantees everything pushed after this point saw the new
        // generation check.
        drop(self.prod.lock().unwrap());
        self.cons.lock().unwrap().clear();
        *self.pending_seek.lock().unwrap() = Some(frame);
        self.read_frame.store(frame, Ordering::SeqCst);
        self.decoder_eof.store(false, Ordering::SeqCst);
    }

    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

/// Outcome of one audio-side read.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RingRead {
    pub frames: usize,
    pub starved: bool,
    pub ended: bool,
}

/// Audio-thread view of the ring. Owned by the deck's source chain.
pub(crate) struct BufferingReader {
    ring: Arc<SharedRing>,
}

impl BufferingReader {
    pub fn new(ring: Arc<SharedRing>) -> Self {
        Self { ring }
    }

    /// Fill `out` from the ring, zero-padding any shortfall. Never blocks
    /// on I/O; the consumer lock is only ever contended by a seek.
    pub fn read(&mut self, out: &mut [f32]) -> RingRead {
        let popped = {
            let mut cons = self.ring.cons.lock().unwrap();
            cons.pop_slice(out)
        };
        for sample in &mut out[popped..] {
            *sample = 0.0;
        }

        let frames = popped / CHANNELS;
        self.ring.read_frame.fetch_add(frames as u64, Ordering::SeqCst);

        let eof = self.ring.decoder_eof.load(Ordering::SeqCst);
        let short = popped < out.len();
        RingRead {
            frames,
            starved: short && !eof,
            ended: short && eof,
        }
    }

    /// Absolute source frame of the next sample to be read.
    pub fn position(&self) -> u64 {
        self.ring.read_frame.load(Ordering::SeqCst)
    }

    pub fn seek(&mut self, frame: u64) {
        self.ring.begin_seek(frame);
    }
}

impl Drop for BufferingReader {
    fn drop(&mut self) {
        self.ring.detach();
    }
}

/// Read-ahead worker client: keeps one deck's ring topped up.
pub(crate) struct RingFeeder {
    ring: Arc<SharedRing>,
    state: Mutex<FeederState>,
}

struct FeederState {
    reader: AudioFileReader,
    chunk: Vec<f32>,
}

impl RingFeeder {
    pub fn new(ring: Arc<SharedRing>, reader: AudioFileReader) -> Self {
        Self {
            ring,
            state: Mutex::new(FeederState {
                reader,
                chunk: vec![0.0; FEED_CHUNK_FRAMES * CHANNELS],
            }),
        }
    }
}

impl TimeSliceClient for RingFeeder {
    fn run_slice(&self) -> Duration {
        if self.ring.is_detached() {
            return Duration::from_secs(1);
        }

        let mut state = self.state.lock().unwrap();

        if let Some(target) = self.ring.pending_seek.lock().unwrap().take() {
            if let Err(e) = state.reader.seek(target) {
                warn!(
                    path = %state.reader.path().display(),
                    error = %e,
                    "read-ahead seek failed"
                );
                self.ring.decoder_eof.store(true, Ordering::SeqCst);
                return Duration::from_millis(20);
            }
            trace!(path = %state.reader.path().display(), target, "read-ahead repositioned");
        }

        if self.ring.decoder_eof.load(Ordering::SeqCst) {
            return Duration::from_millis(20);
        }

        loop {
            if self.ring.is_detached() {
                return Duration::from_secs(1);
            }

            let generation = self.ring.generation.load(Ordering::SeqCst);
            let vacant_frames = self.ring.prod.lock().unwrap().vacant_len() / CHANNELS;
            if vacant_frames < FEED_CHUNK_FRAMES {
                // Ring is effectively full; come back soon.
                return Duration::from_millis(5);
            }

            let take = vacant_frames.min(FEED_CHUNK_FRAMES);
            let FeederState { reader, chunk } = &mut *state;
            let frames = match reader.read(&mut chunk[..take * CHANNELS]) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(path = %reader.path().display(), error = %e, "read-ahead decode failed");
                    self.ring.decoder_eof.store(true, Ordering::SeqCst);
                    return Duration::from_millis(20);
                }
            };

            if frames == 0 {
                self.ring.decoder_eof.store(true, Ordering::SeqCst);
                return Duration::from_millis(20);
            }

            {
                let mut prod = self.ring.prod.lock().unwrap();
                if self.ring.generation.load(Ordering::SeqCst) != generation {
                    // A seek landed while this chunk was decoding; drop it,
                    // the pending reposition will be handled next slice.
                    return Duration::ZERO;
                }
                prod.push_slice(&chunk[..frames * CHANNELS]);
            }

            // Seek requests arriving mid-fill take priority over topping up.
            if self.ring.pending_seek.lock().unwrap().is_some() {
                return Duration::ZERO;
            }
        }
    }

    fn is_alive(&self) -> bool {
        !self.ring.is_detached()
    }
}
