//! Playback deck.
//!
//! A deck composes the per-track source chain (format reader → read-ahead
//! buffering → resampler), owns the playback flags and gain, and carries
//! the transition offsets derived from scan results. The engine owns two of
//! these and the transition controller plays them against each other.
//!
//! Locking: the `chain` mutex is the deck's callback lock. The audio thread
//! holds it for one block render; the control and loading threads hold it
//! only to swap the chain or reposition the stream. Scalars the audio
//! thread needs every block (gain, position, playout end) are atomics.

use segue_common::fade::apply_gain_ramp;
use segue_common::{frames_to_seconds, seconds_to_frames};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::atomic::AtomicF32;
use crate::audio::buffering::{BufferingReader, RingFeeder, SharedRing};
use crate::audio::resampler::ResamplingReader;
use crate::audio::{AudioSource, FormatRegistry};
use crate::error::Result;
use crate::events::{DeckId, EngineEvent};
use crate::queue::TrackHandle;

use super::engine::EngineCore;
use super::loader::{LoadRequest, LoadSlot, ScanSlot, ScanTicket};
use super::scanner::{ScanResult, TrackScanner};

/// Seconds of source audio the read-ahead ring holds.
const READ_AHEAD_SECONDS: usize = 2;

/// Frames over which a stopping deck ramps to silence.
const STOP_RAMP_FRAMES: usize = 256;

/// Floor for the cue distance ahead of last-audible, seconds.
const CUE_FLOOR_SECONDS: f64 = 1.25;

/// How far ahead of the cue the soft pre-warning fires, seconds.
const PRE_CUE_LEAD_SECONDS: f64 = 2.0;

/// Transition offsets of a loaded track, in seconds of source time.
///
/// Orderings hold by construction:
/// `0 <= first_audible <= last_audible <= end_of_playout` and
/// `pre_cue <= cue <= start <= end <= end_of_playout`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TransitionMarks {
    pub first_audible: f64,
    pub last_audible: f64,
    pub end_of_playout: f64,
    /// Intro length of this track, used by the *other* deck's fade-in.
    pub leading: f64,
    pub trailing: f64,
    pub pre_cue: f64,
    pub cue: f64,
    pub start: f64,
    pub end: f64,
}

impl TransitionMarks {
    pub fn derive(scan: &ScanResult, max_transition_time: f64) -> Self {
        let rate = scan.sample_rate;
        let first_audible = frames_to_seconds(scan.first_audible, rate);
        let last_audible = frames_to_seconds(scan.last_audible, rate).max(first_audible);
        let end_of_playout = frames_to_seconds(scan.end_of_playout, rate).max(last_audible);
        let leading = (frames_to_seconds(scan.full_energy, rate) - first_audible).max(0.0);
        let trailing = end_of_playout - last_audible;

        let cue = last_audible - trailing.max(CUE_FLOOR_SECONDS);
        let pre_cue = cue - PRE_CUE_LEAD_SECONDS;
        let start = last_audible;
        let end = (start + max_transition_time.max(0.0)).min(end_of_playout);

        let pre_cue = pre_cue.max(0.0);
        let cue = cue.max(pre_cue);
        let start = start.max(cue);
        let end = end.max(start);

        Self {
            first_audible,
            last_audible,
            end_of_playout,
            leading,
            trailing,
            pre_cue,
            cue,
            start,
            end,
        }
    }
}

/// Read-only deck state exposed to bindings and UI layers.
#[derive(Debug, Clone)]
pub struct DeckSnapshot {
    pub deck: DeckId,
    pub track_path: PathBuf,
    pub position: f64,
    pub duration: f64,
    pub gain: f32,
    pub playing: bool,
    pub main: bool,
}

/// The per-track source chain. Swapped as a unit under the callback lock;
/// the prior chain is dropped after the swap.
struct Chain {
    source: ResamplingReader,
    source_rate: u32,
    total_frames: u64,
    last_gain: f32,
    /// Playing state when the previous block finished; the playing→stopped
    /// transition is detected against this, not against the live flag,
    /// since `stop()` clears the flag between blocks.
    was_playing: bool,
    track: TrackHandle,
    load_id: Uuid,
}

struct DeckScan {
    scan: ScanResult,
    marks: TransitionMarks,
}

/// Outcome of one block render, consumed by the engine after mixing.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DeckRender {
    /// Position to report (seconds), if the deck was playing this block.
    pub position: Option<f64>,
    /// The deck transitioned playing → not-playing this cycle.
    pub finished: bool,
    /// The source zero-padded part of the block.
    pub starved: bool,
}

pub(crate) struct Deck {
    id: DeckId,
    registry: Arc<FormatRegistry>,
    scanner: TrackScanner,

    load_slot: LoadSlot,
    scan_slot: ScanSlot,

    /// Callback lock.
    chain: Mutex<Option<Chain>>,
    scan_info: Mutex<Option<DeckScan>>,

    playing: AtomicBool,
    stopped: AtomicBool,
    input_eof: AtomicBool,
    loading: AtomicBool,
    main: AtomicBool,

    gain: AtomicF32,
    position_frames: AtomicU64,
    source_rate: AtomicU32,
    end_playout_frames: AtomicU64,
}

impl Deck {
    pub fn new(id: DeckId, registry: Arc<FormatRegistry>) -> Self {
        Self {
            id,
            scanner: TrackScanner::new(Arc::clone(&registry)),
            registry,
            load_slot: LoadSlot::default(),
            scan_slot: ScanSlot::default(),
            chain: Mutex::new(None),
            scan_info: Mutex::new(None),
            playing: AtomicBool::new(false),
            stopped: AtomicBool::new(true),
            input_eof: AtomicBool::new(false),
            loading: AtomicBool::new(false),
            main: AtomicBool::new(false),
            gain: AtomicF32::new(1.0),
            position_frames: AtomicU64::new(0),
            source_rate: AtomicU32::new(0),
            end_playout_frames: AtomicU64::new(u64::MAX),
        }
    }

    pub fn id(&self) -> DeckId {
        self.id
    }

    // ---- flags and scalars ----

    pub fn is_loaded(&self) -> bool {
        self.chain.lock().unwrap().is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn is_main(&self) -> bool {
        self.main.load(Ordering::SeqCst)
    }

    pub fn set_main(&self, main: bool) {
        self.main.store(main, Ordering::SeqCst);
    }

    pub fn gain(&self) -> f32 {
        self.gain.load()
    }

    /// Target gain; the next rendered block ramps smoothly onto it.
    pub fn set_volume(&self, gain: f32) {
        self.gain.store(gain.clamp(0.0, 1.0));
    }

    pub fn position_seconds(&self) -> f64 {
        frames_to_seconds(
            self.position_frames.load(Ordering::SeqCst),
            self.source_rate.load(Ordering::SeqCst).max(1),
        )
    }

    pub fn duration_seconds(&self) -> f64 {
        let chain = self.chain.lock().unwrap();
        chain
            .as_ref()
            .map(|c| frames_to_seconds(c.total_frames, c.source_rate))
            .unwrap_or(0.0)
    }

    pub fn marks(&self) -> Option<TransitionMarks> {
        self.scan_info.lock().unwrap().as_ref().map(|s| s.marks)
    }

    /// Intro length used by the other deck when fading in over this one.
    pub fn leading_duration(&self) -> f64 {
        self.marks().map(|m| m.leading).unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> Option<DeckSnapshot> {
        let chain = self.chain.lock().unwrap();
        let chain = chain.as_ref()?;
        Some(DeckSnapshot {
            deck: self.id,
            track_path: chain.track.full_path().to_path_buf(),
            position: frames_to_seconds(
                self.position_frames.load(Ordering::SeqCst),
                chain.source_rate,
            ),
            duration: frames_to_seconds(chain.total_frames, chain.source_rate),
            gain: self.gain.load(),
            playing: self.playing.load(Ordering::SeqCst),
            main: self.is_main(),
        })
    }

    // ---- control surface ----

    /// Queue a load; serviced by the loading worker. A request already in
    /// the slot is replaced.
    pub fn request_load(&self, request: LoadRequest) {
        self.loading.store(true, Ordering::SeqCst);
        self.load_slot.submit(request);
    }

    /// No-op when nothing is loaded.
    pub fn start(&self, core: &EngineCore) {
        if !self.is_loaded() {
            return;
        }
        if self.playing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.input_eof.store(false, Ordering::SeqCst);
        info!(deck = %self.id, "started");
        core.notify(&EngineEvent::Started { deck: self.id });
        // The render gate opens last so no position report can precede the
        // started notification.
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Cooperative stop: clears `playing` and waits up to ~1 s for the
    /// audio thread to observe it. Returns whether it did.
    pub fn stop(&self) -> bool {
        if !self.playing.load(Ordering::SeqCst) {
            return true;
        }
        self.playing.store(false, Ordering::SeqCst);

        for _ in 0..500 {
            if self.stopped.load(Ordering::SeqCst) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        warn!(deck = %self.id, "audio thread did not observe stop in time");
        false
    }

    /// Stop without waiting; used from the audio thread itself.
    pub fn stop_no_wait(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }

    /// Seek the buffering reader; flushes resampler state.
    pub fn set_position(&self, seconds: f64) {
        let mut chain = self.chain.lock().unwrap();
        if let Some(chain) = chain.as_mut() {
            let frame =
                seconds_to_frames(seconds.max(0.0), chain.source_rate).min(chain.total_frames);
            chain.source.seek_frames(frame);
            self.position_frames.store(frame, Ordering::SeqCst);
            self.input_eof.store(false, Ordering::SeqCst);
            trace!(deck = %self.id, seconds, frame, "repositioned");
        }
    }

    pub fn set_position_fractional(&self, fraction: f64) {
        let duration = self.duration_seconds();
        if duration > 0.0 {
            self.set_position(duration * fraction.clamp(0.0, 1.0));
        }
    }

    /// Release the chain and notify `unloaded`.
    pub fn unload_track(&self, core: &EngineCore) {
        self.stop();
        self.unload_internal(core);
    }

    /// Pull the transition window in so the fade-out begins now. Used by
    /// the forced fade-out path.
    pub fn pull_in_transition(&self, now: f64, max_transition_time: f64) {
        let mut info = self.scan_info.lock().unwrap();
        if let Some(info) = info.as_mut() {
            let marks = &mut info.marks;
            marks.pre_cue = now;
            marks.cue = now;
            marks.start = now;
            marks.end = (now + max_transition_time).min(marks.end_of_playout).max(now);
            debug!(deck = %self.id, now, end = marks.end, "transition pulled in for fade-out");
        }
    }

    /// Re-prepare the source chain for a (new) stream configuration. Runs
    /// on the control thread with the device stopped.
    pub fn prepare_chain(&self, spec: crate::audio::StreamSpec) {
        let mut chain = self.chain.lock().unwrap();
        if let Some(chain) = chain.as_mut() {
            chain.source.prepare(spec.sample_rate, spec.buffer_frames);
        }
    }

    /// Recompute marks after a parameter change.
    pub fn re_derive_marks(&self, max_transition_time: f64) {
        let mut info = self.scan_info.lock().unwrap();
        if let Some(info) = info.as_mut() {
            info.marks = TransitionMarks::derive(&info.scan, max_transition_time);
        }
    }

    // ---- loading worker ----

    /// Service pending load and scan requests. Runs on the loading thread.
    pub fn service(&self, core: &EngineCore) -> Duration {
        if let Some(request) = self.load_slot.take() {
            loop {
                let Some(track) = core.fetch_next_track() else {
                    debug!(deck = %self.id, "queue exhausted before a loadable track");
                    break;
                };
                let path = track.full_path().to_path_buf();
                match self.install(core, track, request.play) {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(deck = %self.id, path = %path.display(), error = %e, "skipping unloadable track");
                    }
                }
            }
            self.loading.store(false, Ordering::SeqCst);
            return Duration::ZERO;
        }

        if let Some(ticket) = self.scan_slot.take() {
            self.run_scan(core, ticket);
            return Duration::ZERO;
        }

        Duration::from_millis(20)
    }

    /// Open, probe, and install a new chain; unloads any prior track.
    fn install(&self, core: &EngineCore, track: TrackHandle, play: bool) -> Result<()> {
        let path = track.full_path().to_path_buf();
        let mut reader = self.registry.open(&path)?;
        let rate = reader.sample_rate();
        let total = reader.total_frames();

        // Playback begins at real sound; the full scan refines the rest of
        // the offsets later.
        let first_audible = TrackScanner::find_first_audible(&mut reader).unwrap_or(0);
        reader.seek(first_audible)?;

        let ring = SharedRing::new(rate as usize * READ_AHEAD_SECONDS, first_audible);
        let feeder = Arc::new(RingFeeder::new(Arc::clone(&ring), reader));
        let buffering = BufferingReader::new(ring);
        let mut source = ResamplingReader::new(buffering, rate);
        if let Some(spec) = core.stream_spec() {
            source.prepare(spec.sample_rate, spec.buffer_frames);
        }

        // Atomically replace the previous track.
        self.unload_internal(core);

        let load_id = Uuid::new_v4();
        let scan = ScanResult {
            sample_rate: rate,
            total_frames: total,
            first_audible,
            last_audible: total,
            end_of_playout: total,
            full_energy: first_audible,
        };
        let marks = TransitionMarks::derive(&scan, core.max_transition_time());
        *self.scan_info.lock().unwrap() = Some(DeckScan { scan, marks });

        self.source_rate.store(rate, Ordering::SeqCst);
        self.position_frames.store(first_audible, Ordering::SeqCst);
        self.end_playout_frames.store(total, Ordering::SeqCst);
        self.input_eof.store(false, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);

        {
            let mut chain = self.chain.lock().unwrap();
            *chain = Some(Chain {
                source,
                source_rate: rate,
                total_frames: total,
                last_gain: self.gain(),
                was_playing: false,
                track,
                load_id,
            });
        }

        core.register_feeder(feeder);

        info!(
            deck = %self.id,
            path = %path.display(),
            sample_rate = rate,
            total_frames = total,
            first_audible,
            "track loaded"
        );
        core.on_deck_loaded(self.id);

        self.scan_slot.put(ScanTicket { load_id, path });
        core.notify(&EngineEvent::TrackScanning { deck: self.id });

        if play {
            self.start(core);
        }
        Ok(())
    }

    fn run_scan(&self, core: &EngineCore, ticket: ScanTicket) {
        let result = match self.scanner.scan(&ticket.path) {
            Ok(result) => result,
            Err(e) => {
                // Fallback offsets from install remain in effect.
                warn!(deck = %self.id, path = %ticket.path.display(), error = %e, "scan failed, using fallback offsets");
                core.notify(&EngineEvent::TrackScanned { deck: self.id });
                return;
            }
        };

        let current = {
            let chain = self.chain.lock().unwrap();
            chain.as_ref().map(|c| c.load_id)
        };
        if current != Some(ticket.load_id) {
            debug!(deck = %self.id, "discarding stale scan result");
            return;
        }

        let marks = TransitionMarks::derive(&result, core.max_transition_time());
        self.end_playout_frames
            .store(result.end_of_playout, Ordering::SeqCst);
        *self.scan_info.lock().unwrap() = Some(DeckScan { scan: result, marks });

        debug!(
            deck = %self.id,
            cue = marks.cue,
            start = marks.start,
            end = marks.end,
            leading = marks.leading,
            "scan published"
        );
        core.notify(&EngineEvent::TrackScanned { deck: self.id });
    }

    /// Drop the chain (outside the lock) and notify `unloaded`.
    pub(crate) fn unload_internal(&self, core: &EngineCore) {
        let previous = { self.chain.lock().unwrap().take() };
        if previous.is_none() {
            return;
        }
        drop(previous);

        self.scan_slot.clear();
        *self.scan_info.lock().unwrap() = None;
        self.playing.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        self.input_eof.store(false, Ordering::SeqCst);
        self.position_frames.store(0, Ordering::SeqCst);
        self.end_playout_frames.store(u64::MAX, Ordering::SeqCst);

        info!(deck = %self.id, "unloaded");
        core.on_deck_unloaded(self.id);
    }

    // ---- audio thread ----

    /// Produce one block of interleaved stereo audio.
    pub(crate) fn render_block(&self, out: &mut [f32]) -> DeckRender {
        let mut guard = self.chain.lock().unwrap();
        let Some(chain) = guard.as_mut() else {
            out.fill(0.0);
            self.stopped.store(true, Ordering::SeqCst);
            return DeckRender::default();
        };
        if self.stopped.load(Ordering::SeqCst) {
            out.fill(0.0);
            return DeckRender::default();
        }

        let was_playing = chain.was_playing;
        let status = chain.source.get_next_block(out);
        let frames = out.len() / 2;

        if was_playing && !self.playing.load(Ordering::SeqCst) {
            // Just stopped: fade the final block instead of cutting.
            let ramp_frames = STOP_RAMP_FRAMES.min(frames);
            apply_gain_ramp(&mut out[..ramp_frames * 2], 1.0, 0.0);
            for sample in &mut out[ramp_frames * 2..] {
                *sample = 0.0;
            }
        }

        let read_pos = chain.source.position_frames();
        self.position_frames.store(read_pos, Ordering::SeqCst);

        if status.ended || read_pos > self.end_playout_frames.load(Ordering::SeqCst) + 1 {
            if self.playing.swap(false, Ordering::SeqCst) {
                self.input_eof.store(true, Ordering::SeqCst);
            }
        }

        let playing_now = self.playing.load(Ordering::SeqCst);
        self.stopped.store(!playing_now, Ordering::SeqCst);
        chain.was_playing = playing_now;

        let target = self.gain.load();
        apply_gain_ramp(out, chain.last_gain, target);
        chain.last_gain = target;

        DeckRender {
            position: if was_playing || playing_now {
                Some(frames_to_seconds(read_pos, chain.source_rate))
            } else {
                None
            },
            finished: was_playing && !playing_now,
            starved: status.starved && (was_playing || playing_now),
        }
    }
}
