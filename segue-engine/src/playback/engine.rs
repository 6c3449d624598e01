//! Engine facade.
//!
//! Owns the two decks, the mixer, the output device, and the worker
//! threads; exposes the public control surface and listener registration.
//! Internally [`EngineCore`] is the owning parent the decks, mixer, and
//! transition controller report into with direct method calls; the device
//! callback holds an `Arc` of it.

use segue_common::fade::fading_factor;
use segue_common::CrossfadeShape;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::atomic::{AtomicF32, AtomicF64};
use crate::audio::level::{LevelShared, LevelTracker, LevelUpdateClient};
use crate::audio::{AudioDevice, CpalOutput, FormatRegistry, StreamSpec};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{DeckId, EngineEvent, EngineListener, ListenerId, Listeners};
use crate::queue::{TrackHandle, TrackQueue};
use crate::workers::WorkerThread;

use super::deck::{Deck, DeckSnapshot};
use super::loader::{DeckServiceClient, LoadRequest};
use super::mixer::{Mixer, PostProcessor};
use super::transition::{TransitionController, TransitionState};

/// Runtime parameters shared across threads as atomics.
pub(crate) struct EngineParams {
    fading_curve: AtomicF64,
    fading_factor: AtomicF64,
    max_transition_time: AtomicF64,
    max_leading_duration: AtomicF64,
    master_gain: AtomicF32,
    paused: AtomicBool,
    keep_playing: AtomicBool,
}

impl EngineParams {
    fn new(config: &EngineConfig) -> Self {
        Self {
            fading_curve: AtomicF64::new(config.fading_curve),
            fading_factor: AtomicF64::new(fading_factor(config.fading_curve)),
            max_transition_time: AtomicF64::new(config.max_transition_time),
            max_leading_duration: AtomicF64::new(config.max_leading_duration),
            master_gain: AtomicF32::new(1.0),
            paused: AtomicBool::new(false),
            keep_playing: AtomicBool::new(false),
        }
    }
}

/// Shared engine state: decks, mixer, controller, queue, listeners.
pub(crate) struct EngineCore {
    params: EngineParams,
    decks: [Deck; 2],
    queue: Mutex<Box<dyn TrackQueue>>,
    /// Decks currently carrying a playable track, oldest first; the front
    /// is the main deck.
    deck_queue: Mutex<VecDeque<DeckId>>,
    controller: Mutex<TransitionController>,
    mixer: Mutex<Mixer>,
    listeners: Listeners,
    level: Arc<LevelShared>,
    stream_spec: Mutex<Option<StreamSpec>>,

    loading: WorkerThread,
    read_ahead: WorkerThread,
    visualisation: WorkerThread,
}

impl EngineCore {
    fn build(queue: Box<dyn TrackQueue>, config: &EngineConfig) -> Arc<Self> {
        let registry = Arc::new(FormatRegistry::new());
        let tracker = LevelTracker::new();
        let level = tracker.readout();

        let core = Arc::new(Self {
            params: EngineParams::new(config),
            decks: [
                Deck::new(DeckId::A, Arc::clone(&registry)),
                Deck::new(DeckId::B, Arc::clone(&registry)),
            ],
            queue: Mutex::new(queue),
            deck_queue: Mutex::new(VecDeque::new()),
            controller: Mutex::new(TransitionController::new()),
            mixer: Mutex::new(Mixer::new(tracker)),
            listeners: Listeners::new(),
            level: Arc::clone(&level),
            stream_spec: Mutex::new(None),
            loading: WorkerThread::spawn("segue-loading"),
            read_ahead: WorkerThread::spawn("segue-read-ahead"),
            visualisation: WorkerThread::spawn("segue-level"),
        });

        for id in [DeckId::A, DeckId::B] {
            core.loading
                .register(Arc::new(DeckServiceClient::new(Arc::downgrade(&core), id)));
        }
        core.visualisation
            .register(Arc::new(LevelUpdateClient::new(level)));

        core
    }

    pub fn deck(&self, id: DeckId) -> &Deck {
        &self.decks[id.index()]
    }

    pub fn notify(&self, event: &EngineEvent) {
        self.listeners.notify(event);
    }

    pub fn stream_spec(&self) -> Option<StreamSpec> {
        *self.stream_spec.lock().unwrap()
    }

    pub fn crossfade_shape(&self) -> CrossfadeShape {
        CrossfadeShape::from_factor(self.params.fading_factor.load())
    }

    pub fn max_transition_time(&self) -> f64 {
        self.params.max_transition_time.load()
    }

    pub fn max_leading_duration(&self) -> f64 {
        self.params.max_leading_duration.load()
    }

    pub fn master_gain(&self) -> f32 {
        self.params.master_gain.load()
    }

    pub fn is_paused(&self) -> bool {
        self.params.paused.load(Ordering::SeqCst)
    }

    pub fn fetch_next_track(&self) -> Option<TrackHandle> {
        self.queue.lock().unwrap().fetch_next_track()
    }

    pub fn register_feeder(&self, feeder: Arc<crate::audio::buffering::RingFeeder>) {
        self.read_ahead.register(feeder);
    }

    fn any_deck_playing(&self) -> bool {
        self.decks.iter().any(|d| d.is_playing())
    }

    fn main_deck_id(&self) -> Option<DeckId> {
        self.deck_queue.lock().unwrap().front().copied()
    }

    /// Pick the deck a new track should land on and queue the load.
    /// Returns false when the queue has nothing to fetch.
    pub fn load_next_track(&self, from: Option<DeckId>, play: bool) -> bool {
        if self.queue.lock().unwrap().is_empty() {
            return false;
        }
        let target = match from {
            Some(deck) => deck.other(),
            // No sender: pick an empty deck; with both occupied there is
            // nowhere to load.
            None => {
                let Some(available) = [DeckId::A, DeckId::B]
                    .into_iter()
                    .find(|id| !self.deck(*id).is_loaded() && !self.deck(*id).is_loading())
                else {
                    debug!("no available deck for next track");
                    return false;
                };
                available
            }
        };
        debug!(deck = %target, play, "queueing next-track load");
        self.deck(target).request_load(LoadRequest { play });
        self.loading.wake();
        true
    }

    /// Main-deck reconciliation: the front of the deck queue is main.
    fn remark_main(&self, queue: &VecDeque<DeckId>) {
        let main = queue.front().copied();
        for id in [DeckId::A, DeckId::B] {
            self.deck(id).set_main(main == Some(id));
        }
    }

    pub fn on_deck_loaded(&self, id: DeckId) {
        {
            let mut queue = self.deck_queue.lock().unwrap();
            queue.push_back(id);
            self.remark_main(&queue);
        }
        self.notify(&EngineEvent::Loaded { deck: id });
    }

    pub fn on_deck_unloaded(&self, id: DeckId) {
        self.controller.lock().unwrap().on_deck_unloaded(self, id);
        {
            let mut queue = self.deck_queue.lock().unwrap();
            queue.retain(|d| *d != id);
            self.remark_main(&queue);
        }
        self.notify(&EngineEvent::Unloaded { deck: id });

        // Keep-playing continuation: if nothing is audible any more, pull
        // the next track; with an empty queue, playback has ended.
        if self.params.keep_playing.load(Ordering::SeqCst) && !self.any_deck_playing() {
            if !self.load_next_track(None, true) {
                info!("queue exhausted, playback ends");
                self.params.keep_playing.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Device callback entry point: render one interleaved stereo block.
    pub fn render(&self, out: &mut [f32]) {
        let results = {
            let mut mixer = self.mixer.lock().unwrap();
            mixer.render(self, out)
        };

        for id in [DeckId::A, DeckId::B] {
            let outcome = results[id.index()];
            if let Some(seconds) = outcome.position {
                if outcome.starved {
                    warn!(deck = %id, "read-ahead underflow, emitted silence");
                }
                self.notify(&EngineEvent::Position { deck: id, seconds });
                if self.deck(id).is_main() {
                    self.controller
                        .lock()
                        .unwrap()
                        .on_main_position(self, id, seconds);
                }
            }
            if outcome.finished {
                self.notify(&EngineEvent::Finished { deck: id });
                self.deck(id).unload_internal(self);
            }
        }
    }

    /// Reconfigure after the stream (re)opens.
    fn update_audio_config(&self, spec: StreamSpec, output_latency_frames: usize) {
        *self.stream_spec.lock().unwrap() = Some(spec);
        self.mixer
            .lock()
            .unwrap()
            .update_audio_config(spec, output_latency_frames);
        for id in [DeckId::A, DeckId::B] {
            self.deck(id).prepare_chain(spec);
        }
    }

    fn fade_out(&self) {
        let Some(main_id) = self.main_deck_id() else {
            return;
        };
        let in_transit = {
            let mut controller = self.controller.lock().unwrap();
            controller.force_fading_out += 1;
            controller.state == TransitionState::Transit
        };

        let main = self.deck(main_id);
        let now = main.position_seconds();
        main.pull_in_transition(now, self.max_transition_time());
        info!(deck = %main_id, position = now, in_transit, "forced fade-out");

        if in_transit {
            // Mid-transit the incoming deck is already audible; drop the
            // outgoing deck and let the controller re-evaluate from Idle.
            main.stop_no_wait();
            main.unload_internal(self);
        }
    }
}

/// The automatic DJ playback engine.
///
/// Owns two decks, the mixer chain, the output device, and the background
/// workers. All methods are callable from any thread.
pub struct Engine {
    core: Arc<EngineCore>,
    device: Mutex<Box<dyn AudioDevice>>,
}

impl Engine {
    /// Open the default (or configured) cpal output device and start the
    /// stream. Device failures surface here and nowhere else.
    pub fn new(queue: Box<dyn TrackQueue>, config: EngineConfig) -> Result<Self> {
        let device = Box::new(CpalOutput::new(config.device.clone()));
        Self::with_device(queue, device, config)
    }

    /// Construct against a caller-provided device implementation.
    pub fn with_device(
        queue: Box<dyn TrackQueue>,
        mut device: Box<dyn AudioDevice>,
        config: EngineConfig,
    ) -> Result<Self> {
        let spec = device.open(config.sample_rate, config.buffer_frames)?;
        let core = EngineCore::build(queue, &config);
        core.update_audio_config(spec, device.output_latency_frames());

        let callback_core = Arc::clone(&core);
        device.start(Box::new(move |out| callback_core.render(out)))?;

        info!(
            sample_rate = spec.sample_rate,
            buffer_frames = spec.buffer_frames,
            "engine running"
        );
        Ok(Self {
            core,
            device: Mutex::new(device),
        })
    }

    /// If no deck is playing, begin loading the next track with
    /// play-on-load; either way the engine keeps playing and unpauses.
    pub fn play(&self) {
        if !self.core.any_deck_playing() {
            self.core.load_next_track(None, true);
        }
        self.core.params.keep_playing.store(true, Ordering::SeqCst);
        self.core.params.paused.store(false, Ordering::SeqCst);
    }

    /// Stop and unload both decks.
    pub fn stop(&self) {
        self.core.params.keep_playing.store(false, Ordering::SeqCst);
        for id in [DeckId::A, DeckId::B] {
            self.core.deck(id).unload_track(&self.core);
        }
    }

    /// Flip mixer pause; returns the new state.
    pub fn toggle_pause(&self) -> bool {
        let paused = !self.core.params.paused.load(Ordering::SeqCst);
        self.core.params.paused.store(paused, Ordering::SeqCst);
        info!(paused, "pause toggled");
        paused
    }

    /// Schedule a forced fade-out of the main deck.
    pub fn fade_out(&self) {
        self.core.fade_out();
    }

    pub fn is_playing(&self) -> bool {
        self.core.params.keep_playing.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.core.is_paused()
    }

    /// Reposition the main deck, in seconds.
    pub fn seek(&self, seconds: f64) {
        if let Some(main) = self.core.main_deck_id() {
            self.core.deck(main).set_position(seconds);
            self.core.read_ahead.wake();
        }
    }

    /// Reposition the main deck to a fraction of its duration.
    pub fn seek_fractional(&self, fraction: f64) {
        if let Some(main) = self.core.main_deck_id() {
            self.core.deck(main).set_position_fractional(fraction);
            self.core.read_ahead.wake();
        }
    }

    /// Main-deck position, seconds.
    pub fn position_seconds(&self) -> f64 {
        self.core
            .main_deck_id()
            .map(|id| self.core.deck(id).position_seconds())
            .unwrap_or(0.0)
    }

    /// Main-deck duration, seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.core
            .main_deck_id()
            .map(|id| self.core.deck(id).duration_seconds())
            .unwrap_or(0.0)
    }

    pub fn fading_curve(&self) -> f64 {
        self.core.params.fading_curve.load()
    }

    pub fn set_fading_curve(&self, curve: f64) {
        let curve = curve.clamp(0.0, 100.0);
        self.core.params.fading_curve.store(curve);
        self.core.params.fading_factor.store(fading_factor(curve));
    }

    pub fn max_transition_time(&self) -> f64 {
        self.core.max_transition_time()
    }

    /// Propagates to both decks' transition offsets.
    pub fn set_max_transition_time(&self, seconds: f64) {
        let seconds = seconds.max(0.0);
        self.core.params.max_transition_time.store(seconds);
        for id in [DeckId::A, DeckId::B] {
            self.core.deck(id).re_derive_marks(seconds);
        }
    }

    pub fn max_leading_duration(&self) -> f64 {
        self.core.max_leading_duration()
    }

    pub fn set_max_leading_duration(&self, seconds: f64) {
        self.core.params.max_leading_duration.store(seconds.max(0.0));
    }

    pub fn gain(&self) -> f32 {
        self.core.master_gain()
    }

    pub fn set_gain(&self, gain: f32) {
        self.core.params.master_gain.store(gain.clamp(0.0, 1.0));
    }

    /// Smoothed output magnitude of `channel` (0 = left, 1 = right).
    pub fn get_level(&self, channel: usize) -> f32 {
        self.core.level.level(channel)
    }

    /// Held output peak of `channel`.
    pub fn get_peak_level(&self, channel: usize) -> f32 {
        self.core.level.peak(channel)
    }

    pub fn add_listener(&self, listener: Arc<dyn EngineListener>) -> ListenerId {
        self.core.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.core.listeners.remove(id)
    }

    /// Install (or clear) the black-box post-processing stage.
    pub fn set_post_processor(&self, post: Option<Box<dyn PostProcessor>>) {
        self.core.mixer.lock().unwrap().set_post_processor(post);
    }

    /// Read-only state of one deck, if it has a track.
    pub fn deck_snapshot(&self, deck: DeckId) -> Option<DeckSnapshot> {
        self.core.deck(deck).snapshot()
    }

    /// Current transition state (diagnostics).
    pub fn transition_state(&self) -> TransitionState {
        self.core.controller.lock().unwrap().state
    }

    /// Replace the output device, rerun the mixer configuration, and
    /// notify listeners.
    pub fn set_output_device(&self, mut device: Box<dyn AudioDevice>) -> Result<()> {
        let mut slot = self.device.lock().unwrap();
        slot.close();

        let spec = {
            let spec_config = self.core.stream_spec().map(|s| s.sample_rate).unwrap_or(44_100);
            device.open(spec_config, None)?
        };
        self.core
            .update_audio_config(spec, device.output_latency_frames());

        let callback_core = Arc::clone(&self.core);
        device.start(Box::new(move |out| callback_core.render(out)))?;
        *slot = device;

        info!(sample_rate = spec.sample_rate, "audio device changed");
        self.core.notify(&EngineEvent::AudioDeviceChanged);
        Ok(())
    }

    /// Convenience: switch to a named cpal output device (`None` =
    /// platform default).
    pub fn set_audio_device(&self, name: Option<String>) -> Result<()> {
        self.set_output_device(Box::new(CpalOutput::new(name)))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Stop the device first so its callback (holding an Arc of the
        // core) is dropped and the workers can retire.
        self.device.lock().unwrap().close();
    }
}
