//! Event fan-out.
//!
//! The engine announces deck lifecycle and transition milestones through a
//! thread-safe listener registry. Events are delivered synchronously on the
//! thread that produced them (audio, loading, or control), so listeners must
//! be non-blocking; the registry is snapshotted under its lock and invoked
//! with the lock released, which lets a listener add or remove listeners
//! without deadlocking.

use std::fmt;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// One of the two playback channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeckId {
    A,
    B,
}

impl DeckId {
    pub fn other(self) -> DeckId {
        match self {
            DeckId::A => DeckId::B,
            DeckId::B => DeckId::A,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            DeckId::A => 0,
            DeckId::B => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DeckId::A => "Deck A",
            DeckId::B => "Deck B",
        }
    }
}

impl fmt::Display for DeckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Engine events delivered to registered listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A track finished installing on a deck. Always precedes any
    /// `Position` event for the same track.
    Loaded { deck: DeckId },
    /// The deck began producing audible output.
    Started { deck: DeckId },
    /// The deck reached the end of its track (or was stopped). Always
    /// precedes `Unloaded` for a natural end.
    Finished { deck: DeckId },
    /// The deck released its track.
    Unloaded { deck: DeckId },
    /// Playback position of a deck, in seconds of source time.
    Position { deck: DeckId, seconds: f64 },
    /// The deck submitted its track to the background scanner.
    TrackScanning { deck: DeckId },
    /// Scan results were published to the deck.
    TrackScanned { deck: DeckId },
    /// Soft pre-warning: the main deck will cue the next track shortly.
    PreCueNext,
    /// The output device was replaced and the mixer reconfigured.
    AudioDeviceChanged,
}

/// Callback set registered with the engine.
///
/// Invoked from the audio, loading, and control threads; implementations
/// must return quickly and must not block.
pub trait EngineListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

impl<F> EngineListener for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent) {
        self(event)
    }
}

/// Opaque handle returned by [`Listeners::add`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

/// Thread-safe listener list with copy-on-iterate dispatch.
#[derive(Default)]
pub(crate) struct Listeners {
    entries: Mutex<Vec<(ListenerId, Arc<dyn EngineListener>)>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn EngineListener>) -> ListenerId {
        let id = ListenerId(Uuid::new_v4());
        self.entries.lock().unwrap().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Snapshot the registry under the lock, then invoke with it released.
    pub fn notify(&self, event: &EngineEvent) {
        let snapshot: Vec<Arc<dyn EngineListener>> = {
            let entries = self.entries.lock().unwrap();
            entries.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in snapshot {
            listener.on_event(event);
        }
    }
}
