//! Track loading requests.
//!
//! Each deck owns one load slot and one scan slot, both serviced by the
//! shared loading worker. A slot holds at most one pending request:
//! submitting a second before the first is serviced replaces it
//! (last-writer-wins, matching operator intent of "load this now").

use std::path::PathBuf;
use std::sync::{Mutex, Weak};
use std::time::Duration;
use uuid::Uuid;

use crate::events::DeckId;
use crate::workers::TimeSliceClient;

use super::engine::EngineCore;

/// A pending load for one deck: pull tracks from the engine queue until
/// one opens. Tracks that fail to open are skipped with a log and nobody
/// is notified, so the request as a whole either lands a playable track or
/// quietly drains away.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoadRequest {
    /// Transition the deck to playing once the track is installed.
    pub play: bool,
}

/// Last-writer-wins request slot.
#[derive(Default)]
pub(crate) struct LoadSlot {
    pending: Mutex<Option<LoadRequest>>,
}

impl LoadSlot {
    pub fn submit(&self, request: LoadRequest) {
        *self.pending.lock().unwrap() = Some(request);
    }

    pub fn take(&self) -> Option<LoadRequest> {
        self.pending.lock().unwrap().take()
    }
}

/// A scheduled background scan, tied to the chain that requested it so
/// stale results are discarded after a reload.
pub(crate) struct ScanTicket {
    pub load_id: Uuid,
    pub path: PathBuf,
}

#[derive(Default)]
pub(crate) struct ScanSlot {
    pending: Mutex<Option<ScanTicket>>,
}

impl ScanSlot {
    pub fn put(&self, ticket: ScanTicket) {
        *self.pending.lock().unwrap() = Some(ticket);
    }

    pub fn take(&self) -> Option<ScanTicket> {
        self.pending.lock().unwrap().take()
    }

    pub fn clear(&self) {
        *self.pending.lock().unwrap() = None;
    }
}

/// Loading-worker client servicing one deck's load and scan slots.
pub(crate) struct DeckServiceClient {
    core: Weak<EngineCore>,
    deck: DeckId,
}

impl DeckServiceClient {
    pub fn new(core: Weak<EngineCore>, deck: DeckId) -> Self {
        Self { core, deck }
    }
}

impl TimeSliceClient for DeckServiceClient {
    fn run_slice(&self) -> Duration {
        match self.core.upgrade() {
            Some(core) => core.deck(self.deck).service(&core),
            None => Duration::from_secs(1),
        }
    }

    fn is_alive(&self) -> bool {
        self.core.strong_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_submission_replaces_the_first() {
        let slot = LoadSlot::default();
        slot.submit(LoadRequest { play: false });
        slot.submit(LoadRequest { play: true });

        let pending = slot.take().expect("a request is pending");
        assert!(pending.play, "the later request wins");
        assert!(slot.take().is_none());
    }

    #[test]
    fn scan_slot_clear_cancels() {
        let slot = ScanSlot::default();
        slot.put(ScanTicket {
            load_id: Uuid::new_v4(),
            path: PathBuf::from("/t.flac"),
        });
        slot.clear();
        assert!(slot.take().is_none());
    }
}
