//! Dual-deck transition state machine.
//!
//! Driven exclusively by the *main* deck's position updates, delivered on
//! the audio thread. As the position advances it pulls the next track from
//! the queue at the cue point, starts the incoming deck ahead of the
//! outgoing fade by that track's leading duration, and ramps both decks'
//! gains through the crossfade window.

use tracing::{debug, info};

use crate::events::{DeckId, EngineEvent};

use super::engine::EngineCore;

/// Progress of the current transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransitionState {
    /// No transition pending.
    Idle,
    /// The pre-cue warning fired; the cue point is near.
    Cueing,
    /// The next track has been requested from the queue.
    Cued,
    /// The incoming deck is running; gains are ramping.
    Transit,
}

pub(crate) struct TransitionController {
    pub state: TransitionState,
    /// The outgoing deck of the transition in progress.
    pub transiting: Option<DeckId>,
    /// While positive, the controller proceeds past the cue point even with
    /// an empty queue so a fade-to-silence still happens.
    pub force_fading_out: u32,
}

impl TransitionController {
    pub fn new() -> Self {
        Self {
            state: TransitionState::Idle,
            transiting: None,
            force_fading_out: 0,
        }
    }

    /// Advance the state machine for a main-deck position update.
    pub fn on_main_position(&mut self, core: &EngineCore, sender: DeckId, position: f64) {
        let deck = core.deck(sender);
        let Some(marks) = deck.marks() else {
            return;
        };
        let next = core.deck(sender.other());
        let shape = core.crossfade_shape();
        let max_leading = core.max_leading_duration();

        if self.state < TransitionState::Cued {
            if self.state == TransitionState::Idle && position > marks.pre_cue {
                self.state = TransitionState::Cueing;
                debug!(deck = %sender, position, "pre-cue");
                core.notify(&EngineEvent::PreCueNext);
            }
            if position > marks.cue {
                if !core.load_next_track(Some(sender), false) && self.force_fading_out == 0 {
                    // Queue is empty: let the deck play out to its natural
                    // end.
                    return;
                }
                debug!(deck = %sender, position, "cued next track");
                self.state = TransitionState::Cued;
                self.transiting = Some(sender);
            }
        }

        let leading = next.leading_duration();
        if position > marks.start - leading {
            if self.state == TransitionState::Cued && next.is_loaded() {
                info!(from = %sender, to = %next.id(), position, "transit");
                self.state = TransitionState::Transit;
                next.set_volume(1.0);
                if self.force_fading_out > 0 && leading >= max_leading {
                    // Skip most of a long intro so the forced fade lands on
                    // full-energy material.
                    let Some(next_marks) = next.marks() else {
                        return;
                    };
                    next.set_position(next_marks.first_audible + leading - max_leading);
                }
                next.start(core);
            }

            if self.state == TransitionState::Transit && leading >= max_leading && leading > 0.0 {
                let progress =
                    ((position - (marks.start - leading)) / leading).clamp(0.25, 1.0);
                next.set_volume(shape.fade_in(progress));
            }
        }

        if position >= marks.start {
            let duration = marks.end - marks.start;
            let progress = if duration > 0.0 {
                ((position - marks.start) / duration).clamp(0.0, 1.0)
            } else {
                1.0
            };
            if duration > 0.0 {
                deck.set_volume(shape.fade_out(progress));
            }
            if self.state != TransitionState::Idle
                && position > marks.end
                && progress >= 1.0
            {
                debug!(deck = %sender, position, "transition window elapsed, stopping");
                deck.stop_no_wait();
            }
        }
    }

    /// Transition bookkeeping when a deck unloads.
    pub fn on_deck_unloaded(&mut self, core: &EngineCore, deck: DeckId) {
        if self.transiting != Some(deck) {
            // A main deck that reached its natural end without a transition
            // in flight (empty queue) still resets the machine.
            if self.transiting.is_none() && core.deck(deck).is_main() {
                self.state = TransitionState::Idle;
            }
            return;
        }

        if self.state == TransitionState::Cued {
            // The outgoing deck stopped before the transit point; bring the
            // already-loaded next deck in immediately.
            let next = core.deck(deck.other());
            if next.is_loaded() {
                info!(deck = %next.id(), "outgoing deck left early, starting next");
                next.start(core);
            }
        }

        self.state = TransitionState::Idle;
        self.transiting = None;
        if self.force_fading_out > 0 {
            self.force_fading_out -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_order_is_monotonic() {
        assert!(TransitionState::Idle < TransitionState::Cueing);
        assert!(TransitionState::Cueing < TransitionState::Cued);
        assert!(TransitionState::Cued < TransitionState::Transit);
    }

    #[test]
    fn new_controller_is_idle() {
        let controller = TransitionController::new();
        assert_eq!(controller.state, TransitionState::Idle);
        assert!(controller.transiting.is_none());
        assert_eq!(controller.force_fading_out, 0);
    }
}
