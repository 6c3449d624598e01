//! segue-engine: an automatic DJ-style playback engine.
//!
//! Given an abstract queue of tracks, the engine produces one continuous
//! stereo stream in which successive tracks are crossfaded at musically
//! sensible points, without gaps or clicks. Two decks alternate: while one
//! plays, a background scanner measures where its audible material ends,
//! and a transition controller pre-loads, pre-starts, and gain-ramps the
//! other deck so the next track's intro overlaps the outgoing track's tail.
//!
//! ```no_run
//! use segue_engine::{Engine, EngineConfig, VecTrackQueue};
//!
//! let mut queue = VecTrackQueue::new();
//! queue.push_path("/music/first.flac");
//! queue.push_path("/music/second.mp3");
//!
//! let engine = Engine::new(Box::new(queue), EngineConfig::default())?;
//! engine.play();
//! # Ok::<(), segue_engine::Error>(())
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod playback;
pub mod queue;

mod atomic;
mod workers;

pub use audio::{AudioDevice, BlockCallback, CpalOutput, FormatRegistry, StreamSpec};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use events::{DeckId, EngineEvent, EngineListener, ListenerId};
pub use playback::{
    DeckSnapshot, Engine, PostProcessor, ScanResult, TrackScanner, TransitionState,
};
pub use queue::{FileTrack, Track, TrackHandle, TrackQueue, VecTrackQueue};
