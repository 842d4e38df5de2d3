//! Platter Core - shared library for the Platter digital vinyl system
//!
//! Timecoded vinyl on a real turntable drives playback of digital audio.
//! This crate implements the parts that sit on the real-time audio path:
//! track ingestion from an external decoder process into a block-structured
//! PCM store, and the pitch filter that turns discrete timecode position
//! observations into a smooth playback velocity.
//!
//! The GUI, the timecode signal front end, and the audio output path live
//! elsewhere and talk to this crate through the types in [`rig`] and the
//! read-side APIs on [`track::Track`] and [`pitch::Pitch`].

pub mod pitch;
pub mod rig;
pub mod track;
pub mod types;

pub use pitch::Pitch;
pub use rig::{PollSlot, Rig};
pub use track::{Track, TrackError};
pub use types::*;
