//! Live event tracking and realtime chat relay for VTuber broadcast
//! channels, backed by the Holodex API.
//!
//! The [`holodex::HolodexEngine`] polls stream state on a wall-clock-aligned
//! schedule, keeps a persistent realtime connection for chat frames, and
//! delivers both kinds of events to consumer channels.

pub mod config;
pub mod error;
pub mod holodex;
