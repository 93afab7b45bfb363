pub mod api;
pub mod directory;
pub mod engine;
pub mod error;
pub mod realtime;
pub mod socketio;
pub mod tracker;
pub mod types;

pub use engine::{EventSinks, HolodexEngine};
pub use error::HolodexError;
pub use types::{ChannelRecord, ChatMessage, StreamEvent, StreamStatus};
