//! Client-side message synchronization for a single chat room.
//!
//! [`SyncEngine`] keeps one ordered, duplicate-free [`MessageLog`] consistent
//! across an initial history load, pushes from the live channel and local
//! sends that are shown optimistically before the server confirms them.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod live;
pub mod message;
pub mod session;
pub mod store;

pub use api::{ChatApi, HttpChatApi};
pub use config::{load_settings, Settings};
pub use engine::{EngineOptions, SyncEngine, SyncEvent};
pub use error::{
    ChannelError, ConfigError, HistoryLoadError, SendError, SyncError, ValidationError,
};
pub use history::{HistoryLoader, HistorySnapshot};
pub use live::{
    ChannelState, LiveChannel, LiveConnection, LiveEvent, LiveTransport, ReconnectPolicy,
    WebSocketTransport,
};
pub use message::Message;
pub use session::Session;
pub use store::{Admission, MergeReport, MessageLog, MessageStore};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
