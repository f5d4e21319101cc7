//! Session management for conversations with the chat backend.
//!
//! This module owns everything above the transport:
//!
//! - Sessions with bounded context windows and automatic summarization
//! - Streaming replies written into placeholders as they arrive
//! - User preferences and their validation
//! - Snapshot persistence through a pluggable storage sink
//! - Slash commands and terminal rendering for the REPL
//!
//! # Architecture
//!
//! The module is organized into several components:
//!
//! - [`config`]: CLI argument parsing and preferences
//! - [`session`]: The session store and its observers
//! - [`storage`]: Persistence sinks and the snapshot format
//! - [`commands`]: Slash command parsing
//! - [`render`]: Terminal output

mod commands;
mod config;
mod render;
mod session;
mod storage;

pub use commands::{ChatCommand, help_text, parse_command};
pub use config::{ChatArgs, ChatConfig, SubmitKey, Theme, is_valid_number};
pub use render::{TerminalObserver, format_config, format_sessions, format_transcript};
pub use session::{
    SessionObserver, SessionStore, memory_prompt_message, messages_with_memory, trim_topic,
};
pub use storage::{
    FileStorage, MemoryStorage, PersistedState, SNAPSHOT_VERSION, STORAGE_KEY, StateStorage,
    decode_snapshot, encode_snapshot,
};
