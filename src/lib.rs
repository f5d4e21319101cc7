//! A streaming client for a conversational backend.
//!
//! The crate is layered bottom-up:
//!
//! - [`sse`] frames raw bytes into [`types::ResponseRecord`]s
//! - [`decoder`] assembles records into the growing text of a reply
//! - [`transport`] runs one chat request with deadlines and cancellation
//! - [`client`] implements the transport over HTTP
//! - [`chat`] owns sessions, preferences and persistence on top of all of it

// Public modules
pub mod chat;
pub mod client;
pub mod decoder;
pub mod error;
pub mod locale;
pub mod observability;
pub mod sse;
pub mod transport;
pub mod types;
pub mod utils;

// Re-exports
pub use chat::{ChatConfig, SessionObserver, SessionStore};
pub use client::ChatClient;
pub use decoder::{StreamDecoder, StreamUpdate};
pub use error::{Error, Result};
pub use observability::register_biometrics;
pub use transport::{
    ByteStream, CancelHandle, ChatTransport, ChatTurn, DecodingSink, MessageSink,
    TransportEvent, TransportSink, TurnOptions, collect_response, send, send_with,
};
pub use types::*;
