// Public modules
pub mod chat_session;
pub mod message;
pub mod response_record;

// Re-exports
pub use chat_session::{ChatSession, ChatStat};
pub use message::{Message, MessageRole};
pub use response_record::{DONE_TYPE, ResponseRecord};
