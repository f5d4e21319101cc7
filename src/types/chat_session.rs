use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::locale;
use crate::types::Message;

/// Running totals over the assistant replies of a session.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStat {
    /// Number of characters received.
    pub char_count: u64,

    /// Number of whitespace-separated words received.
    pub word_count: u64,

    /// Estimated number of tokens received.
    pub token_count: u64,
}

impl ChatStat {
    /// Adds one finalized reply to the totals.
    pub fn record(&mut self, content: &str) {
        let chars = content.chars().count() as u64;
        self.char_count += chars;
        self.word_count += content.split_whitespace().count() as u64;
        self.token_count += estimate_tokens(chars);
    }
}

/// Roughly four characters per token.
fn estimate_tokens(chars: u64) -> u64 {
    chars.div_ceil(4)
}

/// One conversation thread.
///
/// The `id` is issued by the backend when the session is created and is the key for every
/// later chat or delete request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSession {
    /// Server-issued session id.
    pub id: String,

    /// Short label for the conversation.
    pub topic: String,

    /// Summary standing in for messages before `last_summarize_index`.
    pub memory_prompt: String,

    /// The transcript, oldest first.
    pub messages: Vec<Message>,

    /// Reply statistics.
    pub stat: ChatStat,

    /// Last time a reply was finalized.
    #[serde(with = "crate::utils::time")]
    pub last_update: OffsetDateTime,

    /// Index of the first message not yet folded into `memory_prompt`.
    pub last_summarize_index: usize,
}

impl ChatSession {
    /// Creates a fresh session for a server-issued id, opened with the assistant greeting.
    pub fn new(id: impl Into<String>) -> Self {
        let greeting = Message::assistant(locale::BOT_HELLO);
        let created = greeting.date;
        Self {
            id: id.into(),
            topic: locale::DEFAULT_TOPIC.to_string(),
            memory_prompt: String::new(),
            messages: vec![greeting],
            stat: ChatStat::default(),
            last_update: created,
            last_summarize_index: 0,
        }
    }

    /// Returns true while the session still carries the default topic.
    pub fn has_default_topic(&self) -> bool {
        self.topic == locale::DEFAULT_TOPIC
    }

    /// Returns true if any message is still being streamed into.
    pub fn is_streaming(&self) -> bool {
        self.messages.iter().any(|m| m.streaming)
    }
}
