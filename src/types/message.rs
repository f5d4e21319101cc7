use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Role of the author of a message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User role.
    User,

    /// Assistant role.
    Assistant,

    /// System role, used for the synthesized memory prompt.
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// One entry of a conversation transcript.
///
/// A message is immutable once `streaming` is false.  While it is true the content is
/// rewritten in place as the reply arrives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// The author of the message.
    pub role: MessageRole,

    /// The text of the message.
    pub content: String,

    /// When the message was created.
    #[serde(with = "crate::utils::time")]
    pub date: OffsetDateTime,

    /// True while the reply is still arriving.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub streaming: bool,
}

impl Message {
    /// Create a new finalized message stamped with the current time.
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            date: OffsetDateTime::now_utc(),
            streaming: false,
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create the empty assistant message that a streaming reply is written into.
    pub fn placeholder() -> Self {
        Self {
            streaming: true,
            ..Self::assistant("")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_streaming_and_empty() {
        let message = Message::placeholder();
        assert_eq!(message.role, MessageRole::Assistant);
        assert!(message.content.is_empty());
        assert!(message.streaming);
    }

    #[test]
    fn serde_omits_streaming_when_false() {
        let message = Message::user("hello");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");
        assert!(json.get("streaming").is_none());

        let back: Message = serde_json::from_value(json).unwrap();
        assert!(!back.streaming);
        assert_eq!(back.date.unix_timestamp(), message.date.unix_timestamp());
    }
}
