//! User-visible strings produced by the core.

/// Topic given to a session until a label has been generated for it.
pub const DEFAULT_TOPIC: &str = "New Conversation";

/// Greeting that opens every new session.
pub const BOT_HELLO: &str = "Hello! How can I assist you today?";

/// Notice appended to a reply that failed to arrive.
pub const ERROR_NOTICE: &str = "Something went wrong, please try again later.";

/// Instruction asking the backend for a short topic label.
pub const TOPIC_PROMPT: &str = "Please generate a four to five word title summarizing our \
    conversation without any lead-in, punctuation, quotation marks, periods, symbols, or \
    additional text. Remove enclosing quotation marks.";

/// Instruction asking the backend to compress the transcript into a memory prompt.
pub const SUMMARIZE_PROMPT: &str = "Summarize our discussion briefly in 200 words or less to \
    use as a prompt for future context.";

/// Wraps a memory prompt into the system message sent ahead of the context window.
pub fn history_prompt(content: &str) -> String {
    format!("This is a summary of the chat history between the AI and the user as a recap: {content}")
}
