//! Output rendering for the chat application.
//!
//! Updates from the session store carry the whole reply so far.  The terminal observer
//! remembers what it already printed for each session and writes only the new suffix, so a
//! reply appears token by token.  ANSI styling is optional.

use std::collections::HashMap;
use std::io::{self, Stdout, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::chat::config::ChatConfig;
use crate::chat::session::SessionObserver;
use crate::error::Error;
use crate::types::{ChatSession, MessageRole};

/// ANSI escape code for dim text (used for metadata).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code for bold text (used for the current session marker).
const ANSI_BOLD: &str = "\x1b[1m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for cyan text (used for speaker labels).
const ANSI_CYAN: &str = "\x1b[36m";

/// ANSI escape code for red text (used for errors).
const ANSI_RED: &str = "\x1b[31m";

/// Prints streamed replies to a terminal.
pub struct TerminalObserver<W: Write + Send = Stdout> {
    out: Mutex<W>,
    printed: Mutex<HashMap<String, String>>,
    use_color: bool,
}

impl TerminalObserver<Stdout> {
    /// Creates an observer that writes to stdout.
    pub fn new(use_color: bool) -> Self {
        Self::with_writer(io::stdout(), use_color)
    }
}

impl<W: Write + Send> TerminalObserver<W> {
    /// Creates an observer that writes to `out`.
    pub fn with_writer(out: W, use_color: bool) -> Self {
        Self {
            out: Mutex::new(out),
            printed: Mutex::new(HashMap::new()),
            use_color,
        }
    }

    /// Locks and returns the underlying writer.
    pub fn writer(&self) -> MutexGuard<'_, W> {
        self.out.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, text: &str) {
        let mut out = self.writer();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

impl<W: Write + Send> SessionObserver for TerminalObserver<W> {
    fn on_message(&self, session_id: &str, text: &str, done: bool) {
        let mut printed = self.printed.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = printed.get(session_id).map(String::as_str).unwrap_or("");
        let mut output = match text.strip_prefix(previous) {
            Some(suffix) => suffix.to_string(),
            // The reply was rewritten rather than extended; start it over on a fresh line.
            None => format!("\n{text}"),
        };
        if done {
            printed.remove(session_id);
            output.push('\n');
        } else {
            printed.insert(session_id.to_string(), text.to_string());
        }
        drop(printed);
        self.write(&output);
    }

    fn on_error(&self, _session_id: &str, error: &Error) {
        let line = if self.use_color {
            format!("{ANSI_RED}Error: {error}{ANSI_RESET}\n")
        } else {
            format!("Error: {error}\n")
        };
        self.write(&line);
    }
}

/// One line per session, marking the current one.
pub fn format_sessions(sessions: &[ChatSession], current: usize, use_color: bool) -> String {
    let mut out = String::new();
    for (index, session) in sessions.iter().enumerate() {
        let marker = if index == current { "*" } else { " " };
        let count = session.messages.len();
        if use_color && index == current {
            out.push_str(&format!(
                "{ANSI_BOLD}{marker} {index}: {}{ANSI_RESET} {ANSI_DIM}({count} messages){ANSI_RESET}\n",
                session.topic
            ));
        } else if use_color {
            out.push_str(&format!(
                "{marker} {index}: {} {ANSI_DIM}({count} messages){ANSI_RESET}\n",
                session.topic
            ));
        } else {
            out.push_str(&format!(
                "{marker} {index}: {} ({count} messages)\n",
                session.topic
            ));
        }
    }
    out
}

/// The transcript of a session with speaker labels.
pub fn format_transcript(session: &ChatSession, use_color: bool) -> String {
    let mut out = String::new();
    if !session.memory_prompt.is_empty() {
        out.push_str(&label("memory", use_color));
        out.push_str(&session.memory_prompt);
        out.push_str("\n\n");
    }
    for message in &session.messages {
        let speaker = match message.role {
            MessageRole::User => "you",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        };
        out.push_str(&label(speaker, use_color));
        out.push_str(&message.content);
        out.push_str("\n\n");
    }
    let stat = &session.stat;
    out.push_str(&format!(
        "{} chars, {} words, ~{} tokens received",
        stat.char_count, stat.word_count, stat.token_count
    ));
    out
}

/// The preferences as `key: value` lines.
pub fn format_config(config: &ChatConfig) -> String {
    let max_tokens = config
        .max_tokens
        .map(|n| n.to_string())
        .unwrap_or_else(|| "unset".to_string());
    format!(
        "history_message_count: {}\n\
         compress_message_length_threshold: {}\n\
         send_bot_messages: {}\n\
         submit_key: {}\n\
         avatar: {}\n\
         theme: {}\n\
         tight_border: {}\n\
         max_tokens: {}",
        config.history_message_count,
        config.compress_message_length_threshold,
        config.send_bot_messages,
        config.submit_key,
        config.avatar,
        config.theme,
        config.tight_border,
        max_tokens,
    )
}

fn label(speaker: &str, use_color: bool) -> String {
    if use_color {
        format!("{ANSI_CYAN}{speaker}:{ANSI_RESET} ")
    } else {
        format!("{speaker}: ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn output(observer: &TerminalObserver<Vec<u8>>) -> String {
        String::from_utf8(observer.writer().clone()).unwrap()
    }

    #[test]
    fn prints_only_new_text() {
        let observer = TerminalObserver::with_writer(Vec::new(), false);
        observer.on_message("s1", "Hi", false);
        observer.on_message("s1", "Hi there", false);
        observer.on_message("s1", "Hi there", true);
        assert_eq!(output(&observer), "Hi there\n");

        observer.on_message("s1", "Next", false);
        assert_eq!(output(&observer), "Hi there\nNext");
    }

    #[test]
    fn rewritten_reply_starts_over() {
        let observer = TerminalObserver::with_writer(Vec::new(), false);
        observer.on_message("s1", "abc", false);
        observer.on_message("s1", "xyz", true);
        assert_eq!(output(&observer), "abc\nxyz\n");
    }

    #[test]
    fn errors_are_styled_when_colored() {
        let observer = TerminalObserver::with_writer(Vec::new(), true);
        observer.on_error("s1", &Error::network("boom", None));
        let text = output(&observer);
        assert!(text.starts_with(ANSI_RED));
        assert!(text.contains("boom"));
    }

    #[test]
    fn session_list_marks_current() {
        let mut second = ChatSession::new("s1");
        second.topic = "Lifetimes".to_string();
        let sessions = vec![ChatSession::new("s2"), second];
        let text = format_sessions(&sessions, 1, false);
        assert_eq!(
            text,
            "  0: New Conversation (1 messages)\n* 1: Lifetimes (1 messages)\n"
        );
    }

    #[test]
    fn transcript_lists_speakers() {
        let mut session = ChatSession::new("s1");
        session.messages.push(Message::user("hello"));
        session.memory_prompt = "before".to_string();
        let text = format_transcript(&session, false);
        assert!(text.starts_with("memory: before\n\n"));
        assert!(text.contains("you: hello\n\n"));
        assert!(text.ends_with("0 chars, 0 words, ~0 tokens received"));
    }

    #[test]
    fn config_lists_every_field() {
        let text = format_config(&ChatConfig::default());
        assert!(text.contains("history_message_count: 4"));
        assert!(text.contains("submit_key: Ctrl + Enter"));
        assert!(text.contains("max_tokens: unset"));
    }
}
