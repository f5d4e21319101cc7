//! Slash command parsing for the chat application.
//!
//! This module handles parsing of special commands that start with `/`,
//! allowing users to manage sessions and preferences without sending
//! messages to the backend.

/// A parsed chat command.
///
/// These commands control the session store and are not sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Start a new session.
    New,

    /// Delete a session.  `None` deletes the current one.
    Delete(Option<usize>),

    /// Switch to the session at this index.
    Select(usize),

    /// List sessions.
    Sessions,

    /// Print the transcript of the current session.
    History,

    /// Show the current configuration.
    ShowConfig,

    /// Set the number of history messages per turn.
    SetHistory(i32),

    /// Set the summarization threshold.
    SetCompress(usize),

    /// Restore default preferences.
    ResetConfig,

    /// Name and compress the current session now.
    Summarize,

    /// Forget all sessions and preferences.
    ClearAll,

    /// Display help information.
    Help,

    /// Exit the chat application.
    Quit,

    /// Report a parsing error back to the caller.
    Invalid(String),
}

/// Parses user input for slash commands.
///
/// Returns `Some(ChatCommand)` if the input is a valid command,
/// or `None` if it should be treated as a regular message.
///
/// # Examples
///
/// ```
/// # use parley::chat::parse_command;
/// assert!(parse_command("/quit").is_some());
/// assert!(parse_command("/select 2").is_some());
/// assert!(parse_command("Hello there").is_none());
/// ```
pub fn parse_command(input: &str) -> Option<ChatCommand> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, ' ');
    let command = parts.next()?.to_lowercase();
    let argument = parts.next().map(|s| s.trim()).filter(|s| !s.is_empty());

    let result = match command.as_str() {
        "new" => ChatCommand::New,
        "delete" | "rm" => match argument {
            None => ChatCommand::Delete(None),
            Some(arg) => match arg.parse::<usize>() {
                Ok(index) => ChatCommand::Delete(Some(index)),
                Err(_) => ChatCommand::Invalid("/delete expects a session number".to_string()),
            },
        },
        "select" | "switch" => match argument {
            Some(arg) => match arg.parse::<usize>() {
                Ok(index) => ChatCommand::Select(index),
                Err(_) => ChatCommand::Invalid("/select expects a session number".to_string()),
            },
            None => ChatCommand::Invalid("/select requires a session number".to_string()),
        },
        "sessions" | "ls" => ChatCommand::Sessions,
        "history" => ChatCommand::History,
        "config" => ChatCommand::ShowConfig,
        "set" => parse_set_command(argument),
        "reset-config" => ChatCommand::ResetConfig,
        "summarize" => ChatCommand::Summarize,
        "clear-all" => ChatCommand::ClearAll,
        "help" | "?" => ChatCommand::Help,
        "quit" | "exit" | "q" => ChatCommand::Quit,
        _ => ChatCommand::Invalid(format!("Unknown command: /{}", command)),
    };

    Some(result)
}

fn parse_set_command(argument: Option<&str>) -> ChatCommand {
    let Some(arg) = argument else {
        return ChatCommand::Invalid(
            "/set requires 'history <n>' or 'compress <chars>'".to_string(),
        );
    };

    let mut parts = arg.splitn(2, ' ');
    let key = parts.next().unwrap_or_default().to_lowercase();
    let value = parts.next().map(|s| s.trim()).filter(|s| !s.is_empty());
    match key.as_str() {
        "history" => match value.map(str::parse::<i32>) {
            Some(Ok(n)) => ChatCommand::SetHistory(n),
            Some(Err(_)) => ChatCommand::Invalid("/set history expects an integer".to_string()),
            None => ChatCommand::Invalid("/set history requires a value".to_string()),
        },
        "compress" => match value.map(str::parse::<usize>) {
            Some(Ok(n)) => ChatCommand::SetCompress(n),
            Some(Err(_)) => {
                ChatCommand::Invalid("/set compress expects a character count".to_string())
            }
            None => ChatCommand::Invalid("/set compress requires a value".to_string()),
        },
        _ => ChatCommand::Invalid("Unrecognized /set key (use history or compress)".to_string()),
    }
}

/// Returns help text describing available commands.
pub fn help_text() -> &'static str {
    r#"Available commands:
  /new                   Start a new session
  /delete [n]            Delete session n (default: the current one)
  /select <n>            Switch to session n
  /sessions              List sessions
  /history               Show the current transcript
  /config                Show current configuration
  /set history <n>       Messages of history per turn (2-25, negative for all)
  /set compress <chars>  Summarize above this many characters (500-4000)
  /reset-config          Restore default configuration
  /summarize             Name and compress the current session now
  /clear-all             Forget all sessions and preferences
  /help                  Show this help message
  /quit                  Exit the chat

Press Ctrl-C while a reply is streaming to cancel it."#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_quit_commands() {
        assert_eq!(parse_command("/quit"), Some(ChatCommand::Quit));
        assert_eq!(parse_command("/exit"), Some(ChatCommand::Quit));
        assert_eq!(parse_command("/q"), Some(ChatCommand::Quit));
        assert_eq!(parse_command("  /quit  "), Some(ChatCommand::Quit));
    }

    #[test]
    fn parse_session_commands() {
        assert_eq!(parse_command("/new"), Some(ChatCommand::New));
        assert_eq!(parse_command("/NEW"), Some(ChatCommand::New));
        assert_eq!(parse_command("/delete"), Some(ChatCommand::Delete(None)));
        assert_eq!(parse_command("/delete 2"), Some(ChatCommand::Delete(Some(2))));
        assert_eq!(parse_command("/select 1"), Some(ChatCommand::Select(1)));
        assert_eq!(parse_command("/sessions"), Some(ChatCommand::Sessions));
        assert_eq!(parse_command("/history"), Some(ChatCommand::History));
        assert!(matches!(
            parse_command("/select"),
            Some(ChatCommand::Invalid(msg)) if msg.contains("requires")
        ));
        assert!(matches!(
            parse_command("/delete two"),
            Some(ChatCommand::Invalid(msg)) if msg.contains("expects")
        ));
    }

    #[test]
    fn parse_set_commands() {
        assert_eq!(
            parse_command("/set history 8"),
            Some(ChatCommand::SetHistory(8))
        );
        assert_eq!(
            parse_command("/set history -1"),
            Some(ChatCommand::SetHistory(-1))
        );
        assert_eq!(
            parse_command("/set compress 2000"),
            Some(ChatCommand::SetCompress(2000))
        );
        assert!(matches!(
            parse_command("/set"),
            Some(ChatCommand::Invalid(msg)) if msg.contains("requires")
        ));
        assert!(matches!(
            parse_command("/set compress -5"),
            Some(ChatCommand::Invalid(msg)) if msg.contains("expects")
        ));
        assert!(matches!(
            parse_command("/set theme dark"),
            Some(ChatCommand::Invalid(msg)) if msg.contains("Unrecognized")
        ));
    }

    #[test]
    fn parse_store_commands() {
        assert_eq!(parse_command("/config"), Some(ChatCommand::ShowConfig));
        assert_eq!(parse_command("/reset-config"), Some(ChatCommand::ResetConfig));
        assert_eq!(parse_command("/summarize"), Some(ChatCommand::Summarize));
        assert_eq!(parse_command("/clear-all"), Some(ChatCommand::ClearAll));
        assert_eq!(
            parse_command("/bogus"),
            Some(ChatCommand::Invalid("Unknown command: /bogus".to_string()))
        );
    }

    #[test]
    fn non_commands() {
        assert_eq!(parse_command("Hello there"), None);
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("  "), None);
    }

    #[test]
    fn help_text_not_empty() {
        let help = help_text();
        assert!(help.contains("/quit"));
        assert!(help.contains("/new"));
        assert!(help.contains("/set history"));
        assert!(help.contains("/clear-all"));
    }
}
