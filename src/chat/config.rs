//! Configuration types for the chat application.
//!
//! This module provides CLI argument parsing via `arrrg` and the user preference record
//! consumed by the session store.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use arrrg_derive::CommandLine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of trailing messages sent with each turn.
const DEFAULT_HISTORY_MESSAGE_COUNT: i32 = 4;

/// Default transcript length, in characters, above which the session is summarized.
const DEFAULT_COMPRESS_THRESHOLD: usize = 1000;

/// Range accepted for `history_message_count` when it is not negative.
const HISTORY_RANGE: (i32, i32) = (2, 25);

/// Range accepted for `compress_message_length_threshold`.
const COMPRESS_RANGE: (usize, usize) = (500, 4000);

/// Command-line arguments for the parley-chat tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct ChatArgs {
    /// Base URL of the chat backend.
    #[arrrg(optional, "Backend base URL (default: http://localhost:8000/api/)", "URL")]
    pub base_url: Option<String>,

    /// Deadline for each turn, in seconds.
    #[arrrg(optional, "Turn timeout in seconds (default: 30)", "SECS")]
    pub timeout_secs: Option<u64>,

    /// Directory where the session snapshot is kept.
    #[arrrg(optional, "Directory for saved sessions", "DIR")]
    pub state_dir: Option<String>,

    /// Number of trailing messages sent with each turn.
    #[arrrg(optional, "Messages of history per turn (default: 4, negative for all)", "N")]
    pub history: Option<i32>,

    /// Summarization threshold in characters.
    #[arrrg(optional, "Summarize above this many characters (default: 1000)", "CHARS")]
    pub compress_threshold: Option<usize>,

    /// Disable ANSI colors and styles.
    #[arrrg(flag, "Disable ANSI colors/styles")]
    pub no_color: bool,
}

impl ChatArgs {
    /// The turn deadline requested on the command line, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// The snapshot directory requested on the command line, if any.
    pub fn state_dir(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(PathBuf::from)
    }

    /// Returns true if any preference was given on the command line.
    pub fn overrides_config(&self) -> bool {
        self.history.is_some() || self.compress_threshold.is_some()
    }

    /// Overwrites the preferences given on the command line.
    pub fn apply_to(&self, config: &mut ChatConfig) {
        if let Some(history) = self.history {
            config.history_message_count = history;
        }
        if let Some(threshold) = self.compress_threshold {
            config.compress_message_length_threshold = threshold;
        }
    }
}

/// Key chord that submits the input box.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitKey {
    /// Enter alone.
    Enter,
    /// Ctrl + Enter.
    #[default]
    CtrlEnter,
    /// Shift + Enter.
    ShiftEnter,
    /// Alt + Enter.
    AltEnter,
}

impl fmt::Display for SubmitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitKey::Enter => write!(f, "Enter"),
            SubmitKey::CtrlEnter => write!(f, "Ctrl + Enter"),
            SubmitKey::ShiftEnter => write!(f, "Shift + Enter"),
            SubmitKey::AltEnter => write!(f, "Alt + Enter"),
        }
    }
}

/// Color theme.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    /// Follow the system setting.
    #[default]
    Auto,
    /// Dark theme.
    Dark,
    /// Light theme.
    Light,
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Theme::Auto => write!(f, "auto"),
            Theme::Dark => write!(f, "dark"),
            Theme::Light => write!(f, "light"),
        }
    }
}

impl FromStr for Theme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Theme::Auto),
            "dark" => Ok(Theme::Dark),
            "light" => Ok(Theme::Light),
            _ => Err(Error::validation(
                format!("unknown theme {s:?}"),
                Some("theme".to_string()),
            )),
        }
    }
}

/// User preferences consumed by the session store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Preferred cap on reply length.  Kept with the preferences and shown by `/config`; the
    /// chat request does not carry it.
    pub max_tokens: Option<u32>,

    /// Number of trailing messages in the context window; negative means all of them.
    pub history_message_count: i32,

    /// Transcript length, in characters, above which the session is summarized.
    pub compress_message_length_threshold: usize,

    /// Whether assistant messages are part of the context window.
    pub send_bot_messages: bool,

    /// Key chord that submits input.
    pub submit_key: SubmitKey,

    /// Avatar code point for the user.
    pub avatar: String,

    /// Color theme.
    pub theme: Theme,

    /// Whether the UI uses a borderless layout.
    pub tight_border: bool,
}

impl ChatConfig {
    /// Creates a new ChatConfig with default values.
    ///
    /// Defaults:
    /// - History: 4 messages
    /// - Compression threshold: 1000 characters
    /// - Bot messages: sent
    /// - Submit key: Ctrl + Enter
    pub fn new() -> Self {
        Self {
            max_tokens: None,
            history_message_count: DEFAULT_HISTORY_MESSAGE_COUNT,
            compress_message_length_threshold: DEFAULT_COMPRESS_THRESHOLD,
            send_bot_messages: true,
            submit_key: SubmitKey::CtrlEnter,
            avatar: "1f603".to_string(),
            theme: Theme::Auto,
            tight_border: false,
        }
    }

    /// Sets the number of history messages per turn.
    pub fn with_history_message_count(mut self, count: i32) -> Self {
        self.history_message_count = count;
        self
    }

    /// Sets the summarization threshold.
    pub fn with_compress_threshold(mut self, threshold: usize) -> Self {
        self.compress_message_length_threshold = threshold;
        self
    }

    /// Sets whether assistant messages are sent.
    pub fn with_send_bot_messages(mut self, send: bool) -> Self {
        self.send_bot_messages = send;
        self
    }

    /// Checks the numeric ranges enforced by the settings surface.
    pub fn validate(&self) -> Result<()> {
        let (min, max) = HISTORY_RANGE;
        if self.history_message_count >= 0
            && !is_valid_number(self.history_message_count, min, max)
        {
            return Err(Error::validation(
                format!("history must be between {min} and {max}, or negative for all"),
                Some("history_message_count".to_string()),
            ));
        }
        let (min, max) = COMPRESS_RANGE;
        if !is_valid_number(self.compress_message_length_threshold, min, max) {
            return Err(Error::validation(
                format!("compression threshold must be between {min} and {max}"),
                Some("compress_message_length_threshold".to_string()),
            ));
        }
        Ok(())
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&ChatArgs> for ChatConfig {
    fn from(args: &ChatArgs) -> Self {
        let mut config = ChatConfig::new();
        args.apply_to(&mut config);
        config
    }
}

/// Returns true if `x` lies within `[min, max]`.
pub fn is_valid_number<T: PartialOrd>(x: T, min: T, max: T) -> bool {
    x >= min && x <= max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ChatConfig::new();
        assert_eq!(config.history_message_count, 4);
        assert_eq!(config.compress_message_length_threshold, 1000);
        assert!(config.send_bot_messages);
        assert_eq!(config.submit_key, SubmitKey::CtrlEnter);
        assert_eq!(config.avatar, "1f603");
        assert_eq!(config.theme, Theme::Auto);
        assert!(!config.tight_border);
        assert!(config.max_tokens.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_args() {
        let args = ChatArgs {
            history: Some(-1),
            compress_threshold: Some(2000),
            ..ChatArgs::default()
        };
        let config = ChatConfig::from(&args);
        assert_eq!(config.history_message_count, -1);
        assert_eq!(config.compress_message_length_threshold, 2000);
        assert!(config.validate().is_ok());

        assert!(args.overrides_config());

        let config = ChatConfig::from(&ChatArgs::default());
        assert_eq!(config, ChatConfig::new());
        assert!(!ChatArgs::default().overrides_config());
    }

    #[test]
    fn validate_ranges() {
        assert!(ChatConfig::new().with_history_message_count(1).validate().is_err());
        assert!(ChatConfig::new().with_history_message_count(26).validate().is_err());
        assert!(ChatConfig::new().with_history_message_count(25).validate().is_ok());
        assert!(ChatConfig::new().with_history_message_count(-1).validate().is_ok());
        let err = ChatConfig::new()
            .with_compress_threshold(100)
            .validate()
            .unwrap_err();
        assert!(err.is_validation());
        assert!(ChatConfig::new().with_compress_threshold(4000).validate().is_ok());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: ChatConfig =
            serde_json::from_str(r#"{"history_message_count": 10, "theme": "dark"}"#).unwrap();
        assert_eq!(config.history_message_count, 10);
        assert_eq!(config.theme, Theme::Dark);
        assert_eq!(config.compress_message_length_threshold, 1000);
    }

    #[test]
    fn theme_parsing() {
        assert_eq!("Dark".parse::<Theme>().unwrap(), Theme::Dark);
        assert!("neon".parse::<Theme>().is_err());
        assert_eq!(SubmitKey::CtrlEnter.to_string(), "Ctrl + Enter");
    }
}
