//! Reserved chat commands
//!
//! A message whose whole text equals one of the reserved strings is a
//! command and never reaches the model. Matching is exact: no trimming, no
//! case folding, no arguments. Anything else, including unknown `/words`,
//! is an ordinary chat message.

use std::fmt;

/// Commands recognized in the chat input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatCommand {
    /// Benchmark the loaded model
    Bench,
    /// Release the loaded context
    Release,
    /// Stop the streaming completion
    Stop,
    /// Start a new conversation
    Reset,
    /// Save the KV cache to the session file
    SaveSession,
    /// Restore the KV cache from the session file
    LoadSession,
}

impl ChatCommand {
    /// Every command, in help order
    pub const ALL: [ChatCommand; 6] = [
        ChatCommand::Bench,
        ChatCommand::Release,
        ChatCommand::Stop,
        ChatCommand::Reset,
        ChatCommand::SaveSession,
        ChatCommand::LoadSession,
    ];

    /// Recognize a command
    ///
    /// # Examples
    ///
    /// ```
    /// use llamachat::commands::special_commands::ChatCommand;
    ///
    /// assert_eq!(ChatCommand::parse("/bench"), Some(ChatCommand::Bench));
    /// assert_eq!(ChatCommand::parse("/bench "), None);
    /// assert_eq!(ChatCommand::parse("/help"), None);
    /// ```
    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cmd| cmd.as_str() == text)
    }

    /// The reserved string
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatCommand::Bench => "/bench",
            ChatCommand::Release => "/release",
            ChatCommand::Stop => "/stop",
            ChatCommand::Reset => "/reset",
            ChatCommand::SaveSession => "/save-session",
            ChatCommand::LoadSession => "/load-session",
        }
    }

    /// One-line help text
    pub fn description(&self) -> &'static str {
        match self {
            ChatCommand::Bench => "to benchmark the model",
            ChatCommand::Release => "release the context",
            ChatCommand::Stop => "stop the current completion",
            ChatCommand::Reset => "reset the conversation",
            ChatCommand::SaveSession => "save the KV cache to the session file",
            ChatCommand::LoadSession => "restore the KV cache from the session file",
        }
    }
}

impl fmt::Display for ChatCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
