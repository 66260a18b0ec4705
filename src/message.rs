//! Message model for the chat log
//!
//! A [`Message`] is one conversational turn. Its body is a tagged union with a
//! single text variant today, and its metadata is a fixed record of optional
//! fields. The context and conversation stamps are written once at creation
//! and are read-only afterwards, which is what lets the prompt builder drop
//! messages that belong to an older model or an older conversation.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Conversation id every process starts with
pub const DEFAULT_CONVERSATION_ID: &str = "default";

const RAND_ID_LEN: usize = 9;
const RAND_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a short random base-36 identifier
///
/// # Examples
///
/// ```
/// use llamachat::message::rand_id;
///
/// let id = rand_id();
/// assert_eq!(id.len(), 9);
/// assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
/// ```
pub fn rand_id() -> String {
    let mut rng = rand::rng();
    (0..RAND_ID_LEN)
        .map(|_| RAND_ID_ALPHABET[rng.random_range(0..RAND_ID_ALPHABET.len())] as char)
        .collect()
}

/// Identity of an inference context
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(String);

impl ContextId {
    /// Wrap an engine-assigned context identity
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identity string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scoping token that partitions the log into separate dialogues
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    /// Wrap an existing conversation id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random conversation id
    pub fn random() -> Self {
        Self(rand_id())
    }

    /// The raw id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self(DEFAULT_CONVERSATION_ID.to_string())
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Author of a message
///
/// `System` is the pseudo-author used for both model output and notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    /// The person typing into the chat
    User,
    /// Model output and system notices
    System,
}

/// Message content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageBody {
    /// Plain UTF-8 text
    Text {
        /// The text content
        text: String,
    },
}

/// Optional per-message attributes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Marks a non-conversational notice
    #[serde(default)]
    pub system: bool,
    /// Context active when the message was created or streamed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
    /// Conversation the message belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Post-hoc performance summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timings: Option<String>,
    /// UI hint that the text is worth copying verbatim
    #[serde(default)]
    pub copyable: bool,
}

/// One conversational turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    author: Author,
    created_at: DateTime<Utc>,
    body: MessageBody,
    metadata: MessageMetadata,
}

impl Message {
    /// Create a message with an explicit id and creation time
    ///
    /// Used by the completion controller, which pre-generates the id of the
    /// reply before the first token arrives.
    pub fn with_id(
        id: impl Into<String>,
        author: Author,
        created_at: DateTime<Utc>,
        text: impl Into<String>,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            id: id.into(),
            author,
            created_at,
            body: MessageBody::Text { text: text.into() },
            metadata,
        }
    }

    /// Create a user message stamped with the active context and conversation
    ///
    /// # Examples
    ///
    /// ```
    /// use llamachat::message::{Author, ContextId, ConversationId, Message};
    ///
    /// let msg = Message::user("Hi", Some(ContextId::new("ctx1")), ConversationId::default());
    /// assert_eq!(msg.author(), Author::User);
    /// assert_eq!(msg.text(), "Hi");
    /// assert_eq!(msg.metadata().context_id, Some(ContextId::new("ctx1")));
    /// ```
    pub fn user(
        text: impl Into<String>,
        context_id: Option<ContextId>,
        conversation_id: ConversationId,
    ) -> Self {
        Self::with_id(
            new_message_id(),
            Author::User,
            Utc::now(),
            text,
            MessageMetadata {
                context_id,
                conversation_id: Some(conversation_id),
                ..MessageMetadata::default()
            },
        )
    }

    /// Create a system notice
    ///
    /// # Examples
    ///
    /// ```
    /// use llamachat::message::Message;
    ///
    /// let notice = Message::notice("Context released!");
    /// assert!(notice.is_notice());
    /// ```
    pub fn notice(text: impl Into<String>) -> Self {
        Self::notice_with(text, false)
    }

    /// Create a system notice, optionally flagged as copyable
    pub fn notice_with(text: impl Into<String>, copyable: bool) -> Self {
        Self::with_id(
            new_message_id(),
            Author::System,
            Utc::now(),
            text,
            MessageMetadata {
                system: true,
                copyable,
                ..MessageMetadata::default()
            },
        )
    }

    /// Unique message id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Message author
    pub fn author(&self) -> Author {
        self.author
    }

    /// Creation timestamp
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Message body
    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// Text content
    pub fn text(&self) -> &str {
        match &self.body {
            MessageBody::Text { text } => text,
        }
    }

    /// Metadata record
    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    /// Whether this is a system notice rather than a conversational turn
    pub fn is_notice(&self) -> bool {
        self.metadata.system
    }

    /// Whether the body is plain text
    pub fn is_text(&self) -> bool {
        matches!(self.body, MessageBody::Text { .. })
    }

    /// Append a streamed token and strip leading whitespace
    ///
    /// Stripping on every update is idempotent: once the leading whitespace is
    /// gone it cannot come back, and non-whitespace text is never removed.
    pub(crate) fn append_token(&mut self, token: &str) {
        match &mut self.body {
            MessageBody::Text { text } => {
                text.push_str(token);
                let stripped = text.len() - text.trim_start().len();
                if stripped > 0 {
                    text.drain(..stripped);
                }
            }
        }
    }

    pub(crate) fn set_timings(&mut self, timings: String) {
        self.metadata.timings = Some(timings);
    }
}

/// Generate a never-reused message id
pub fn new_message_id() -> String {
    ulid::Ulid::new().to_string()
}
