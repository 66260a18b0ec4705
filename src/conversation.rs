//! Conversation store
//!
//! Holds the ordered message log and the current conversation id. Messages
//! are kept in creation order; display wants newest first, so
//! [`ConversationStore::newest_first`] walks the log backwards.
//!
//! The log is never truncated. Resetting the conversation rotates the id,
//! which leaves older messages visible but unreachable from new prompts.

use crate::message::{ConversationId, Message};

/// Ordered message log plus the active conversation id
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    messages: Vec<Message>,
    conversation_id: ConversationId,
}

impl ConversationStore {
    /// Create an empty store using the default conversation id
    ///
    /// # Examples
    ///
    /// ```
    /// use llamachat::conversation::ConversationStore;
    ///
    /// let store = ConversationStore::new();
    /// assert!(store.is_empty());
    /// assert_eq!(store.conversation_id().as_str(), "default");
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message
    ///
    /// The message becomes the newest entry.
    pub fn insert(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Messages in creation order, oldest first
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages newest first, the order the chat view shows them in
    pub fn newest_first(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().rev()
    }

    /// Most recently inserted message
    pub fn latest(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Number of messages in the log
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Look up a message by id
    pub fn find(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id() == id)
    }

    /// Append a streamed token to the message with `id`
    ///
    /// Returns `false` if no message with that id exists yet.
    pub fn append_token(&mut self, id: &str, token: &str) -> bool {
        match self.messages.iter_mut().find(|m| m.id() == id) {
            Some(message) if message.is_text() => {
                message.append_token(token);
                true
            }
            _ => false,
        }
    }

    /// Stamp a timings summary on the message with `id`
    ///
    /// Returns `false` if no message with that id exists.
    pub fn set_timings(&mut self, id: &str, timings: impl Into<String>) -> bool {
        match self.messages.iter_mut().find(|m| m.id() == id) {
            Some(message) => {
                message.set_timings(timings.into());
                true
            }
            None => false,
        }
    }

    /// Current conversation id
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Start a new logical conversation
    ///
    /// Returns the new id. Existing messages are kept for display.
    pub fn reset_conversation(&mut self) -> ConversationId {
        let mut next = ConversationId::random();
        while next == self.conversation_id {
            next = ConversationId::random();
        }
        tracing::debug!(from = %self.conversation_id, to = %next, "Rotating conversation id");
        self.conversation_id = next.clone();
        next
    }
}
