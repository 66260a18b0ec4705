//! Prompt construction from the message log
//!
//! The prompt is a role-tagged transcript:
//!
//! ```text
//! This is a conversation between user and llama, a friendly chatbot. respond in simple markdown.
//!
//! User: Hi
//! llama: Hello! How can I help?
//! User: Tell me a joke
//! llama:
//! ```
//!
//! Only messages stamped with the active context and the current conversation
//! take part. Notices and non-text messages are skipped.

use crate::message::{Author, ContextId, ConversationId, Message};

/// Framing text placed before the transcript
pub const INITIAL_CHAT_PROMPT: &str =
    "This is a conversation between user and llama, a friendly chatbot. respond in simple markdown.\n\n";

/// Role label for model output
pub const ASSISTANT_LABEL: &str = "llama";

/// Role label for the person chatting
pub const USER_LABEL: &str = "User";

/// Build the transcript prompt for the active context and conversation
///
/// `messages` must be in creation order, oldest first. The result does not
/// include the trailing assistant cue; see [`with_assistant_cue`].
///
/// # Examples
///
/// ```
/// use llamachat::message::{ContextId, ConversationId, Message};
/// use llamachat::prompt::{build_prompt, INITIAL_CHAT_PROMPT};
///
/// let ctx = ContextId::new("ctx1");
/// let conv = ConversationId::default();
/// let messages = vec![Message::user("Hi", Some(ctx.clone()), conv.clone())];
///
/// let prompt = build_prompt(Some(&ctx), &conv, &messages);
/// assert_eq!(prompt, format!("{}User: Hi", INITIAL_CHAT_PROMPT));
/// ```
pub fn build_prompt(
    active_context: Option<&ContextId>,
    conversation_id: &ConversationId,
    messages: &[Message],
) -> String {
    let transcript = messages
        .iter()
        .filter(|msg| is_prompt_eligible(msg, active_context, conversation_id))
        .map(render_line)
        .collect::<Vec<_>>()
        .join("\n");

    format!("{}{}", INITIAL_CHAT_PROMPT, transcript)
}

/// Append the cue that invites the engine to answer as the assistant
///
/// # Examples
///
/// ```
/// use llamachat::prompt::with_assistant_cue;
///
/// assert_eq!(with_assistant_cue("User: Hi".to_string()), "User: Hi\nllama:");
/// ```
pub fn with_assistant_cue(mut prompt: String) -> String {
    prompt.push('\n');
    prompt.push_str(ASSISTANT_LABEL);
    prompt.push(':');
    prompt
}

fn is_prompt_eligible(
    msg: &Message,
    active_context: Option<&ContextId>,
    conversation_id: &ConversationId,
) -> bool {
    let meta = msg.metadata();
    !meta.system
        && meta.conversation_id.as_ref() == Some(conversation_id)
        && meta.context_id.as_ref() == active_context
        && msg.is_text()
}

fn render_line(msg: &Message) -> String {
    let label = match msg.author() {
        Author::System => ASSISTANT_LABEL,
        Author::User => USER_LABEL,
    };
    format!("{}: {}", label, msg.text())
}
