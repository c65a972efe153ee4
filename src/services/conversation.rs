use anyhow::{bail, Result};

use crate::config::TITLE_MAX_CHARS;
use crate::models::{Message, Sender};

/// Derive a conversation title from its first message: the first 30
/// characters, with an ellipsis only when the text was longer.
pub fn derive_title(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

/// Content of the final user message in the log, or empty if there is none.
pub fn last_user_message(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.sender == Sender::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

/// Everything a regeneration needs, computed before any state is touched.
#[derive(Debug, Clone)]
pub struct RegenerationPlan {
    /// The log with the target message and everything after it removed.
    /// Becomes the persisted/visible log and the base the new reply appends to.
    pub truncated: Vec<Message>,
    /// Context passed to the reply operation: everything before the user
    /// message being answered.
    pub history: Vec<Message>,
    /// Content of the nearest preceding user message, sent again verbatim.
    pub user_content: String,
}

/// Plan regeneration of `message_id` within `messages`.
///
/// Returns `Ok(None)` when the id is unknown or does not name an assistant
/// message. Fails when no user message precedes the target, which would break
/// the user-before-assistant ordering invariant.
pub fn plan_regeneration(messages: &[Message], message_id: &str) -> Result<Option<RegenerationPlan>> {
    let Some(target_idx) = messages.iter().position(|m| m.id == message_id) else {
        return Ok(None);
    };
    if messages[target_idx].sender != Sender::Assistant {
        return Ok(None);
    }

    let user_idx = messages[..target_idx]
        .iter()
        .rposition(|m| m.sender == Sender::User);
    let Some(user_idx) = user_idx else {
        bail!("No user message precedes the one being regenerated");
    };

    Ok(Some(RegenerationPlan {
        truncated: messages[..target_idx].to_vec(),
        history: messages[..user_idx].to_vec(),
        user_content: messages[user_idx].content.clone(),
    }))
}
