/// Title given to a conversation before its first message arrives.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Shown in place of an assistant reply when the backend call fails.
pub const REPLY_ERROR_MESSAGE: &str =
    "Sorry, something went wrong while answering. Please try again.";

/// Language tag used when no preference has been stored.
pub const FALLBACK_LANGUAGE: &str = "en";

/// Maximum length, in characters, of a title derived from a first message.
pub const TITLE_MAX_CHARS: usize = 30;
