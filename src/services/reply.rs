use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::Message;

#[derive(Debug, Error)]
pub enum ReplyError {
    /// User-initiated cancellation. Never surfaced as an error.
    #[error("Request cancelled")]
    Cancelled,

    #[error("Reply request failed: {0}")]
    Backend(String),
}

/// External operation that produces an assistant reply.
///
/// `history` is the exchange's notion of prior context: everything before the
/// user message being answered, captured by the controller at call time.
/// The cancellation token is advisory here; the controller treats it as
/// authoritative for its own state regardless of what the provider does.
#[async_trait]
pub trait ReplyProvider: Send + Sync {
    async fn reply(
        &self,
        conversation_id: &str,
        content: &str,
        history: &[Message],
        language: &str,
        cancel: CancellationToken,
    ) -> Result<String, ReplyError>;
}
