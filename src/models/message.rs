use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted lowercase: "user" / "assistant".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

/// User rating on an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Positive,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    /// Language tag the reply was generated in. Assistant messages only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    #[serde(default)]
    pub is_error: bool,
}

impl Message {
    pub fn user(content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            sender: Sender::User,
            timestamp: Utc::now(),
            language: None,
            feedback: None,
            is_error: false,
        }
    }

    pub fn assistant(content: &str, language: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            sender: Sender::Assistant,
            timestamp: Utc::now(),
            language: Some(language.to_string()),
            feedback: None,
            is_error: false,
        }
    }

    /// Synthetic assistant message recorded when a reply request fails.
    pub fn error(content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            sender: Sender::Assistant,
            timestamp: Utc::now(),
            language: None,
            feedback: None,
            is_error: true,
        }
    }
}
