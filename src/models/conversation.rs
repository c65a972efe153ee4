use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DEFAULT_CONVERSATION_TITLE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    /// Last-activity time. Newest-first ordering in the sidebar is a display
    /// convention, not enforced by storage.
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
}

impl Conversation {
    pub fn new(user_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: DEFAULT_CONVERSATION_TITLE.to_string(),
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
        }
    }
}
