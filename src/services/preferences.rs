use anyhow::Result;
use serde_json::json;

use crate::config::FALLBACK_LANGUAGE;
use crate::services::storage::{StorageAdapter, PREFERRED_LANGUAGE_KEY};

/// Read/write access to the global language preference.
pub struct PreferencesService;

impl PreferencesService {
    /// The preferred reply language, falling back to the default tag when the
    /// key is absent or unreadable.
    pub async fn preferred_language(storage: &dyn StorageAdapter) -> String {
        match storage.get(PREFERRED_LANGUAGE_KEY).await {
            Ok(Some(value)) => serde_json::from_value(value)
                .unwrap_or_else(|_| FALLBACK_LANGUAGE.to_string()),
            Ok(None) => FALLBACK_LANGUAGE.to_string(),
            Err(e) => {
                tracing::warn!("Failed to read language preference: {}", e);
                FALLBACK_LANGUAGE.to_string()
            }
        }
    }

    pub async fn set_preferred_language(storage: &dyn StorageAdapter, tag: &str) -> Result<()> {
        storage.set(PREFERRED_LANGUAGE_KEY, json!(tag)).await
    }
}
