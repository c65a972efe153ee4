use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::task;

/// Global (not user-scoped) key holding the preferred reply language tag.
pub const PREFERRED_LANGUAGE_KEY: &str = "preferredLanguage";

pub fn conversations_key(user_id: &str) -> String {
    format!("{}_conversations", user_id)
}

pub fn active_conversation_key(user_id: &str) -> String {
    format!("{}_activeConversation", user_id)
}

pub fn messages_key(user_id: &str, conversation_id: &str) -> String {
    format!("{}_messages_{}", user_id, conversation_id)
}

/// Prefix shared by every key belonging to a user; delete-all removes by it.
pub fn user_prefix(user_id: &str) -> String {
    format!("{}_", user_id)
}

/// String-keyed store of JSON values. Implementations only guarantee key
/// stability; all layout conventions live in the key helpers above.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every key starting with `prefix`.
    async fn remove_prefixed(&self, prefix: &str) -> Result<()>;
}

/// In-memory adapter used for testing and as placeholder.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn remove_prefixed(&self, prefix: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

/// Durable adapter over a single SQLite key-value table.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create data directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let storage = SqliteStorage {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory database (used for testing and as placeholder)
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = SqliteStorage {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.clone();
        let key = key.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let raw: Option<String> = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?;
            match raw {
                Some(json) => Ok(Some(
                    serde_json::from_str(&json).context("Failed to parse stored value")?,
                )),
                None => Ok(None),
            }
        })
        .await?
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let json = serde_json::to_string(&value)?;
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![key, json],
            )?;
            Ok(())
        })
        .await?
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await?
    }

    async fn remove_prefixed(&self, prefix: &str) -> Result<()> {
        let conn = self.conn.clone();
        let prefix = prefix.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            // substr comparison avoids LIKE wildcard handling for user ids
            // containing '_' or '%'.
            conn.execute(
                "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
                params![prefix],
            )?;
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn exercise_adapter(storage: &dyn StorageAdapter) {
        assert!(storage.get("missing").await.unwrap().is_none());

        storage.set("u1_conversations", json!([1, 2, 3])).await.unwrap();
        storage.set("u1_activeConversation", json!("c9")).await.unwrap();
        storage.set("u2_conversations", json!([])).await.unwrap();

        assert_eq!(
            storage.get("u1_conversations").await.unwrap(),
            Some(json!([1, 2, 3]))
        );

        storage.set("u1_conversations", json!([4])).await.unwrap();
        assert_eq!(
            storage.get("u1_conversations").await.unwrap(),
            Some(json!([4]))
        );

        storage.remove("u1_activeConversation").await.unwrap();
        assert!(storage.get("u1_activeConversation").await.unwrap().is_none());

        storage.remove_prefixed("u1_").await.unwrap();
        assert!(storage.get("u1_conversations").await.unwrap().is_none());
        assert_eq!(
            storage.get("u2_conversations").await.unwrap(),
            Some(json!([]))
        );
    }

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryStorage::new();
        exercise_adapter(&storage).await;
    }

    #[tokio::test]
    async fn test_sqlite_storage() {
        let storage = SqliteStorage::new_in_memory().unwrap();
        exercise_adapter(&storage).await;
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(conversations_key("u1"), "u1_conversations");
        assert_eq!(active_conversation_key("u1"), "u1_activeConversation");
        assert_eq!(messages_key("u1", "c2"), "u1_messages_c2");
        assert_eq!(user_prefix("u1"), "u1_");
    }
}
