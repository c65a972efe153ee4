//! Conversation and message state controller for an interactive AI chat
//! client: conversation set, per-conversation message logs, in-flight reply
//! requests with cooperative cancellation, and mirroring of it all into a
//! per-user key-value store.
//!
//! Rendering, authentication, the reply backend, and raw persistence are
//! external collaborators, injected through the traits in [`services`].

pub mod config;
pub mod controller;
pub mod models;
pub mod services;

pub use controller::ChatController;
pub use models::{Conversation, Feedback, Message, Sender};
pub use services::identity::{IdentitySource, SharedIdentity};
pub use services::reply::{ReplyError, ReplyProvider};
pub use services::storage::{MemoryStorage, SqliteStorage, StorageAdapter};
