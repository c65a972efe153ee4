pub mod conversation;
pub mod identity;
pub mod preferences;
pub mod reply;
pub mod storage;

pub use identity::{IdentitySource, SharedIdentity};
pub use preferences::PreferencesService;
pub use reply::{ReplyError, ReplyProvider};
pub use storage::{MemoryStorage, SqliteStorage, StorageAdapter};
