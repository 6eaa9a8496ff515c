mod memory;
mod sqlite;
mod storage_trait;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use storage_trait::{Storage, StorageError};
