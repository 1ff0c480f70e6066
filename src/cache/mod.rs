//! Versioned static-asset caching: whole-version population and replacement,
//! no per-entry eviction policy.

mod manager;
mod storage;

pub use manager::CacheManager;
pub use storage::{CacheStorage, SqliteStorage};
