//! Cache storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::gateway::types::Response;

/// Trait for versioned cache storage backends.
///
/// A "store" is a named collection of request-key → response entries. Stores
/// exist implicitly: writing the first entry creates one, deleting all
/// entries removes it.
pub trait CacheStorage: Send + Sync {
  /// Names of every store currently present.
  fn list_stores(&self) -> Result<Vec<String>>;

  /// Remove a store and all its entries.
  fn delete_store(&self, name: &str) -> Result<()>;

  /// Look up one entry. Read-only.
  fn get(&self, store: &str, key: &str) -> Result<Option<Response>>;

  /// Write or overwrite one entry.
  fn put(&self, store: &str, key: &str, response: &Response) -> Result<()>;

  /// Number of entries in a store.
  fn entry_count(&self, store: &str) -> Result<u64>;
}

/// SQLite-backed cache storage. All versioned stores share one database
/// file, keyed by store name.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open the storage at an explicit path, creating parent directories.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// In-memory storage, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offsync").join("caches.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for the versioned cache stores.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    store_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    response BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store_name, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_store ON cache_entries(store_name);
"#;

impl CacheStorage for SqliteStorage {
  fn list_stores(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT store_name FROM cache_entries ORDER BY store_name")
      .map_err(|e| eyre!("Failed to prepare store listing: {}", e))?;

    let stores = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<std::result::Result<Vec<String>, _>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(stores)
  }

  fn delete_store(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM cache_entries WHERE store_name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete store {}: {}", name, e))?;

    Ok(())
  }

  fn get(&self, store: &str, key: &str) -> Result<Option<Response>> {
    let conn = self.lock()?;

    let blob: Option<Vec<u8>> = conn
      .query_row(
        "SELECT response FROM cache_entries WHERE store_name = ? AND request_key = ?",
        params![store, key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    match blob {
      Some(data) => {
        let response = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize cached response: {}", e))?;
        Ok(Some(response))
      }
      None => Ok(None),
    }
  }

  fn put(&self, store: &str, key: &str, response: &Response) -> Result<()> {
    let conn = self.lock()?;

    let data =
      serde_json::to_vec(response).map_err(|e| eyre!("Failed to serialize response: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (store_name, request_key, response, cached_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![store, key, data],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn entry_count(&self, store: &str) -> Result<u64> {
    let conn = self.lock()?;

    let count: u64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE store_name = ?",
        params![store],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;

    Ok(count)
  }
}
