//! Durable key-value store for failed write payloads.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Process-wide counter appended to queue keys so rapid enqueues within the
/// same millisecond still get distinct keys.
static KEY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a fresh queue key: `req-<millis>-<counter>`.
pub fn next_key() -> String {
  let millis = Utc::now().timestamp_millis();
  let counter = KEY_COUNTER.fetch_add(1, Ordering::Relaxed);
  format!("req-{}-{}", millis, counter)
}

/// Durable store for queued request payloads.
///
/// Lives in its own database file, independent of the versioned caches, so
/// cache rotation can never touch queued data.
pub struct QueueStore {
  conn: Mutex<Connection>,
}

impl QueueStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open the store at an explicit path, creating parent directories.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// In-memory store, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offsync").join("queue.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Insert or overwrite a payload under the given key.
  pub fn put(&self, key: &str, payload: &[u8]) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO request_queue (key, payload, enqueued_at) VALUES (?, ?, ?)",
        params![key, payload, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to enqueue payload: {}", e))?;

    Ok(())
  }

  /// Read a payload back, if present.
  pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self.lock()?;

    let payload = conn
      .query_row(
        "SELECT payload FROM request_queue WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read queued payload: {}", e))?;

    Ok(payload)
  }

  /// Remove a key. Removing an absent key is not an error.
  pub fn delete(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM request_queue WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete queued payload: {}", e))?;

    Ok(())
  }

  /// All currently stored keys, in storage-native order.
  pub fn list_keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT key FROM request_queue")
      .map_err(|e| eyre!("Failed to prepare key listing: {}", e))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list queue keys: {}", e))?
      .collect::<std::result::Result<Vec<String>, _>>()
      .map_err(|e| eyre!("Failed to read queue key: {}", e))?;

    Ok(keys)
  }
}

#[cfg(test)]
impl QueueStore {
  /// Drop the backing table so every subsequent operation fails.
  pub(crate) fn break_storage(&self) {
    let conn = self.conn.lock().unwrap();
    conn.execute_batch("DROP TABLE request_queue").unwrap();
  }
}

/// Schema for the retry queue. A single unordered table of opaque keys;
/// created fresh if absent, no schema versioning.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS request_queue (
    key TEXT PRIMARY KEY,
    payload BLOB NOT NULL,
    enqueued_at TEXT NOT NULL
);
"#;
