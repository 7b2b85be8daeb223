//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::CachedResponse;
use crate::net::Response;

/// One entry to be written into a store.
#[derive(Debug, Clone)]
pub struct StoredEntry {
  /// Canonical request identity (SHA-256 of method and URL)
  pub key: String,
  /// Request URL, kept for pattern eviction
  pub url: String,
  pub cached: CachedResponse,
}

/// Trait for cache storage backends.
///
/// Every method is atomic on its own; callers add no locking of their own.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the store if it does not exist yet.
  fn open_store(&self, store: &str) -> Result<()>;

  /// Names of all existing stores.
  fn store_names(&self) -> Result<Vec<String>>;

  /// Drop a store and every entry in it. Returns whether it existed.
  fn delete_store(&self, store: &str) -> Result<bool>;

  fn get_entry(&self, store: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Upsert entries in a single transaction, creating the store if needed.
  fn put_entries(&self, store: &str, entries: &[StoredEntry]) -> Result<()>;

  /// `(key, url)` of every entry in a store.
  fn entry_urls(&self, store: &str) -> Result<Vec<(String, String)>>;

  fn delete_entries(&self, store: &str, keys: &[String]) -> Result<usize>;

  fn count_entries(&self, store: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Volatile storage, used by tests.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-sw").join("cache.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named cache partitions
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Request -> response entries
CREATE TABLE IF NOT EXISTS cache_entries (
    store_name TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (store_name, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_store ON cache_entries(store_name);
"#;

impl CacheStorage for SqliteStorage {
  fn open_store(&self, store: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_stores (name, created_at) VALUES (?, ?)",
        params![store, format_datetime(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to open store {}: {}", store, e))?;
    Ok(())
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn delete_store(&self, store: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE store_name = ?",
      params![store],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", store, e))?;

    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![store])
      .map_err(|e| eyre!("Failed to delete store {}: {}", store, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get_entry(&self, store: &str, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE store_name = ? AND entry_key = ?",
        params![store, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        let response = Response {
          status,
          headers,
          body,
        };
        Ok(Some(CachedResponse::new(
          response,
          parse_datetime(&cached_at)?,
        )))
      }
      None => Ok(None),
    }
  }

  fn put_entries(&self, store: &str, entries: &[StoredEntry]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_stores (name, created_at) VALUES (?, ?)",
      params![store, format_datetime(Utc::now())],
    )
    .map_err(|e| eyre!("Failed to open store {}: {}", store, e))?;

    for entry in entries {
      let response = &entry.cached.response;
      let headers = serde_json::to_string(&response.headers)
        .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO cache_entries
           (store_name, entry_key, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          store,
          entry.key,
          entry.url,
          response.status,
          headers,
          response.body,
          format_datetime(entry.cached.cached_at)
        ],
      )
      .map_err(|e| eyre!("Failed to store entry {}: {}", entry.url, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entry_urls(&self, store: &str) -> Result<Vec<(String, String)>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT entry_key, url FROM cache_entries WHERE store_name = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![store], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to list entries: {}", e))?
      .collect::<rusqlite::Result<Vec<(String, String)>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    Ok(rows)
  }

  fn delete_entries(&self, store: &str, keys: &[String]) -> Result<usize> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let mut removed = 0;
    for key in keys {
      removed += tx
        .execute(
          "DELETE FROM cache_entries WHERE store_name = ? AND entry_key = ?",
          params![store, key],
        )
        .map_err(|e| eyre!("Failed to delete entry: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed)
  }

  fn count_entries(&self, store: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE store_name = ?",
        params![store],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;

    Ok(usize::try_from(count).unwrap_or_default())
  }
}

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
