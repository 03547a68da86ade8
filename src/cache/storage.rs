//! Cache storage trait and SQLite implementation.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::db;
use crate::error::{OfflineError, Result};
use crate::net::{RequestIdentity, ResponseSnapshot};

use super::traits::{CacheGeneration, CachedResponse};

/// Trait for response cache backends.
///
/// Entries are keyed by `(generation, identity)` and are immutable: a `put`
/// replaces any prior entry wholesale.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the generation if it does not exist yet.
  fn open_generation(&self, generation: &CacheGeneration) -> Result<()>;

  /// Store a response, replacing any prior entry for the identity in that generation.
  fn put(
    &self,
    generation: &CacheGeneration,
    identity: &RequestIdentity,
    response: &ResponseSnapshot,
  ) -> Result<()>;

  /// Store several responses in one transaction.
  fn put_all(
    &self,
    generation: &CacheGeneration,
    entries: &[(RequestIdentity, ResponseSnapshot)],
  ) -> Result<()>;

  fn get(
    &self,
    generation: &CacheGeneration,
    identity: &RequestIdentity,
  ) -> Result<Option<CachedResponse>>;

  /// Every stored generation, in name order.
  fn generations(&self) -> Result<Vec<CacheGeneration>>;

  /// Delete one generation and all of its entries. Returns whether it existed.
  fn delete_generation(&self, generation: &CacheGeneration) -> Result<bool>;

  fn entry_count(&self, generation: &CacheGeneration) -> Result<usize>;
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots (exact body bytes, status, JSON-encoded header list)
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    identity_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, identity_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_generation ON cache_entries(generation);
"#;

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    let conn = db::open_connection(path, CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = db::open_in_memory(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| OfflineError::StoreUnavailable(format!("Lock poisoned: {}", e)))
  }
}

fn insert_entry(
  conn: &Connection,
  generation: &CacheGeneration,
  identity: &RequestIdentity,
  response: &ResponseSnapshot,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)?;
  conn.execute(
    "INSERT OR REPLACE INTO cache_entries
       (generation, identity_hash, method, url, status, headers, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
    params![
      generation.as_str(),
      identity.cache_hash(),
      identity.method,
      identity.url,
      response.status,
      headers,
      response.body,
    ],
  )?;
  Ok(())
}

fn insert_generation(conn: &Connection, generation: &CacheGeneration) -> Result<()> {
  conn.execute(
    "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
    params![generation.as_str()],
  )?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_generation(&self, generation: &CacheGeneration) -> Result<()> {
    let conn = self.lock()?;
    insert_generation(&conn, generation)
  }

  fn put(
    &self,
    generation: &CacheGeneration,
    identity: &RequestIdentity,
    response: &ResponseSnapshot,
  ) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    insert_generation(&tx, generation)?;
    insert_entry(&tx, generation, identity, response)?;
    tx.commit()?;
    Ok(())
  }

  fn put_all(
    &self,
    generation: &CacheGeneration,
    entries: &[(RequestIdentity, ResponseSnapshot)],
  ) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    insert_generation(&tx, generation)?;
    for (identity, response) in entries {
      insert_entry(&tx, generation, identity, response)?;
    }
    tx.commit()?;
    Ok(())
  }

  fn get(
    &self,
    generation: &CacheGeneration,
    identity: &RequestIdentity,
  ) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE generation = ? AND identity_hash = ?",
        params![generation.as_str(), identity.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body, cached_at)) => Ok(Some(CachedResponse {
        generation: generation.clone(),
        response: ResponseSnapshot {
          status,
          headers: serde_json::from_str(&headers)?,
          body,
        },
        cached_at: db::parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn generations(&self) -> Result<Vec<CacheGeneration>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT name FROM cache_generations
       UNION SELECT DISTINCT generation FROM cache_entries
       ORDER BY 1",
    )?;
    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.into_iter().map(CacheGeneration::new).collect())
  }

  fn delete_generation(&self, generation: &CacheGeneration) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let entries = tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![generation.as_str()],
    )?;
    let gens = tx.execute(
      "DELETE FROM cache_generations WHERE name = ?",
      params![generation.as_str()],
    )?;
    tx.commit()?;
    Ok(entries > 0 || gens > 0)
  }

  fn entry_count(&self, generation: &CacheGeneration) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM cache_entries WHERE generation = ?",
      params![generation.as_str()],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

/// In-memory cache storage for tests and ephemeral hosts. Clones share entries.
#[derive(Default, Clone)]
pub struct MemoryStorage {
  generations: Arc<Mutex<BTreeMap<CacheGeneration, HashMap<String, CachedResponse>>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(
    &self,
  ) -> Result<std::sync::MutexGuard<'_, BTreeMap<CacheGeneration, HashMap<String, CachedResponse>>>>
  {
    self
      .generations
      .lock()
      .map_err(|e| OfflineError::StoreUnavailable(format!("Lock poisoned: {}", e)))
  }
}

impl CacheStorage for MemoryStorage {
  fn open_generation(&self, generation: &CacheGeneration) -> Result<()> {
    self.lock()?.entry(generation.clone()).or_default();
    Ok(())
  }

  fn put(
    &self,
    generation: &CacheGeneration,
    identity: &RequestIdentity,
    response: &ResponseSnapshot,
  ) -> Result<()> {
    self.put_all(generation, &[(identity.clone(), response.clone())])
  }

  fn put_all(
    &self,
    generation: &CacheGeneration,
    entries: &[(RequestIdentity, ResponseSnapshot)],
  ) -> Result<()> {
    let mut generations = self.lock()?;
    let bucket = generations.entry(generation.clone()).or_default();
    for (identity, response) in entries {
      bucket.insert(
        identity.cache_hash(),
        CachedResponse {
          generation: generation.clone(),
          response: response.clone(),
          cached_at: Utc::now(),
        },
      );
    }
    Ok(())
  }

  fn get(
    &self,
    generation: &CacheGeneration,
    identity: &RequestIdentity,
  ) -> Result<Option<CachedResponse>> {
    Ok(
      self
        .lock()?
        .get(generation)
        .and_then(|bucket| bucket.get(&identity.cache_hash()))
        .cloned(),
    )
  }

  fn generations(&self) -> Result<Vec<CacheGeneration>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn delete_generation(&self, generation: &CacheGeneration) -> Result<bool> {
    Ok(self.lock()?.remove(generation).is_some())
  }

  fn entry_count(&self, generation: &CacheGeneration) -> Result<usize> {
    Ok(self.lock()?.get(generation).map_or(0, HashMap::len))
  }
}
