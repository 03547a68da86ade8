//! Durable store: the `kv` map and the append-ordered `queue`.

pub mod schema;
mod store;

pub use store::{DurableStore, MemoryStore, NewQueueItem, QueueItem, SqliteStore, StoredQueueItem};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

use crate::error::{OfflineError, Result};

/// Open or create a SQLite database at `path` and apply `schema`.
pub fn open_connection(path: &Path, schema: &str) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).map_err(|e| {
      OfflineError::StoreUnavailable(format!("Failed to create database directory: {}", e))
    })?;
  }

  let conn = Connection::open(path).map_err(|e| {
    OfflineError::StoreUnavailable(format!("Failed to open database at {}: {}", path.display(), e))
  })?;

  // Concurrent readers from other processes (the CLI host may overlap with itself)
  conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
  conn.busy_timeout(std::time::Duration::from_secs(5))?;

  run_migrations(&conn, schema)?;
  Ok(conn)
}

/// In-memory SQLite database with `schema` applied.
pub fn open_in_memory(schema: &str) -> Result<Connection> {
  let conn = Connection::open_in_memory()?;
  run_migrations(&conn, schema)?;
  Ok(conn)
}

fn run_migrations(conn: &Connection, schema: &str) -> Result<()> {
  conn
    .execute_batch(schema)
    .map_err(|e| OfflineError::StoreUnavailable(format!("Failed to run migrations: {}", e)))
}

/// Run a synchronous store call on the blocking pool so async callers yield
/// instead of holding a runtime thread while SQLite works.
pub async fn blocking<S, T, F>(store: &Arc<S>, f: F) -> Result<T>
where
  S: ?Sized + Send + Sync + 'static,
  T: Send + 'static,
  F: FnOnce(&S) -> Result<T> + Send + 'static,
{
  let store = Arc::clone(store);
  tokio::task::spawn_blocking(move || f(&store)).await?
}

/// Parse a datetime string from SQLite format.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| OfflineError::StoreUnavailable(format!("Failed to parse datetime '{}': {}", s, e)))
}
