//! Durable store trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{OfflineError, Result};
use crate::net::Headers;

use super::schema::SCHEMA;

/// A mutating request waiting to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQueueItem {
  pub url: String,
  pub method: String,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
}

/// A queue row exactly as persisted. Fields may be missing on rows that were
/// written by an older build or damaged on disk.
#[derive(Debug, Clone)]
pub struct StoredQueueItem {
  pub sequence: i64,
  pub url: Option<String>,
  pub method: Option<String>,
  /// JSON-encoded ordered header list
  pub headers: Option<String>,
  pub body: Option<Vec<u8>>,
  pub enqueued_at: DateTime<Utc>,
}

/// A validated queue item ready for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
  pub sequence: i64,
  pub url: String,
  pub method: String,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
  pub enqueued_at: DateTime<Utc>,
}

impl TryFrom<StoredQueueItem> for QueueItem {
  type Error = OfflineError;

  fn try_from(stored: StoredQueueItem) -> Result<Self> {
    let malformed = |reason: &str| OfflineError::MalformedQueueItem {
      sequence: stored.sequence,
      reason: reason.to_string(),
    };

    let url = stored
      .url
      .clone()
      .filter(|u| !u.trim().is_empty())
      .ok_or_else(|| malformed("missing url"))?;
    let method = stored
      .method
      .clone()
      .filter(|m| !m.trim().is_empty())
      .ok_or_else(|| malformed("missing method"))?;
    let headers = match stored.headers.as_deref() {
      None | Some("") => Vec::new(),
      Some(raw) => serde_json::from_str(raw).map_err(|_| malformed("unreadable headers"))?,
    };

    Ok(Self {
      sequence: stored.sequence,
      url,
      method,
      headers,
      body: stored.body,
      enqueued_at: stored.enqueued_at,
    })
  }
}

/// Transactional key/value + queue persistence.
///
/// `queue_append` must assign sequences atomically with respect to concurrent
/// callers. `queue_items` returns rows in ascending sequence order.
pub trait DurableStore: Send + Sync + 'static {
  fn kv_get(&self, key: &str) -> Result<Option<String>>;

  /// Insert or replace the value for `key`.
  fn kv_put(&self, key: &str, value: &str) -> Result<()>;

  /// Returns whether a value was removed.
  fn kv_delete(&self, key: &str) -> Result<bool>;

  /// Persist an item and return its sequence number.
  fn queue_append(&self, item: &NewQueueItem) -> Result<i64>;

  fn queue_items(&self) -> Result<Vec<StoredQueueItem>>;

  /// Returns whether the row existed.
  fn queue_delete(&self, sequence: i64) -> Result<bool>;

  /// Remove every pending item; returns how many were removed.
  fn queue_clear(&self) -> Result<usize>;

  fn queue_len(&self) -> Result<usize>;
}

/// A TEXT column as a string; NULL, non-text or non-UTF-8 values read as `None`.
fn text_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
  Ok(row.get_ref(idx)?.as_str().ok().map(str::to_string))
}

/// SQLite-backed durable store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    let conn = super::open_connection(path, SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = super::open_in_memory(SCHEMA)?;
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

  /// Run raw SQL against the store, bypassing validation.
  #[cfg(test)]
  pub(crate) fn execute_raw(&self, sql: &str) {
    self.conn.lock().unwrap().execute_batch(sql).unwrap();
  }
}

impl DurableStore for SqliteStore {
  fn kv_get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    let value = conn
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()?;
    Ok(value)
  }

  fn kv_put(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn kv_delete(&self, key: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn.execute("DELETE FROM kv WHERE key = ?", params![key])?;
    Ok(removed > 0)
  }

  fn queue_append(&self, item: &NewQueueItem) -> Result<i64> {
    let headers = serde_json::to_string(&item.headers)?;
    let conn = self.lock()?;
    conn.execute(
      "INSERT INTO queue (url, method, headers, body, enqueued_at)
       VALUES (?, ?, ?, ?, datetime('now'))",
      params![item.url, item.method, headers, item.body],
    )?;
    Ok(conn.last_insert_rowid())
  }

  fn queue_items(&self) -> Result<Vec<StoredQueueItem>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT sequence, url, method, headers, body, enqueued_at FROM queue ORDER BY sequence",
    )?;

    // Damaged columns are read as missing so the row surfaces as malformed
    // instead of failing the whole read.
    let items = stmt
      .query_map([], |row| {
        let enqueued_at = text_column(row, 5)?
          .and_then(|raw| super::parse_datetime(&raw).ok())
          .unwrap_or_else(Utc::now);
        Ok(StoredQueueItem {
          sequence: row.get(0)?,
          url: text_column(row, 1)?,
          method: text_column(row, 2)?,
          headers: text_column(row, 3)?,
          body: match row.get_ref(4)? {
            ValueRef::Blob(bytes) | ValueRef::Text(bytes) => Some(bytes.to_vec()),
            _ => None,
          },
          enqueued_at,
        })
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(items)
  }

  fn queue_delete(&self, sequence: i64) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn.execute("DELETE FROM queue WHERE sequence = ?", params![sequence])?;
    Ok(removed > 0)
  }

  fn queue_clear(&self) -> Result<usize> {
    let conn = self.lock()?;
    Ok(conn.execute("DELETE FROM queue", [])?)
  }

  fn queue_len(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
    Ok(count as usize)
  }
}

#[derive(Default)]
struct MemoryInner {
  kv: HashMap<String, String>,
  queue: BTreeMap<i64, StoredQueueItem>,
  last_sequence: i64,
}

/// In-memory durable store for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryStore {
  inner: Mutex<MemoryInner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
    self
      .inner
      .lock()
      .map_err(|e| OfflineError::StoreUnavailable(format!("Lock poisoned: {}", e)))
  }

  /// Persist a row as-is, bypassing validation.
  #[cfg(test)]
  pub(crate) fn insert_raw(&self, url: Option<&str>, method: Option<&str>) -> i64 {
    let mut inner = self.inner.lock().unwrap();
    inner.last_sequence += 1;
    let sequence = inner.last_sequence;
    inner.queue.insert(
      sequence,
      StoredQueueItem {
        sequence,
        url: url.map(String::from),
        method: method.map(String::from),
        headers: None,
        body: None,
        enqueued_at: Utc::now(),
      },
    );
    sequence
  }
}

impl DurableStore for MemoryStore {
  fn kv_get(&self, key: &str) -> Result<Option<String>> {
    Ok(self.lock()?.kv.get(key).cloned())
  }

  fn kv_put(&self, key: &str, value: &str) -> Result<()> {
    self.lock()?.kv.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn kv_delete(&self, key: &str) -> Result<bool> {
    Ok(self.lock()?.kv.remove(key).is_some())
  }

  fn queue_append(&self, item: &NewQueueItem) -> Result<i64> {
    let headers = serde_json::to_string(&item.headers)?;
    let mut inner = self.lock()?;
    inner.last_sequence += 1;
    let sequence = inner.last_sequence;
    inner.queue.insert(
      sequence,
      StoredQueueItem {
        sequence,
        url: Some(item.url.clone()),
        method: Some(item.method.clone()),
        headers: Some(headers),
        body: item.body.clone(),
        enqueued_at: Utc::now(),
      },
    );
    Ok(sequence)
  }

  fn queue_items(&self) -> Result<Vec<StoredQueueItem>> {
    Ok(self.lock()?.queue.values().cloned().collect())
  }

  fn queue_delete(&self, sequence: i64) -> Result<bool> {
    Ok(self.lock()?.queue.remove(&sequence).is_some())
  }

  fn queue_clear(&self) -> Result<usize> {
    let mut inner = self.lock()?;
    let removed = inner.queue.len();
    inner.queue.clear();
    Ok(removed)
  }

  fn queue_len(&self) -> Result<usize> {
    Ok(self.lock()?.queue.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn item(url: &str, method: &str) -> NewQueueItem {
    NewQueueItem {
      url: url.to_string(),
      method: method.to_string(),
      headers: vec![
        ("Content-Type".into(), "application/json".into()),
        ("X-Client".into(), "axis".into()),
      ],
      body: Some(br#"{"completed":true}"#.to_vec()),
    }
  }

  fn exercise_kv(store: &dyn DurableStore) {
    assert_eq!(store.kv_get("theme").unwrap(), None);
    store.kv_put("theme", "dark").unwrap();
    store.kv_put("theme", "light").unwrap();
    assert_eq!(store.kv_get("theme").unwrap().as_deref(), Some("light"));
    assert!(store.kv_delete("theme").unwrap());
    assert!(!store.kv_delete("theme").unwrap());
  }

  fn exercise_sequences_never_reused(store: &dyn DurableStore) {
    let a = store.queue_append(&item("/api/tasks/1", "PATCH")).unwrap();
    let b = store.queue_append(&item("/api/tasks/1", "DELETE")).unwrap();
    assert!(b > a);

    assert!(store.queue_delete(b).unwrap());
    let c = store.queue_append(&item("/api/tasks/2", "POST")).unwrap();
    assert!(c > b, "sequence {} reused after delete of {}", c, b);

    assert_eq!(store.queue_clear().unwrap(), 2);
    let d = store.queue_append(&item("/api/tasks/3", "POST")).unwrap();
    assert!(d > c);
    assert_eq!(store.queue_len().unwrap(), 1);
  }

  #[test]
  fn test_sqlite_kv() {
    exercise_kv(&SqliteStore::open_in_memory().unwrap());
  }

  #[test]
  fn test_memory_kv() {
    exercise_kv(&MemoryStore::new());
  }

  #[test]
  fn test_sqlite_sequences_never_reused() {
    exercise_sequences_never_reused(&SqliteStore::open_in_memory().unwrap());
  }

  #[test]
  fn test_memory_sequences_never_reused() {
    exercise_sequences_never_reused(&MemoryStore::new());
  }

  #[test]
  fn test_sqlite_round_trips_headers_and_body() {
    let store = SqliteStore::open_in_memory().unwrap();
    let original = item("/api/tasks/1", "PATCH");
    let seq = store.queue_append(&original).unwrap();

    let stored = store.queue_items().unwrap();
    assert_eq!(stored.len(), 1);
    let parsed = QueueItem::try_from(stored[0].clone()).unwrap();
    assert_eq!(parsed.sequence, seq);
    assert_eq!(parsed.headers, original.headers);
    assert_eq!(parsed.body, original.body);
  }

  #[test]
  fn test_sqlite_items_are_in_sequence_order() {
    let store = SqliteStore::open_in_memory().unwrap();
    for i in 0..5 {
      store
        .queue_append(&item(&format!("/api/tasks/{}", i), "POST"))
        .unwrap();
    }
    let seqs: Vec<i64> = store
      .queue_items()
      .unwrap()
      .iter()
      .map(|i| i.sequence)
      .collect();
    let mut sorted = seqs.clone();
    sorted.sort();
    assert_eq!(seqs, sorted);
  }

  #[test]
  fn test_sqlite_null_fields_are_malformed() {
    let store = SqliteStore::open_in_memory().unwrap();
    {
      let conn = store.conn.lock().unwrap();
      conn
        .execute("INSERT INTO queue (url, method) VALUES (NULL, 'POST')", [])
        .unwrap();
    }
    let stored = store.queue_items().unwrap();
    let err = QueueItem::try_from(stored[0].clone()).unwrap_err();
    assert!(matches!(err, OfflineError::MalformedQueueItem { .. }));
  }

  #[test]
  fn test_sqlite_damaged_row_does_not_fail_the_read() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.execute_raw(
      "INSERT INTO queue (url, method, enqueued_at) VALUES (X'2f6170692f7461736b73', 'POST', 'yesterday');",
    );
    let good = store.queue_append(&item("/api/tasks/2", "PATCH")).unwrap();

    let stored = store.queue_items().unwrap();
    assert_eq!(stored.len(), 2);

    let err = QueueItem::try_from(stored[0].clone()).unwrap_err();
    assert_eq!(
      err,
      OfflineError::MalformedQueueItem {
        sequence: stored[0].sequence,
        reason: "missing url".into()
      }
    );
    let replayable = QueueItem::try_from(stored[1].clone()).unwrap();
    assert_eq!(replayable.sequence, good);
  }

  #[test]
  fn test_missing_method_is_malformed() {
    let store = MemoryStore::new();
    store.insert_raw(Some("/api/tasks/1"), None);
    let stored = store.queue_items().unwrap();
    let err = QueueItem::try_from(stored[0].clone()).unwrap_err();
    assert_eq!(
      err,
      OfflineError::MalformedQueueItem {
        sequence: 1,
        reason: "missing method".into()
      }
    );
  }
}
