/// Schema for the durable store: a key/value map and an append-ordered queue.
///
/// `AUTOINCREMENT` keeps queue sequences strictly increasing and never reused,
/// even after rows are deleted.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- url/method are nullable so rows written by older builds can be detected as malformed
CREATE TABLE IF NOT EXISTS queue (
    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT,
    method TEXT,
    headers TEXT,
    body BLOB,
    enqueued_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
