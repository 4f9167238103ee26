/// Schema for the local key/value store.
///
/// Every persisted value (cache entries, their timestamps, settings and the
/// pending location queue) lives in this single table, mirroring the flat
/// key/value storage the device exposes.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
