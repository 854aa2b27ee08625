//! SQL migration definitions for the notescrawl queue database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements. Several workers may open the
//! same file at once, so every statement tolerates having already run.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: store_meta, crawl_queue, templates, attachment_ledger",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Store identity; used as the first spool directory level
CREATE TABLE IF NOT EXISTS store_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR IGNORE INTO store_meta (key, value)
VALUES ('store_id', upper(hex(randomblob(8))));

-- Crawl queue; state and action columns are authoritative over record_json
CREATE TABLE IF NOT EXISTS crawl_queue (
    id          TEXT PRIMARY KEY,
    state       TEXT NOT NULL,
    action      TEXT NOT NULL,
    doc_id      TEXT NOT NULL DEFAULT '',
    template    TEXT NOT NULL DEFAULT '',
    record_json TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_crawl_queue_state ON crawl_queue(state);
CREATE INDEX IF NOT EXISTS idx_crawl_queue_doc_id ON crawl_queue(doc_id);

-- Template configurations, keyed by name
CREATE TABLE IF NOT EXISTS templates (
    name        TEXT PRIMARY KEY,
    config_json TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

-- Attachment ids previously indexed per parent document
CREATE TABLE IF NOT EXISTS attachment_ledger (
    replica_id    TEXT NOT NULL,
    unid          TEXT NOT NULL,
    attachment_id TEXT NOT NULL,
    recorded_at   TEXT NOT NULL,
    PRIMARY KEY (replica_id, unid, attachment_id)
);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
