//! libSQL storage layer for the crawl queue (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding the crawl queue,
//! template configurations and the attachment ledger.
//!
//! **Access rules:**
//! - crawl workers and `enqueue`: read-write, one handle per worker via [`Storage::open`]
//! - `status` / `show`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use libsql::{Connection, Database, params};
use notescrawl_shared::{CrawlError, CrawlRecord, CrawlState, Result, TemplateConfig};

/// How long a statement waits on a lock held by another worker.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CrawlError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        let conn = db.connect().map_err(|e| CrawlError::Storage(e.to_string()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CrawlError::Storage(format!(
                "queue database not found: {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        let conn = db.connect().map_err(|e| CrawlError::Storage(e.to_string()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CrawlError::Storage(format!("migration v{} failed: {e}", migration.version))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CrawlError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Identity of this queue store, stable across opens.
    pub async fn store_id(&self) -> Result<String> {
        let mut rows = self
            .conn
            .query(
                "SELECT value FROM store_meta WHERE key = 'store_id'",
                params![],
            )
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map_err(|e| CrawlError::Storage(e.to_string())),
            Ok(None) => Err(CrawlError::Storage("store id missing".into())),
            Err(e) => Err(CrawlError::Storage(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Crawl queue operations
    // -----------------------------------------------------------------------

    /// Insert a new record into the queue in whatever state it carries.
    pub async fn insert_record(&self, record: &CrawlRecord) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let json = record_to_json(record)?;
        self.conn
            .execute(
                "INSERT INTO crawl_queue (id, state, action, doc_id, template, record_json, enqueued_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id.as_str(),
                    record.state.as_str(),
                    record.action.as_str(),
                    record.doc_id.as_str(),
                    record.template.as_str(),
                    json,
                    now.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Atomically move the oldest queued record to `InCrawl` and return it.
    ///
    /// The state check sits inside the `UPDATE`, so two workers can never
    /// claim the same record.
    pub async fn claim_next(&self) -> Result<Option<CrawlRecord>> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn
            .query(
                "UPDATE crawl_queue SET state = ?1, updated_at = ?2
                 WHERE rowid = (
                     SELECT rowid FROM crawl_queue WHERE state = ?3 ORDER BY rowid LIMIT 1
                 ) AND state = ?3
                 RETURNING id, state, action, record_json",
                params![
                    CrawlState::InCrawl.as_str(),
                    now.as_str(),
                    CrawlState::Queued.as_str(),
                ],
            )
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(CrawlError::Storage(e.to_string())),
        }
    }

    /// Persist the current contents and state of an existing record.
    pub async fn save_record(&self, record: &CrawlRecord) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let json = record_to_json(record)?;
        let updated = self
            .conn
            .execute(
                "UPDATE crawl_queue
                 SET state = ?1, action = ?2, doc_id = ?3, template = ?4, record_json = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    record.state.as_str(),
                    record.action.as_str(),
                    record.doc_id.as_str(),
                    record.template.as_str(),
                    json,
                    now.as_str(),
                    record.id.as_str(),
                ],
            )
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        if updated == 0 {
            return Err(CrawlError::Storage(format!(
                "record {} not found in queue",
                record.id
            )));
        }
        Ok(())
    }

    /// Get a record by queue id.
    pub async fn get_record(&self, id: &str) -> Result<Option<CrawlRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, state, action, record_json FROM crawl_queue WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(CrawlError::Storage(e.to_string())),
        }
    }

    /// List records in queue order, optionally filtered by state.
    pub async fn list_records(
        &self,
        state: Option<CrawlState>,
        limit: u32,
    ) -> Result<Vec<CrawlRecord>> {
        let mut rows = match state {
            Some(state) => self
                .conn
                .query(
                    "SELECT id, state, action, record_json FROM crawl_queue
                     WHERE state = ?1 ORDER BY rowid LIMIT ?2",
                    params![state.as_str(), limit],
                )
                .await,
            None => self
                .conn
                .query(
                    "SELECT id, state, action, record_json FROM crawl_queue
                     ORDER BY rowid LIMIT ?1",
                    params![limit],
                )
                .await,
        }
        .map_err(|e| CrawlError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_record(&row)?);
        }
        Ok(results)
    }

    /// Record counts per state. States with no records are omitted.
    pub async fn count_by_state(&self) -> Result<Vec<(CrawlState, u64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT state, COUNT(*) FROM crawl_queue GROUP BY state ORDER BY state",
                params![],
            )
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let state: String = row
                .get(0)
                .map_err(|e| CrawlError::Storage(e.to_string()))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| CrawlError::Storage(e.to_string()))?;
            results.push((state.parse()?, count as u64));
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Template operations
    // -----------------------------------------------------------------------

    /// Insert or replace a template configuration by name.
    pub async fn upsert_template(&self, template: &TemplateConfig) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let json =
            serde_json::to_string(template).map_err(|e| CrawlError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO templates (name, config_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET
                   config_json = excluded.config_json,
                   updated_at = excluded.updated_at",
                params![template.name.as_str(), json, now.as_str()],
            )
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Look up a template configuration by exact name.
    pub async fn get_template(&self, name: &str) -> Result<Option<TemplateConfig>> {
        let mut rows = self
            .conn
            .query(
                "SELECT config_json FROM templates WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row
                    .get(0)
                    .map_err(|e| CrawlError::Storage(e.to_string()))?;
                let template = serde_json::from_str(&json)
                    .map_err(|e| CrawlError::Storage(format!("invalid template {name}: {e}")))?;
                Ok(Some(template))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(CrawlError::Storage(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Attachment ledger operations
    // -----------------------------------------------------------------------

    /// Attachment ids previously indexed for a parent document.
    pub async fn attachment_ids(&self, replica_id: &str, unid: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT attachment_id FROM attachment_ledger
                 WHERE replica_id = ?1 AND unid = ?2 ORDER BY attachment_id",
                params![replica_id, unid],
            )
            .await
            .map_err(|e| CrawlError::Ledger(e.to_string()))?;

        let mut results = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| CrawlError::Ledger(e.to_string()))?
        {
            results.push(
                row.get::<String>(0)
                    .map_err(|e| CrawlError::Ledger(e.to_string()))?,
            );
        }
        Ok(results)
    }

    /// Replace the ledger entry of a parent document with `ids`.
    pub async fn record_attachment_ids(
        &self,
        replica_id: &str,
        unid: &str,
        ids: &[String],
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| CrawlError::Ledger(e.to_string()))?;

        tx.execute(
            "DELETE FROM attachment_ledger WHERE replica_id = ?1 AND unid = ?2",
            params![replica_id, unid],
        )
        .await
        .map_err(|e| CrawlError::Ledger(e.to_string()))?;

        for id in ids {
            tx.execute(
                "INSERT OR IGNORE INTO attachment_ledger (replica_id, unid, attachment_id, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![replica_id, unid, id.as_str(), now.as_str()],
            )
            .await
            .map_err(|e| CrawlError::Ledger(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| CrawlError::Ledger(e.to_string()))?;
        Ok(())
    }
}

fn record_to_json(record: &CrawlRecord) -> Result<String> {
    serde_json::to_string(record)
        .map_err(|e| CrawlError::Storage(format!("failed to encode record {}: {e}", record.id)))
}

/// Convert a `(id, state, action, record_json)` row to a [`CrawlRecord`].
fn row_to_record(row: &libsql::Row) -> Result<CrawlRecord> {
    let id: String = row
        .get(0)
        .map_err(|e| CrawlError::Storage(e.to_string()))?;
    let state: String = row
        .get(1)
        .map_err(|e| CrawlError::Storage(e.to_string()))?;
    let action: String = row
        .get(2)
        .map_err(|e| CrawlError::Storage(e.to_string()))?;
    let json: String = row
        .get(3)
        .map_err(|e| CrawlError::Storage(e.to_string()))?;

    let mut record: CrawlRecord = serde_json::from_str(&json)
        .map_err(|e| CrawlError::Storage(format!("invalid record {id}: {e}")))?;
    record.id = id;
    record.state = state.parse()?;
    record.action = action.parse()?;
    Ok(record)
}
