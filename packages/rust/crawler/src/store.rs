//! Queue store and attachment ledger boundaries.
//!
//! Workers open one [`QueueConnection`] each through a [`QueueStore`].
//! The libSQL [`Storage`] implements both connection and ledger.

use std::path::PathBuf;

use async_trait::async_trait;

use notescrawl_shared::{CrawlRecord, DocId, Result, TemplateConfig};
use notescrawl_storage::Storage;

/// Factory for queue connections.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn QueueConnection>>;
}

/// A worker's exclusive handle on the crawl queue.
#[async_trait]
pub trait QueueConnection: Send + Sync {
    /// Identity of the queue store; first level of the spool layout.
    async fn store_id(&self) -> Result<String>;

    /// Atomically claim the next queued record, moving it to `InCrawl`.
    async fn claim_next(&self) -> Result<Option<CrawlRecord>>;

    /// Persist an existing record.
    async fn save(&self, record: &CrawlRecord) -> Result<()>;

    /// Insert a new record.
    async fn create(&self, record: &CrawlRecord) -> Result<()>;

    /// Look up a template configuration by name.
    async fn template(&self, name: &str) -> Result<Option<TemplateConfig>>;

    /// Ledger reachable through this connection.
    fn ledger(&self) -> &dyn AttachmentLedger;
}

/// Record of attachment ids previously indexed per parent document.
#[async_trait]
pub trait AttachmentLedger: Send + Sync {
    async fn attachment_ids(&self, doc_id: &DocId) -> Result<Vec<String>>;
}

#[async_trait]
impl QueueConnection for Storage {
    async fn store_id(&self) -> Result<String> {
        Storage::store_id(self).await
    }

    async fn claim_next(&self) -> Result<Option<CrawlRecord>> {
        Storage::claim_next(self).await
    }

    async fn save(&self, record: &CrawlRecord) -> Result<()> {
        self.save_record(record).await
    }

    async fn create(&self, record: &CrawlRecord) -> Result<()> {
        self.insert_record(record).await
    }

    async fn template(&self, name: &str) -> Result<Option<TemplateConfig>> {
        self.get_template(name).await
    }

    fn ledger(&self) -> &dyn AttachmentLedger {
        self
    }
}

#[async_trait]
impl AttachmentLedger for Storage {
    async fn attachment_ids(&self, doc_id: &DocId) -> Result<Vec<String>> {
        Storage::attachment_ids(self, &doc_id.replica_id, &doc_id.unid).await
    }
}

/// Queue store backed by a libSQL file; every connection is a fresh handle.
#[derive(Debug, Clone)]
pub struct StorageQueue {
    path: PathBuf,
}

impl StorageQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl QueueStore for StorageQueue {
    async fn connect(&self) -> Result<Box<dyn QueueConnection>> {
        let storage = Storage::open(&self.path).await?;
        Ok(Box::new(storage))
    }
}
