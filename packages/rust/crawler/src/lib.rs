//! Crawl-and-normalize pipeline for repository documents.
//!
//! This crate provides:
//! - [`worker`]: the claim / process / commit loop ([`CrawlWorker`])
//! - [`resolver`], [`rules`]: template and form configuration
//! - [`security`], [`mapper`], [`content`]: normalization of one document
//! - [`attachments`], [`reconcile`]: attachment sub-records and deletions
//! - [`repository`], [`store`], [`signal`]: collaborator boundaries
//! - [`snapshot`]: a repository client backed by a JSON export

pub mod attachments;
pub mod content;
pub mod mapper;
pub mod reconcile;
pub mod repository;
pub mod resolver;
pub mod rules;
pub mod security;
pub mod signal;
pub mod snapshot;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;

pub use attachments::{AttachmentOutcome, AttachmentProcessor, AttachmentReport, content_id};
pub use content::extract_content;
pub use mapper::{FormulaOutcome, MetaFieldReport, MetaSkip};
pub use reconcile::{ReconcileOutcome, reconcile};
pub use repository::{
    EmbeddedKind, EmbeddedObject, FieldKind, RepositoryClient, RepositorySession, SourceDocument,
    SourceField,
};
pub use resolver::{ConfigResolver, ConfigSelection};
pub use rules::MetaFieldRule;
pub use security::{ReaderSecurity, compute_readers};
pub use signal::WorkSignal;
pub use snapshot::{DocumentRef, SnapshotRepository};
pub use store::{AttachmentLedger, QueueConnection, QueueStore, StorageQueue};
pub use worker::{CrawlWorker, StepOutcome, WorkerStats};
