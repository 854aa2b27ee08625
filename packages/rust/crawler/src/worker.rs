//! The crawl worker loop.
//!
//! A worker repeatedly claims one queued record, turns it into a normalized
//! document with attachment sub-records, and commits it as `Fetched` or
//! `Error`. It owns its repository session, queue connection and config
//! cache exclusively; nothing is shared with other workers except the queue
//! store itself and the [`WorkSignal`].

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use notescrawl_shared::{
    CrawlAction, CrawlError, CrawlPolicy, CrawlRecord, CrawlState, Result,
};

use crate::attachments::AttachmentProcessor;
use crate::content::extract_content;
use crate::mapper::{map_meta_fields, map_standard_fields, map_title_and_description};
use crate::reconcile::{ReconcileOutcome, reconcile};
use crate::repository::{RepositoryClient, RepositorySession};
use crate::resolver::ConfigResolver;
use crate::security::compute_readers;
use crate::signal::WorkSignal;
use crate::store::{QueueConnection, QueueStore};

/// Consecutive failures tolerated before the worker idles.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

// ---------------------------------------------------------------------------
// Outcomes and stats
// ---------------------------------------------------------------------------

/// Result of a single [`CrawlWorker::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The spool filesystem is below its free-space floor; nothing claimed.
    Backpressure,
    /// No queued record; the worker disconnected.
    QueueEmpty,
    /// A record was claimed and committed in `state`.
    Processed { id: String, state: CrawlState },
}

/// Counters returned when a worker stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Records claimed and committed.
    pub processed: u64,
    pub fetched: u64,
    pub errors: u64,
    /// Iterations that ended in an uncaught failure.
    pub failures: u64,
    /// Idle waits for any reason.
    pub idle_waits: u64,
    /// Iterations skipped for lack of spool space.
    pub backpressure: u64,
}

impl WorkerStats {
    /// Add the counters of another worker.
    pub fn merge(&mut self, other: &WorkerStats) {
        self.processed += other.processed;
        self.fetched += other.fetched;
        self.errors += other.errors;
        self.failures += other.failures;
        self.idle_waits += other.idle_waits;
        self.backpressure += other.backpressure;
    }
}

// ---------------------------------------------------------------------------
// CrawlWorker
// ---------------------------------------------------------------------------

/// Handles held while connected.
struct Connection {
    session: Box<dyn RepositorySession>,
    queue: Box<dyn QueueConnection>,
    store_id: String,
    /// Replica id of the source database open in `session`.
    open_replica: Option<String>,
}

pub struct CrawlWorker {
    name: String,
    repository: Arc<dyn RepositoryClient>,
    store: Arc<dyn QueueStore>,
    policy: Arc<CrawlPolicy>,
    signal: Arc<WorkSignal>,
    resolver: ConfigResolver,
    connection: Option<Connection>,
    stats: WorkerStats,
}

impl CrawlWorker {
    pub fn new(
        name: impl Into<String>,
        repository: Arc<dyn RepositoryClient>,
        store: Arc<dyn QueueStore>,
        policy: Arc<CrawlPolicy>,
        signal: Arc<WorkSignal>,
    ) -> Self {
        Self {
            name: name.into(),
            repository,
            store,
            policy,
            signal,
            resolver: ConfigResolver::new(),
            connection: None,
            stats: WorkerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Run until shutdown is signalled, then disconnect.
    #[instrument(skip_all, fields(worker = %self.name))]
    pub async fn run(mut self) -> WorkerStats {
        info!("crawl worker started");
        let mut failures = 0;

        while !self.signal.is_shutdown() {
            match self.step().await {
                Ok(StepOutcome::Processed { .. }) => failures = 0,
                Ok(StepOutcome::QueueEmpty) => {
                    debug!("crawl queue is empty, worker sleeping");
                    self.idle().await;
                }
                Ok(StepOutcome::Backpressure) => self.idle().await,
                Err(e) => {
                    if self.fail(e, &mut failures).await {
                        warn!("too many failures, crawl worker sleeping");
                        self.idle().await;
                        failures = 0;
                    }
                }
            }
        }

        self.finish().await
    }

    /// Process records until the queue is empty or the spool is full.
    #[instrument(skip_all, fields(worker = %self.name))]
    pub async fn drain(mut self) -> WorkerStats {
        let mut failures = 0;

        while !self.signal.is_shutdown() {
            match self.step().await {
                Ok(StepOutcome::Processed { .. }) => failures = 0,
                Ok(StepOutcome::QueueEmpty | StepOutcome::Backpressure) => break,
                Err(e) => {
                    if self.fail(e, &mut failures).await {
                        warn!("too many failures, giving up");
                        break;
                    }
                }
            }
        }

        self.finish().await
    }

    /// One iteration: gate on spool space, connect, claim, process, commit.
    ///
    /// Errors are failures outside per-document handling (connect, claim,
    /// commit) or connectivity failures during processing; in the latter
    /// case the record has already been committed as `Error`.
    pub async fn step(&mut self) -> Result<StepOutcome> {
        if !self.spool_has_space().await? {
            warn!(
                min_free_bytes = self.policy.min_spool_free_bytes,
                "insufficient space in spool directory to process new documents"
            );
            self.stats.backpressure += 1;
            return Ok(StepOutcome::Backpressure);
        }

        let conn = match self.connection.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };
        let conn = self.connection.insert(conn);

        let Some(mut record) = conn.queue.claim_next().await? else {
            self.disconnect().await;
            return Ok(StepOutcome::QueueEmpty);
        };

        let processed =
            process_record(conn, &mut self.resolver, &self.policy, &mut record).await;
        let next = match &processed {
            Ok(()) => CrawlState::Fetched,
            Err(e) => {
                error!(id = %record.id, unid = %record.unid, error = %e, "error processing crawl record");
                CrawlState::Error
            }
        };
        record.transition(next)?;
        conn.queue.save(&record).await?;

        self.stats.processed += 1;
        match next {
            CrawlState::Fetched => self.stats.fetched += 1,
            _ => self.stats.errors += 1,
        }
        info!(id = %record.id, doc_id = %record.doc_id, state = %next, "committed crawl record");

        match processed {
            Err(e) if e.is_connectivity() => Err(e),
            _ => Ok(StepOutcome::Processed {
                id: record.id,
                state: next,
            }),
        }
    }

    async fn connect(&self) -> Result<Connection> {
        debug!("connecting to crawl queue");
        let queue = self.store.connect().await?;
        let store_id = queue.store_id().await?;
        let session = self.repository.open_session().await?;
        Ok(Connection {
            session,
            queue,
            store_id,
            open_replica: None,
        })
    }

    /// Close the session and drop every cached handle.
    async fn disconnect(&mut self) {
        self.resolver.invalidate();
        if let Some(mut conn) = self.connection.take() {
            if let Err(e) = conn.session.close().await {
                warn!(error = %e, "failed to close repository session");
            }
            debug!("disconnected");
        }
    }

    async fn spool_has_space(&self) -> Result<bool> {
        let dir = &self.policy.spool_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CrawlError::io(dir, e))?;
        let free = fs2::available_space(dir).map_err(|e| CrawlError::io(dir, e))?;
        debug!(free, "spool free space");
        Ok(free >= self.policy.min_spool_free_bytes)
    }

    async fn idle(&mut self) {
        self.stats.idle_waits += 1;
        self.signal.wait_for_work().await;
    }

    /// Record a failure and disconnect. Returns whether the consecutive
    /// failure limit was exceeded.
    async fn fail(&mut self, e: CrawlError, failures: &mut u32) -> bool {
        error!(error = %e, "crawl worker failure");
        self.stats.failures += 1;
        *failures += 1;
        self.disconnect().await;
        *failures > MAX_CONSECUTIVE_FAILURES
    }

    async fn finish(mut self) -> WorkerStats {
        self.disconnect().await;
        info!(
            processed = self.stats.processed,
            fetched = self.stats.fetched,
            errors = self.stats.errors,
            failures = self.stats.failures,
            "crawl worker exiting"
        );
        self.stats
    }
}

/// Populate a claimed record from its source document.
#[instrument(skip_all, fields(id = %record.id, unid = %record.unid))]
async fn process_record(
    conn: &mut Connection,
    resolver: &mut ConfigResolver,
    policy: &CrawlPolicy,
    record: &mut CrawlRecord,
) -> Result<()> {
    resolver.resolve(conn.queue.as_ref(), &record.template).await?;

    if conn.open_replica.as_deref() != Some(record.replica_id.as_str()) {
        conn.open_replica = None;
        conn.session
            .open_database(&record.server, &record.replica_id)
            .await?;
        conn.open_replica = Some(record.replica_id.clone());
    }

    let source = conn.session.document_by_unid(&record.unid).await?;
    resolver.resolve_form(source.form());
    let selection = resolver
        .selection()
        .ok_or_else(|| CrawlError::TemplateNotFound {
            name: record.template.clone(),
        })?;
    if selection.form.is_none() {
        debug!(form = source.form(), "no form definition, using template definition");
    }

    let security = compute_readers(&source.fields, &record.auth_type);
    record.readers = security.readers;
    record.is_public = security.is_public;

    let domain = policy.domain(&record.server);
    map_standard_fields(record, &source, domain);
    map_title_and_description(record, &source, &selection, conn.session.as_mut()).await;
    let meta = map_meta_fields(record, &source, selection.rules);
    debug!(
        mapped = meta.mapped.len(),
        skipped = meta.skipped.len(),
        "mapped meta fields"
    );

    // Attachment records copy the parent, so content comes after them.
    let report = AttachmentProcessor::new(policy, &conn.store_id)
        .process(
            record,
            &source,
            domain,
            conn.session.as_mut(),
            conn.queue.as_ref(),
        )
        .await?;
    record.attachment_names = report.retained_names;
    record.all_attachment_names = report.all_names;
    record.attachment_ids = report.content_ids;

    record.content = extract_content(&source, selection.form);
    record.action = CrawlAction::Add;

    match reconcile(
        conn.queue.as_ref(),
        conn.queue.ledger(),
        &record.doc_id,
        &record.attachment_ids,
    )
    .await?
    {
        ReconcileOutcome::Reconciled { deletes, failed } => {
            debug!(deletes = deletes.len(), failed = failed.len(), "reconciled attachments");
        }
        ReconcileOutcome::LedgerUnavailable(reason) => {
            warn!(%reason, "attachment deletions skipped");
        }
    }

    Ok(())
}
