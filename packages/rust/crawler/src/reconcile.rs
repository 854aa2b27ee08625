//! Deletion of attachments that disappeared from a parent document.

use std::collections::HashSet;

use tracing::{debug, warn};

use notescrawl_shared::{CrawlRecord, DocId, Result};

use crate::store::{AttachmentLedger, QueueConnection};

/// Result of reconciling one parent document against the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Reconciled {
        /// Document ids of the delete requests written.
        deletes: Vec<String>,
        /// Attachment ids whose delete request could not be written.
        failed: Vec<(String, String)>,
    },
    /// The ledger could not be read; nothing was deleted.
    LedgerUnavailable(String),
}

/// Enqueue a delete request for every ledger id of `parent_doc_id` that is
/// not in `retained_ids`.
///
/// Errors only when `parent_doc_id` is not a document id.
pub async fn reconcile(
    queue: &dyn QueueConnection,
    ledger: &dyn AttachmentLedger,
    parent_doc_id: &str,
    retained_ids: &[String],
) -> Result<ReconcileOutcome> {
    let doc_id: DocId = parent_doc_id.parse()?;

    let known = match ledger.attachment_ids(&doc_id).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(doc_id = parent_doc_id, error = %e, "unable to read attachment ledger");
            return Ok(ReconcileOutcome::LedgerUnavailable(e.to_string()));
        }
    };

    let retained: HashSet<&str> = retained_ids.iter().map(String::as_str).collect();
    let mut deletes = Vec::new();
    let mut failed = Vec::new();

    for id in known.iter().filter(|id| !retained.contains(id.as_str())) {
        debug!(attachment_id = %id, "attachment is in ledger but not in source document");
        let request = CrawlRecord::delete_request(format!("{parent_doc_id}/$File/{id}"));
        match queue.create(&request).await {
            Ok(()) => deletes.push(request.doc_id),
            Err(e) => {
                warn!(attachment_id = %id, error = %e, "failed to create delete request");
                failed.push((id.clone(), e.to_string()));
            }
        }
    }

    Ok(ReconcileOutcome::Reconciled { deletes, failed })
}
