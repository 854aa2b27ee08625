//! Attachment discovery and materialization.
//!
//! Every retained attachment of a parent document becomes its own crawl
//! record, addressed by a content id derived from the attachment name.

use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use notescrawl_shared::{
    CrawlAction, CrawlError, CrawlPolicy, CrawlRecord, CrawlState, DEFAULT_MIME_TYPE, Result,
    new_record_id,
};

use crate::repository::{EmbeddedKind, RepositorySession, SourceDocument};
use crate::store::QueueConnection;

/// Formula listing the attachment names of a document.
const ATTACHMENT_NAMES_FORMULA: &str = "@AttachmentNames";

/// Content id of an attachment: lower-case hex SHA-256 of its name.
pub fn content_id(name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extension after the last `.`, or empty.
pub fn extension(name: &str) -> &str {
    name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// What happened to one attachment name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentOutcome {
    /// A sub-record was written in `Fetched` state.
    Retained {
        name: String,
        content_id: String,
        /// Whether the file content was extracted to the spool.
        content_sent: bool,
    },
    /// The extension is excluded by policy.
    Excluded { name: String, extension: String },
    /// The embedded object is missing or not a file attachment.
    Skipped { name: String, reason: String },
    /// Materialization failed; any partial sub-record is in `Error` state.
    Failed { name: String, error: String },
}

/// Result of processing all attachments of a parent document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentReport {
    /// Every non-empty attachment name reported by the document.
    pub all_names: Vec<String>,
    /// Names that produced a sub-record.
    pub retained_names: Vec<String>,
    /// Content ids of retained attachments, parallel to `retained_names`.
    pub content_ids: Vec<String>,
    pub outcomes: Vec<AttachmentOutcome>,
}

// ---------------------------------------------------------------------------
// AttachmentProcessor
// ---------------------------------------------------------------------------

/// Turns the attachments of a parent record into sub-records.
pub struct AttachmentProcessor<'a> {
    policy: &'a CrawlPolicy,
    /// Queue store identity; first spool directory level.
    store_id: &'a str,
}

impl<'a> AttachmentProcessor<'a> {
    pub fn new(policy: &'a CrawlPolicy, store_id: &'a str) -> Self {
        Self { policy, store_id }
    }

    /// Spool path of an attachment of `parent`.
    pub fn spool_path(&self, parent: &CrawlRecord, content_id: &str) -> PathBuf {
        self.policy
            .spool_dir
            .join("attachments")
            .join(self.store_id)
            .join(&parent.id)
            .join(content_id)
    }

    /// Process every attachment of `source`.
    ///
    /// Only listing the attachment names can fail the whole call; a failure
    /// on one attachment is reported and its siblings carry on.
    #[instrument(skip_all, fields(doc_id = %parent.doc_id))]
    pub async fn process(
        &self,
        parent: &CrawlRecord,
        source: &SourceDocument,
        domain: &str,
        session: &mut dyn RepositorySession,
        queue: &dyn QueueConnection,
    ) -> Result<AttachmentReport> {
        let names = session.evaluate(ATTACHMENT_NAMES_FORMULA, source).await?;
        let mut report = AttachmentReport::default();

        for name in names.into_iter().filter(|n| !n.is_empty()) {
            report.all_names.push(name.clone());

            let ext = extension(&name);
            if self.policy.is_excluded_extension(ext) {
                debug!(attachment = %name, "excluding attachment");
                report.outcomes.push(AttachmentOutcome::Excluded {
                    extension: ext.to_lowercase(),
                    name,
                });
                continue;
            }

            let mime = self.policy.mime_type(ext);
            let outcome = self
                .materialize(parent, source, &name, mime, domain, session, queue)
                .await;

            if let AttachmentOutcome::Retained { content_id, .. } = &outcome {
                report.retained_names.push(name.clone());
                report.content_ids.push(content_id.clone());
            } else {
                debug!(attachment = %name, "attachment record was not created");
            }
            report.outcomes.push(outcome);
        }

        info!(
            attachments = report.all_names.len(),
            retained = report.retained_names.len(),
            "processed attachments"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn materialize(
        &self,
        parent: &CrawlRecord,
        source: &SourceDocument,
        name: &str,
        mime: Option<&str>,
        domain: &str,
        session: &mut dyn RepositorySession,
        queue: &dyn QueueConnection,
    ) -> AttachmentOutcome {
        let Some(object) = source.embedded_object(name) else {
            debug!(attachment = name, "attachment could not be accessed");
            return AttachmentOutcome::Skipped {
                name: name.to_string(),
                reason: "attachment could not be accessed".into(),
            };
        };
        if object.kind != EmbeddedKind::Attachment {
            debug!(attachment = name, kind = ?object.kind, "ignoring embedded object");
            return AttachmentOutcome::Skipped {
                name: name.to_string(),
                reason: format!("embedded object is {:?}, not a file", object.kind),
            };
        }

        let within_limit = object.size <= self.policy.max_file_size;
        if !within_limit {
            info!(
                attachment = name,
                size = object.size,
                limit = self.policy.max_file_size,
                "attachment larger than the configured limit and content will not be sent"
            );
        }

        let mut sub = parent.clone();
        sub.id = new_record_id();
        sub.state = CrawlState::InCrawl;
        sub.action = CrawlAction::Add;
        sub.attachment_file_name = Some(name.to_string());
        sub.attachment_names.clear();
        sub.all_attachment_names.clear();
        sub.attachment_ids.clear();
        sub.content.clear();

        if let Err(e) = queue.create(&sub).await {
            warn!(attachment = name, error = %e, "failed to create attachment record");
            return AttachmentOutcome::Failed {
                name: name.to_string(),
                error: e.to_string(),
            };
        }

        let cid = content_id(name);
        let parent_url = parent.http_url(domain);
        sub.display_url = format!(
            "{parent_url}/$File/{}?OpenElement",
            url::form_urlencoded::byte_serialize(name.as_bytes()).collect::<String>()
        );
        sub.doc_id = format!("{parent_url}/$File/{cid}");

        let filled = match mime {
            Some(mime) if within_limit => {
                let path = self.spool_path(parent, &cid);
                match self.extract(source, name, &path, session).await {
                    Ok(()) => {
                        sub.mime_type = Some(mime.to_string());
                        sub.content_path = Some(path);
                        Ok(true)
                    }
                    Err(e) => Err(e),
                }
            }
            _ => {
                sub.content = name.to_string();
                sub.mime_type = Some(DEFAULT_MIME_TYPE.to_string());
                Ok(false)
            }
        };

        let result = match filled {
            Ok(content_sent) => match sub.transition(CrawlState::Fetched) {
                Ok(()) => queue.save(&sub).await.map(|()| content_sent),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(content_sent) => {
                debug!(attachment = name, doc_id = %sub.doc_id, content_sent, "attachment record fetched");
                AttachmentOutcome::Retained {
                    name: name.to_string(),
                    content_id: cid,
                    content_sent,
                }
            }
            Err(e) => {
                warn!(attachment = name, error = %e, "error pre-fetching attachment");
                sub.state = CrawlState::Error;
                if let Err(save_err) = queue.save(&sub).await {
                    warn!(attachment = name, error = %save_err, "failed to mark attachment record as error");
                }
                AttachmentOutcome::Failed {
                    name: name.to_string(),
                    error: e.to_string(),
                }
            }
        }
    }

    async fn extract(
        &self,
        source: &SourceDocument,
        name: &str,
        path: &std::path::Path,
        session: &mut dyn RepositorySession,
    ) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| CrawlError::io(dir, e))?;
        }
        session
            .extract_attachment(source, name, path)
            .await
            .map_err(|e| match e {
                CrawlError::Attachment { .. } => e,
                other => CrawlError::attachment(name, other),
            })
    }
}
