//! Repository client backed by a JSON snapshot of source databases.
//!
//! A snapshot file looks like:
//!
//! ```json
//! { "databases": [ {
//!     "server": "mail1", "replica_id": "852578CE004AFDB8",
//!     "documents": [ {
//!         "unid": "0123ABCD",
//!         "fields": [ { "name": "Form", "kind": "text", "values": ["Memo"] } ],
//!         "attachments": [ { "name": "report.pdf", "kind": "attachment", "size": 1024 } ],
//!         "payloads": { "report.pdf": "..." }
//!     } ]
//! } ] }
//! ```
//!
//! Formulas support string literals, field references, `+` concatenation and
//! `@AttachmentNames`, `@Created`, `@Modified`, `@Author`. `@AttachmentNames`
//! reads the `$FILE` field when the document has one, so a snapshot can list
//! names whose embedded object is gone.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use notescrawl_shared::{CrawlError, Result};

use crate::repository::{RepositoryClient, RepositorySession, SourceDocument};

// ---------------------------------------------------------------------------
// Snapshot file model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
struct SnapshotFile {
    #[serde(default)]
    databases: Vec<SnapshotDatabase>,
}

#[derive(Debug, Clone, Deserialize)]
struct SnapshotDatabase {
    server: String,
    replica_id: String,
    #[serde(default)]
    documents: Vec<SnapshotDocument>,
}

#[derive(Debug, Clone, Deserialize)]
struct SnapshotDocument {
    #[serde(flatten)]
    document: SourceDocument,
    /// Attachment name -> file content.
    #[serde(default)]
    payloads: BTreeMap<String, String>,
}

/// Coordinates of one document in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub server: String,
    pub replica_id: String,
    pub unid: String,
}

// ---------------------------------------------------------------------------
// SnapshotRepository
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SessionCounters {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// In-process repository serving documents from a snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotRepository {
    databases: Arc<Vec<SnapshotDatabase>>,
    counters: Arc<SessionCounters>,
}

impl SnapshotRepository {
    /// Load a snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CrawlError::io(path, e))?;
        Self::from_json(&content)
    }

    /// Parse a snapshot from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: SnapshotFile = serde_json::from_str(json)
            .map_err(|e| CrawlError::config(format!("invalid snapshot: {e}")))?;
        Ok(Self {
            databases: Arc::new(file.databases),
            counters: Arc::new(SessionCounters::default()),
        })
    }

    /// Every document in the snapshot, in file order.
    pub fn documents(&self) -> Vec<DocumentRef> {
        self.databases
            .iter()
            .flat_map(|db| {
                db.documents.iter().map(|d| DocumentRef {
                    server: db.server.clone(),
                    replica_id: db.replica_id.clone(),
                    unid: d.document.unid.clone(),
                })
            })
            .collect()
    }

    /// Sessions opened so far.
    pub fn sessions_opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed.
    pub fn active_sessions(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst) - self.counters.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepositoryClient for SnapshotRepository {
    async fn open_session(&self) -> Result<Box<dyn RepositorySession>> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SnapshotSession {
            databases: Arc::clone(&self.databases),
            counters: Arc::clone(&self.counters),
            current: None,
            closed: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// SnapshotSession
// ---------------------------------------------------------------------------

struct SnapshotSession {
    databases: Arc<Vec<SnapshotDatabase>>,
    counters: Arc<SessionCounters>,
    /// Index of the current source database.
    current: Option<usize>,
    closed: bool,
}

impl SnapshotSession {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(CrawlError::Repository("session is closed".into()));
        }
        Ok(())
    }

    fn current_database(&self) -> Result<&SnapshotDatabase> {
        self.check_open()?;
        self.current
            .and_then(|idx| self.databases.get(idx))
            .ok_or_else(|| CrawlError::Repository("no source database is open".into()))
    }
}

#[async_trait]
impl RepositorySession for SnapshotSession {
    async fn open_database(&mut self, server: &str, replica_id: &str) -> Result<()> {
        self.check_open()?;
        let idx = self
            .databases
            .iter()
            .position(|db| db.server.eq_ignore_ascii_case(server) && db.replica_id == replica_id)
            .ok_or_else(|| {
                CrawlError::Repository(format!("database {replica_id} not found on {server}"))
            })?;
        debug!(server, replica_id, "opened source database");
        self.current = Some(idx);
        Ok(())
    }

    async fn document_by_unid(&mut self, unid: &str) -> Result<SourceDocument> {
        let db = self.current_database()?;
        db.documents
            .iter()
            .find(|d| d.document.unid.eq_ignore_ascii_case(unid))
            .map(|d| d.document.clone())
            .ok_or_else(|| CrawlError::DocumentNotFound {
                replica_id: db.replica_id.clone(),
                unid: unid.to_string(),
            })
    }

    async fn evaluate(&mut self, formula: &str, doc: &SourceDocument) -> Result<Vec<String>> {
        self.check_open()?;
        evaluate_formula(formula, doc)
    }

    async fn extract_attachment(
        &mut self,
        doc: &SourceDocument,
        name: &str,
        dest: &Path,
    ) -> Result<()> {
        let db = self.current_database()?;
        let payload = db
            .documents
            .iter()
            .find(|d| d.document.unid == doc.unid)
            .and_then(|d| d.payloads.get(name))
            .ok_or_else(|| CrawlError::attachment(name, "no payload in snapshot"))?;

        tokio::fs::write(dest, payload.as_bytes())
            .await
            .map_err(|e| CrawlError::io(dest, e))
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.current = None;
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Formula evaluation
// ---------------------------------------------------------------------------

/// Evaluate a formula against a document.
///
/// A single term yields its values unchanged; a concatenation joins each
/// term's values with `", "` and yields one string.
pub fn evaluate_formula(formula: &str, doc: &SourceDocument) -> Result<Vec<String>> {
    let formula = formula.trim();
    if formula.is_empty() {
        return Ok(Vec::new());
    }

    let terms = split_terms(formula)?;
    if terms.len() == 1 {
        return evaluate_term(terms[0], doc);
    }

    let mut out = String::new();
    for term in terms {
        out.push_str(&evaluate_term(term, doc)?.join(", "));
    }
    Ok(vec![out])
}

/// Split on `+` outside string literals.
fn split_terms(formula: &str) -> Result<Vec<&str>> {
    let mut terms = Vec::new();
    let mut in_literal = false;
    let mut start = 0;

    for (idx, ch) in formula.char_indices() {
        match ch {
            '"' => in_literal = !in_literal,
            '+' if !in_literal => {
                terms.push(formula[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if in_literal {
        return Err(CrawlError::Repository(format!(
            "unterminated string literal in formula: {formula}"
        )));
    }
    terms.push(formula[start..].trim());

    if terms.iter().any(|t| t.is_empty()) {
        return Err(CrawlError::Repository(format!(
            "empty term in formula: {formula}"
        )));
    }
    Ok(terms)
}

fn evaluate_term(term: &str, doc: &SourceDocument) -> Result<Vec<String>> {
    if let Some(literal) = term
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        return Ok(vec![literal.to_string()]);
    }

    if let Some(function) = term.strip_prefix('@') {
        return match function.to_ascii_lowercase().as_str() {
            "attachmentnames" => Ok(match doc.field("$FILE") {
                Some(files) => files.values.clone(),
                None => doc.attachments.iter().map(|a| a.name.clone()).collect(),
            }),
            "created" => Ok(doc.created.iter().map(|t| t.to_rfc3339()).collect()),
            "modified" => Ok(doc.last_modified.iter().map(|t| t.to_rfc3339()).collect()),
            "author" => Ok(doc.authors.clone()),
            _ => Err(CrawlError::Repository(format!(
                "unsupported formula function: @{function}"
            ))),
        };
    }

    if !term
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '$')
    {
        return Err(CrawlError::Repository(format!(
            "cannot evaluate formula term: {term}"
        )));
    }

    Ok(doc.field(term).map(|f| f.values.clone()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{EmbeddedKind, EmbeddedObject, FieldKind, SourceField};

    fn doc() -> SourceDocument {
        SourceDocument {
            unid: "U1".into(),
            fields: vec![
                SourceField {
                    name: "Subject".into(),
                    kind: FieldKind::Text,
                    values: vec!["Budget".into()],
                },
                SourceField {
                    name: "Tags".into(),
                    kind: FieldKind::Text,
                    values: vec!["a".into(), "b".into()],
                },
            ],
            authors: vec!["CN=Ann/O=Acme".into()],
            attachments: vec![EmbeddedObject {
                name: "report.pdf".into(),
                kind: EmbeddedKind::Attachment,
                size: 10,
            }],
            ..SourceDocument::default()
        }
    }

    #[test]
    fn formula_terms() {
        let d = doc();
        assert_eq!(evaluate_formula("Subject", &d).unwrap(), vec!["Budget"]);
        assert_eq!(evaluate_formula("Tags", &d).unwrap(), vec!["a", "b"]);
        assert!(evaluate_formula("Missing", &d).unwrap().is_empty());
        assert!(evaluate_formula("   ", &d).unwrap().is_empty());
        assert_eq!(
            evaluate_formula("@AttachmentNames", &d).unwrap(),
            vec!["report.pdf"]
        );
        assert_eq!(evaluate_formula("@Author", &d).unwrap(), vec!["CN=Ann/O=Acme"]);
    }

    #[test]
    fn formula_concatenation() {
        let d = doc();
        assert_eq!(
            evaluate_formula(r#""Re: " + Subject + " [" + Tags + "]""#, &d).unwrap(),
            vec!["Re: Budget [a, b]"]
        );
        assert_eq!(evaluate_formula(r#""a+b""#, &d).unwrap(), vec!["a+b"]);
    }

    #[test]
    fn formula_errors() {
        let d = doc();
        assert!(evaluate_formula("@Unknown", &d).is_err());
        assert!(evaluate_formula("Subject +", &d).is_err());
        assert!(evaluate_formula(r#""open"#, &d).is_err());
        assert!(evaluate_formula("@If(x;y;z)", &d).is_err());
    }

    #[tokio::test]
    async fn session_lifecycle_and_lookup() {
        let repo = SnapshotRepository::from_json(
            r#"{"databases":[{"server":"mail1","replica_id":"R1",
                "documents":[{"unid":"U1","payloads":{"a.txt":"hello"}}]}]}"#,
        )
        .expect("parse snapshot");
        assert_eq!(repo.documents().len(), 1);

        let mut session = repo.open_session().await.expect("open session");
        assert_eq!(repo.active_sessions(), 1);
        assert!(session.document_by_unid("U1").await.is_err());

        session.open_database("MAIL1", "R1").await.expect("open db");
        let found = session.document_by_unid("U1").await.expect("doc");
        assert_eq!(found.unid, "U1");
        assert!(matches!(
            session.document_by_unid("U2").await,
            Err(CrawlError::DocumentNotFound { .. })
        ));
        assert!(session.open_database("mail1", "R9").await.is_err());

        let dest =
            std::env::temp_dir().join(format!("nc_snapshot_{}.txt", uuid::Uuid::now_v7()));
        session
            .extract_attachment(&found, "a.txt", &dest)
            .await
            .expect("extract");
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello");
        assert!(
            session
                .extract_attachment(&found, "b.txt", &dest)
                .await
                .is_err()
        );

        session.close().await.expect("close");
        session.close().await.expect("close twice");
        assert_eq!(repo.active_sessions(), 0);
        assert!(session.evaluate("Subject", &found).await.is_err());
    }
}
