//! Core domain types for the crawl queue and its configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{CrawlError, Result};

/// Namespace prefix for extended metadata fields on a crawl record.
pub const META_FIELDS_PREFIX: &str = "x.";

/// Auth type recorded on a crawl request when the source database has no
/// authentication; such documents are public.
pub const AUTH_NONE: &str = "none";

/// MIME type used for attachments whose content is not sent.
pub const DEFAULT_MIME_TYPE: &str = "text/plain";

// ---------------------------------------------------------------------------
// CrawlState / CrawlAction
// ---------------------------------------------------------------------------

/// Lifecycle state of a crawl record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlState {
    /// Waiting in the queue.
    #[default]
    Queued,
    /// Claimed by exactly one worker.
    InCrawl,
    /// Processed and ready for submission.
    Fetched,
    /// Processing failed; left for operator inspection.
    Error,
}

impl CrawlState {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InCrawl => "incrawl",
            Self::Fetched => "fetched",
            Self::Error => "error",
        }
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(&self, next: CrawlState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::InCrawl)
                | (Self::InCrawl, Self::Fetched)
                | (Self::InCrawl, Self::Error)
        )
    }
}

impl std::fmt::Display for CrawlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CrawlState {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "incrawl" => Ok(Self::InCrawl),
            "fetched" => Ok(Self::Fetched),
            "error" => Ok(Self::Error),
            other => Err(CrawlError::validation(format!("unknown crawl state: {other}"))),
        }
    }
}

/// What the downstream index should do with a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlAction {
    #[default]
    Add,
    Delete,
}

impl CrawlAction {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for CrawlAction {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(Self::Add),
            "delete" => Ok(Self::Delete),
            other => Err(CrawlError::validation(format!("unknown crawl action: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// CrawlRecord
// ---------------------------------------------------------------------------

/// A unit of crawl work and, once processed, its normalized output.
///
/// Attachment sub-documents are crawl records too: they inherit every field
/// of their parent and carry the attachment-specific fields below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlRecord {
    /// Universal id of this record in the queue store.
    pub id: String,
    pub state: CrawlState,
    pub action: CrawlAction,

    /// Source server name.
    pub server: String,
    /// Replica id of the source database.
    pub replica_id: String,
    /// Universal id of the source document.
    pub unid: String,
    /// Name of the template configuration to crawl with.
    pub template: String,
    /// Auth type of the source database (see [`AUTH_NONE`]).
    pub auth_type: String,
    /// Native link to the source document, for diagnostics.
    pub notes_link: String,

    /// Stable document id in the downstream index.
    pub doc_id: String,
    pub display_url: String,
    pub form: String,
    pub authors: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub title: String,
    pub description: String,
    /// Effective read ACL; empty means "not restricted at document level".
    pub readers: Vec<String>,
    pub is_public: bool,
    /// Extended metadata, keys carry [`META_FIELDS_PREFIX`].
    pub meta_fields: BTreeMap<String, Vec<String>>,
    /// Indexable text body.
    pub content: String,

    /// Names of attachments that produced a sub-document.
    pub attachment_names: Vec<String>,
    /// Every attachment name reported by the source document.
    pub all_attachment_names: Vec<String>,
    /// Content ids of retained attachments.
    pub attachment_ids: Vec<String>,

    /// Set on attachment sub-documents only.
    pub attachment_file_name: Option<String>,
    pub mime_type: Option<String>,
    pub content_path: Option<PathBuf>,
}

impl CrawlRecord {
    /// A new queued crawl request for one source document.
    pub fn request(
        server: impl Into<String>,
        replica_id: impl Into<String>,
        unid: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            id: new_record_id(),
            server: server.into(),
            replica_id: replica_id.into(),
            unid: unid.into(),
            template: template.into(),
            ..Self::default()
        }
    }

    /// A minimal delete request for a document id, ready for submission.
    pub fn delete_request(doc_id: impl Into<String>) -> Self {
        Self {
            id: new_record_id(),
            state: CrawlState::Fetched,
            action: CrawlAction::Delete,
            doc_id: doc_id.into(),
            ..Self::default()
        }
    }

    /// HTTP URL of the source document; used as both document id and
    /// display URL.
    pub fn http_url(&self, domain: &str) -> String {
        format!(
            "http://{}{}/{}/0/{}",
            self.server, domain, self.replica_id, self.unid
        )
    }

    /// Move to `next`, refusing backward or skipping transitions.
    pub fn transition(&mut self, next: CrawlState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CrawlError::validation(format!(
                "illegal state change {} -> {} for record {}",
                self.state, next, self.id
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Whether an extended metadata field is already populated.
    pub fn has_meta_field(&self, meta_name: &str) -> bool {
        self.meta_fields
            .contains_key(&format!("{META_FIELDS_PREFIX}{meta_name}"))
    }
}

/// Generate a new time-sortable queue record id.
pub fn new_record_id() -> String {
    Uuid::now_v7().simple().to_string().to_uppercase()
}

// ---------------------------------------------------------------------------
// DocId
// ---------------------------------------------------------------------------

/// Parsed document id of the form `http://{host}/{replica}/0/{unid}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocId {
    pub host: String,
    pub replica_id: String,
    pub unid: String,
}

impl std::str::FromStr for DocId {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self> {
        let url = Url::parse(s)
            .map_err(|e| CrawlError::validation(format!("invalid document id {s}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| CrawlError::validation(format!("document id has no host: {s}")))?
            .to_string();
        let segments: Vec<&str> = url
            .path_segments()
            .map(|segs| segs.collect())
            .unwrap_or_default();

        match segments.as_slice() {
            [replica_id, "0", unid] if !replica_id.is_empty() && !unid.is_empty() => Ok(Self {
                host,
                replica_id: replica_id.to_string(),
                unid: unid.to_string(),
            }),
            _ => Err(CrawlError::validation(format!(
                "document id is not of the form http://host/replica/0/unid: {s}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Template / form configuration
// ---------------------------------------------------------------------------

/// Named configuration bundle selected by a crawl request's template name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub name: String,
    /// Raw meta-field rule strings (`form===field=meta`, `field=meta`, `field`).
    #[serde(default)]
    pub meta_fields: Vec<String>,
    /// Formula producing the document title.
    #[serde(default)]
    pub title_formula: String,
    /// Formula producing the document description.
    #[serde(default)]
    pub description_formula: String,
    /// Per-form overrides.
    #[serde(default)]
    pub forms: Vec<FormConfig>,
}

/// Per-form configuration nested under a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormConfig {
    /// Form name this entry applies to.
    pub alias: String,
    /// Fields extracted as content, in order.
    #[serde(default)]
    pub fields_to_index: Vec<String>,
    #[serde(default)]
    pub title_formula: String,
    #[serde(default)]
    pub description_formula: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_are_forward_only() {
        assert!(CrawlState::Queued.can_transition_to(CrawlState::InCrawl));
        assert!(CrawlState::InCrawl.can_transition_to(CrawlState::Fetched));
        assert!(CrawlState::InCrawl.can_transition_to(CrawlState::Error));
        assert!(!CrawlState::Fetched.can_transition_to(CrawlState::Queued));
        assert!(!CrawlState::Error.can_transition_to(CrawlState::InCrawl));
        assert!(!CrawlState::Queued.can_transition_to(CrawlState::Fetched));

        let mut record = CrawlRecord::request("srv", "852578CE004AFDB8", "ABCD", "T1");
        assert!(record.transition(CrawlState::Fetched).is_err());
        record.transition(CrawlState::InCrawl).expect("claim");
        record.transition(CrawlState::Error).expect("fail");
        assert_eq!(record.state, CrawlState::Error);
    }

    #[test]
    fn state_string_roundtrip() {
        for state in [
            CrawlState::Queued,
            CrawlState::InCrawl,
            CrawlState::Fetched,
            CrawlState::Error,
        ] {
            let parsed: CrawlState = state.as_str().parse().expect("parse state");
            assert_eq!(parsed, state);
        }
        assert!("pending".parse::<CrawlState>().is_err());
    }

    #[test]
    fn http_url_and_doc_id_parse() {
        let record = CrawlRecord::request("mail1", "852578CE004AFDB8", "0123ABCD", "T1");
        let url = record.http_url(".example.com");
        assert_eq!(url, "http://mail1.example.com/852578CE004AFDB8/0/0123ABCD");

        let doc_id: DocId = url.parse().expect("parse doc id");
        assert_eq!(doc_id.host, "mail1.example.com");
        assert_eq!(doc_id.replica_id, "852578CE004AFDB8");
        assert_eq!(doc_id.unid, "0123ABCD");
    }

    #[test]
    fn doc_id_rejects_attachment_ids() {
        let attachment = "http://mail1/852578CE004AFDB8/0/0123ABCD/$File/abc";
        assert!(attachment.parse::<DocId>().is_err());
        assert!("not a url".parse::<DocId>().is_err());
    }

    #[test]
    fn delete_request_is_fetched() {
        let req = CrawlRecord::delete_request("http://host/r/0/u/$File/abc");
        assert_eq!(req.state, CrawlState::Fetched);
        assert_eq!(req.action, CrawlAction::Delete);
        assert!(!req.id.is_empty());
    }

    #[test]
    fn record_json_defaults() {
        let parsed: CrawlRecord =
            serde_json::from_str(r#"{"id":"A1","server":"srv","template":"T1"}"#)
                .expect("deserialize sparse record");
        assert_eq!(parsed.state, CrawlState::Queued);
        assert_eq!(parsed.action, CrawlAction::Add);
        assert!(parsed.meta_fields.is_empty());
    }

    #[test]
    fn template_config_from_toml() {
        let toml_str = r#"
name = "Discussion"
meta_fields = ["Memo===Subject=subj", "Category"]
title_formula = "Subject"

[[forms]]
alias = "MainTopic"
fields_to_index = ["Subject", "Body"]
"#;
        let template: TemplateConfig = toml::from_str(toml_str).expect("parse template");
        assert_eq!(template.meta_fields.len(), 2);
        assert_eq!(template.forms[0].alias, "MainTopic");
        assert!(template.forms[0].title_formula.is_empty());
    }
}
