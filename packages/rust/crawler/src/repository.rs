//! Repository client boundary.
//!
//! The crawl pipeline never talks to the document repository directly; it
//! goes through a [`RepositorySession`] opened from a [`RepositoryClient`].
//! Each worker owns exactly one session at a time.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use notescrawl_shared::Result;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Factory for repository sessions.
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    /// Open a new session. The caller must [`RepositorySession::close`] it.
    async fn open_session(&self) -> Result<Box<dyn RepositorySession>>;
}

/// One authenticated conversation with the repository.
#[async_trait]
pub trait RepositorySession: Send + Sync {
    /// Make the database with `replica_id` on `server` the current source database.
    async fn open_database(&mut self, server: &str, replica_id: &str) -> Result<()>;

    /// Fetch a document of the current source database by universal id.
    async fn document_by_unid(&mut self, unid: &str) -> Result<SourceDocument>;

    /// Evaluate a formula in the context of `doc`.
    async fn evaluate(&mut self, formula: &str, doc: &SourceDocument) -> Result<Vec<String>>;

    /// Write the bytes of the attachment `name` of `doc` to `dest`.
    async fn extract_attachment(
        &mut self,
        doc: &SourceDocument,
        name: &str,
        dest: &Path,
    ) -> Result<()>;

    /// Release the session.
    async fn close(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Source document model
// ---------------------------------------------------------------------------

/// Value kind of a source field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Numeric,
    DateTime,
    RichText,
    Names,
    Authors,
    Readers,
    Binary,
}

impl FieldKind {
    /// Kinds that carry indexable text.
    pub fn is_textual(&self) -> bool {
        !matches!(self, Self::Binary)
    }
}

/// A named, typed, multi-valued field of a source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceField {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub values: Vec<String>,
}

impl SourceField {
    /// Plain-text rendering of all values, truncated to `max_chars` characters.
    pub fn text(&self, max_chars: usize) -> String {
        let joined = self.values.join("; ");
        match joined.char_indices().nth(max_chars) {
            Some((idx, _)) => joined[..idx].to_string(),
            None => joined,
        }
    }

    /// Whether at least one value is present.
    pub fn has_values(&self) -> bool {
        !self.values.is_empty()
    }
}

/// Type of an embedded object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddedKind {
    /// A file attachment.
    Attachment,
    /// A link to another object.
    ObjectLink,
    /// An embedded OLE object.
    Ole,
}

/// An object embedded in a source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedObject {
    pub name: String,
    pub kind: EmbeddedKind,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
}

/// A document as read from the repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceDocument {
    pub unid: String,
    pub fields: Vec<SourceField>,
    pub authors: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub attachments: Vec<EmbeddedObject>,
}

impl SourceDocument {
    /// First field with `name`, compared case-insensitively.
    pub fn field(&self, name: &str) -> Option<&SourceField> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Value of the `Form` field, or empty.
    pub fn form(&self) -> &str {
        self.field("form")
            .and_then(|f| f.values.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Embedded object with exactly `name`.
    pub fn embedded_object(&self, name: &str) -> Option<&EmbeddedObject> {
        self.attachments.iter().find(|a| a.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, kind: FieldKind, values: &[&str]) -> SourceField {
        SourceField {
            name: name.into(),
            kind,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn text_truncates_on_char_boundary() {
        let f = field("Body", FieldKind::RichText, &["héllo wörld"]);
        assert_eq!(f.text(5), "héllo");
        assert_eq!(f.text(100), "héllo wörld");
        assert_eq!(f.text(0), "");
    }

    #[test]
    fn text_joins_values() {
        let f = field("Category", FieldKind::Text, &["a", "b"]);
        assert_eq!(f.text(2048), "a; b");
    }

    #[test]
    fn field_lookup_is_case_insensitive() {
        let doc = SourceDocument {
            fields: vec![
                field("Form", FieldKind::Text, &["Memo"]),
                field("Subject", FieldKind::Text, &["Hi"]),
            ],
            ..SourceDocument::default()
        };
        assert_eq!(doc.form(), "Memo");
        assert!(doc.field("SUBJECT").is_some());
        assert!(doc.field("Body").is_none());
    }
}
