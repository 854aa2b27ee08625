//! Error types for notescrawl.
//!
//! Library crates use [`CrawlError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all notescrawl operations.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// No template configuration with the requested name.
    #[error("template not found: {name}")]
    TemplateNotFound { name: String },

    /// The source document referenced by a crawl request does not exist.
    #[error("source document not found: {unid} in replica {replica_id}")]
    DocumentNotFound { replica_id: String, unid: String },

    /// Repository client failure (session, database, formula, extraction).
    #[error("repository error: {0}")]
    Repository(String),

    /// Crawl queue store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Attachment ledger failure.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// Failure while materializing a single attachment.
    #[error("attachment error for {name}: {message}")]
    Attachment { name: String, message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad document id, illegal state change, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CrawlError>;

impl CrawlError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an attachment error scoped to one attachment name.
    pub fn attachment(name: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::Attachment {
            name: name.into(),
            message: msg.to_string(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this failure came from a backing connection (repository
    /// session, queue store, ledger). Such failures tear the worker's
    /// connection down and count towards its backoff.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Repository(_) | Self::Storage(_) | Self::Ledger(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CrawlError::config("missing spool dir");
        assert_eq!(err.to_string(), "config error: missing spool dir");

        let err = CrawlError::TemplateNotFound {
            name: "Discussion".into(),
        };
        assert_eq!(err.to_string(), "template not found: Discussion");

        let err = CrawlError::attachment("report.pdf", "access denied");
        assert!(err.to_string().contains("report.pdf"));
    }

    #[test]
    fn connectivity_classification() {
        assert!(CrawlError::Repository("session closed".into()).is_connectivity());
        assert!(CrawlError::Storage("database is locked".into()).is_connectivity());
        assert!(CrawlError::Ledger("no such table".into()).is_connectivity());
        assert!(!CrawlError::config("bad").is_connectivity());
        assert!(
            !CrawlError::TemplateNotFound {
                name: "T1".into()
            }
            .is_connectivity()
        );
    }
}
