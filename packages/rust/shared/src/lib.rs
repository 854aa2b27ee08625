//! Shared types, error model, and configuration for notescrawl.
//!
//! This crate is the foundation depended on by all other notescrawl crates.
//! It provides:
//! - [`CrawlError`]: the unified error type
//! - Domain types ([`CrawlRecord`], [`CrawlState`], [`DocId`], [`TemplateConfig`])
//! - Configuration ([`AppConfig`], [`CrawlPolicy`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, AttachmentPolicyConfig, ConnectorConfig, CrawlPolicy, config_dir, config_file_path,
    expand_home, init_config, load_config, load_config_from,
};
pub use error::{CrawlError, Result};
pub use types::{
    AUTH_NONE, CrawlAction, CrawlRecord, CrawlState, DEFAULT_MIME_TYPE, DocId, FormConfig,
    META_FIELDS_PREFIX, TemplateConfig, new_record_id,
};
