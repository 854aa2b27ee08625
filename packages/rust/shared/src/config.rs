//! Application configuration for notescrawl.
//!
//! User config lives at `~/.notescrawl/notescrawl.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CrawlError, Result};
use crate::types::TemplateConfig;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "notescrawl.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".notescrawl";

// ---------------------------------------------------------------------------
// Config structs (matching notescrawl.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Worker and storage settings.
    #[serde(default)]
    pub connector: ConnectorConfig,

    /// Attachment handling policy.
    #[serde(default)]
    pub attachments: AttachmentPolicyConfig,

    /// Server name -> DNS domain suffix used when building document URLs.
    #[serde(default)]
    pub domains: BTreeMap<String, String>,

    /// Template configurations seeded into the queue store.
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
}

/// `[connector]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Path to the queue database.
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// Spool directory for extracted attachments.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: String,

    /// Number of concurrent crawl workers.
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Workers pause while the spool filesystem has less than this free.
    #[serde(default = "default_min_spool_free_mb")]
    pub min_spool_free_mb: u64,

    /// Upper bound on an idle wait before re-polling the queue.
    #[serde(default = "default_idle_poll_secs")]
    pub idle_poll_secs: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            spool_dir: default_spool_dir(),
            workers: default_workers(),
            min_spool_free_mb: default_min_spool_free_mb(),
            idle_poll_secs: default_idle_poll_secs(),
        }
    }
}

fn default_store_path() -> String {
    "~/.notescrawl/queue.db".into()
}
fn default_spool_dir() -> String {
    "~/.notescrawl/spool".into()
}
fn default_workers() -> u32 {
    2
}
fn default_min_spool_free_mb() -> u64 {
    300
}
fn default_idle_poll_secs() -> u64 {
    60
}

/// `[attachments]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPolicyConfig {
    /// Attachments larger than this are indexed by name only.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Lower-case extensions that never produce a sub-document.
    #[serde(default = "default_excluded_extensions")]
    pub excluded_extensions: Vec<String>,

    /// Lower-case extension -> MIME type. Extensions missing here are
    /// indexed by name only.
    #[serde(default = "default_mime_types")]
    pub mime_types: BTreeMap<String, String>,
}

impl Default for AttachmentPolicyConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            excluded_extensions: default_excluded_extensions(),
            mime_types: default_mime_types(),
        }
    }
}

fn default_max_file_size() -> u64 {
    30 * 1024 * 1024
}
fn default_excluded_extensions() -> Vec<String> {
    ["exe", "dll", "bin", "iso"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_mime_types() -> BTreeMap<String, String> {
    [
        ("pdf", "application/pdf"),
        ("doc", "application/msword"),
        (
            "docx",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ),
        ("xls", "application/vnd.ms-excel"),
        (
            "xlsx",
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ),
        ("ppt", "application/vnd.ms-powerpoint"),
        (
            "pptx",
            "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        ),
        ("rtf", "application/rtf"),
        ("txt", "text/plain"),
        ("htm", "text/html"),
        ("html", "text/html"),
        ("xml", "text/xml"),
    ]
    .iter()
    .map(|(ext, mime)| (ext.to_string(), mime.to_string()))
    .collect()
}

// ---------------------------------------------------------------------------
// Crawl policy (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime policy shared by every crawl worker.
#[derive(Debug, Clone)]
pub struct CrawlPolicy {
    /// Root of the attachment spool.
    pub spool_dir: PathBuf,
    /// Minimum free bytes on the spool filesystem.
    pub min_spool_free_bytes: u64,
    /// Maximum attachment size whose content is sent.
    pub max_file_size: u64,
    /// Lower-case excluded extensions.
    pub excluded_extensions: Vec<String>,
    /// Lower-case extension -> MIME type.
    pub mime_types: BTreeMap<String, String>,
    /// Server name -> domain suffix.
    pub domains: BTreeMap<String, String>,
    /// Upper bound on a single idle wait.
    pub idle_poll: std::time::Duration,
}

impl From<&AppConfig> for CrawlPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            spool_dir: expand_home(&config.connector.spool_dir),
            min_spool_free_bytes: config.connector.min_spool_free_mb.saturating_mul(1_000_000),
            max_file_size: config.attachments.max_file_size,
            excluded_extensions: config
                .attachments
                .excluded_extensions
                .iter()
                .map(|e| e.to_lowercase())
                .collect(),
            mime_types: config
                .attachments
                .mime_types
                .iter()
                .map(|(ext, mime)| (ext.to_lowercase(), mime.clone()))
                .collect(),
            domains: config.domains.clone(),
            idle_poll: std::time::Duration::from_secs(config.connector.idle_poll_secs.max(1)),
        }
    }
}

impl CrawlPolicy {
    /// Whether an extension (any case) is on the exclusion list.
    pub fn is_excluded_extension(&self, ext: &str) -> bool {
        let ext = ext.to_lowercase();
        self.excluded_extensions.iter().any(|e| *e == ext)
    }

    /// MIME type for an extension, if one is configured.
    pub fn mime_type(&self, ext: &str) -> Option<&str> {
        self.mime_types
            .get(&ext.to_lowercase())
            .map(String::as_str)
            .filter(|m| !m.is_empty())
    }

    /// Domain suffix for a server; empty when not configured.
    pub fn domain(&self, server: &str) -> &str {
        self.domains.get(server).map(String::as_str).unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.notescrawl/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| CrawlError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.notescrawl/notescrawl.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CrawlError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| CrawlError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CrawlError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CrawlError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CrawlError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("spool_dir"));
        assert!(toml_str.contains("max_file_size"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.connector.workers, 2);
        assert_eq!(parsed.connector.min_spool_free_mb, 300);
        assert_eq!(parsed.attachments.max_file_size, 30 * 1024 * 1024);
    }

    #[test]
    fn config_with_templates_and_domains() {
        let toml_str = r#"
[connector]
spool_dir = "/tmp/spool"

[domains]
mail1 = ".example.com"

[[templates]]
name = "Discussion"
meta_fields = ["Category"]
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.templates.len(), 1);
        assert_eq!(config.templates[0].name, "Discussion");
        assert_eq!(config.connector.workers, 2);

        let policy = CrawlPolicy::from(&config);
        assert_eq!(policy.spool_dir, PathBuf::from("/tmp/spool"));
        assert_eq!(policy.domain("mail1"), ".example.com");
        assert_eq!(policy.domain("unknown"), "");
    }

    #[test]
    fn policy_lookups_ignore_case() {
        let policy = CrawlPolicy::from(&AppConfig::default());
        assert!(policy.is_excluded_extension("EXE"));
        assert!(!policy.is_excluded_extension("pdf"));
        assert_eq!(policy.mime_type("PDF"), Some("application/pdf"));
        assert_eq!(policy.mime_type("xyz"), None);
        assert_eq!(policy.min_spool_free_bytes, 300_000_000);
    }

    #[test]
    fn huge_spool_floor_saturates() {
        let mut config = AppConfig::default();
        config.connector.min_spool_free_mb = u64::MAX / 1000;
        let policy = CrawlPolicy::from(&config);
        assert_eq!(policy.min_spool_free_bytes, u64::MAX);
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/var/spool"), PathBuf::from("/var/spool"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/spool"), home.join("spool"));
        }
    }
}
