//! Shared fixtures for crate tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use notescrawl_shared::{CrawlError, CrawlPolicy, DocId, Result};
use notescrawl_storage::Storage;

use crate::repository::{RepositoryClient, RepositorySession};
use crate::snapshot::SnapshotRepository;
use crate::store::AttachmentLedger;

/// Create a temp file storage for testing.
pub(crate) async fn test_storage() -> Storage {
    let tmp = std::env::temp_dir().join(format!("nc_test_{}.db", Uuid::now_v7()));
    Storage::open(&tmp).await.expect("open test db")
}

/// Policy with a small MIME map (no `txt`), `exe` excluded, no space floor.
pub(crate) fn test_policy(spool: &Path) -> CrawlPolicy {
    CrawlPolicy {
        spool_dir: spool.to_path_buf(),
        min_spool_free_bytes: 0,
        max_file_size: 30 * 1024 * 1024,
        excluded_extensions: vec!["exe".into()],
        mime_types: BTreeMap::from([
            ("pdf".to_string(), "application/pdf".to_string()),
            ("doc".to_string(), "application/msword".to_string()),
        ]),
        domains: BTreeMap::from([("mail1".to_string(), ".acme.com".to_string())]),
        idle_poll: Duration::from_millis(20),
    }
}

const FIXTURE: &str = r#"{
  "databases": [
    {
      "server": "mail1",
      "replica_id": "R1",
      "documents": [
        {
          "unid": "U1",
          "authors": ["CN=Ann/O=Acme"],
          "created": "2024-03-01T10:00:00Z",
          "last_modified": "2024-03-02T11:00:00Z",
          "fields": [
            { "name": "Form", "kind": "text", "values": ["Memo"] },
            { "name": "Subject", "kind": "text", "values": ["Q3 budget"] },
            { "name": "Body", "kind": "rich_text", "values": ["Numbers for the third quarter."] },
            { "name": "$Ref", "kind": "text", "values": ["ABC"] },
            { "name": "DocReaders", "kind": "readers", "values": ["CN=Ann/O=Acme", "[Finance]"] },
            { "name": "DocAuthors", "kind": "authors", "values": ["CN=Bob/O=Acme"] },
            { "name": "$FILE", "kind": "text",
              "values": ["report.pdf", "notes.txt", "big.pdf", "setup.exe", "diagram", "missing.doc"] }
          ],
          "attachments": [
            { "name": "report.pdf", "kind": "attachment", "size": 1024 },
            { "name": "notes.txt", "kind": "attachment", "size": 10 },
            { "name": "big.pdf", "kind": "attachment", "size": 50000000 },
            { "name": "setup.exe", "kind": "attachment", "size": 5 },
            { "name": "diagram", "kind": "ole" }
          ],
          "payloads": {
            "report.pdf": "%PDF-1.4 quarterly",
            "notes.txt": "remember the milk"
          }
        },
        {
          "unid": "U2",
          "fields": [
            { "name": "Form", "kind": "text", "values": ["Reply"] },
            { "name": "Subject", "kind": "text", "values": ["Re: Q3 budget"] }
          ],
          "attachments": [
            { "name": "broken.pdf", "kind": "attachment", "size": 10 },
            { "name": "ok.pdf", "kind": "attachment", "size": 10 }
          ],
          "payloads": { "ok.pdf": "%PDF-1.4 ok" }
        }
      ]
    }
  ]
}"#;

/// Snapshot with a memo carrying every kind of attachment (`U1`) and a
/// reply whose first attachment cannot be extracted (`U2`).
pub(crate) fn fixture_snapshot() -> SnapshotRepository {
    SnapshotRepository::from_json(FIXTURE).expect("valid fixture snapshot")
}

/// Ledger that is always unreachable.
pub(crate) struct FailingLedger;

#[async_trait]
impl AttachmentLedger for FailingLedger {
    async fn attachment_ids(&self, _doc_id: &DocId) -> Result<Vec<String>> {
        Err(CrawlError::Ledger("connection refused".into()))
    }
}

/// Repository whose server is down.
pub(crate) struct DownRepository;

#[async_trait]
impl RepositoryClient for DownRepository {
    async fn open_session(&self) -> Result<Box<dyn RepositorySession>> {
        Err(CrawlError::Repository("server not responding".into()))
    }
}
