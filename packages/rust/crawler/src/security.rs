//! Document-level read ACL.

use std::collections::BTreeSet;

use notescrawl_shared::AUTH_NONE;

use crate::repository::{FieldKind, SourceField};

/// Effective readers of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderSecurity {
    /// Lower-cased, sorted, unique. Empty when the document carries no
    /// readers restriction and database security applies.
    pub readers: Vec<String>,
    pub is_public: bool,
}

/// Compute readers from the readers and authors fields of a document.
///
/// Authors only gain read access when some readers field has a value;
/// without readers the document is not restricted at document level.
pub fn compute_readers(fields: &[SourceField], auth_type: &str) -> ReaderSecurity {
    let mut readers = BTreeSet::new();
    let mut authors = BTreeSet::new();
    let mut has_readers = false;

    for field in fields {
        match field.kind {
            FieldKind::Readers => {
                for value in &field.values {
                    readers.insert(value.to_lowercase());
                    has_readers = true;
                }
            }
            FieldKind::Authors => {
                authors.extend(field.values.iter().map(|v| v.to_lowercase()));
            }
            _ => {}
        }
    }

    if has_readers {
        readers.extend(authors);
    }

    ReaderSecurity {
        readers: readers.into_iter().collect(),
        is_public: auth_type == AUTH_NONE,
    }
}
