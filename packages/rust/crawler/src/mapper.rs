//! Mapping of source document fields onto a crawl record.

use tracing::{debug, trace, warn};

use notescrawl_shared::{CrawlRecord, META_FIELDS_PREFIX};

use crate::repository::{FieldKind, RepositorySession, SourceDocument};
use crate::resolver::ConfigSelection;
use crate::rules::MetaFieldRule;

/// Rich-text meta fields are rendered up to this many characters.
pub const META_RICH_TEXT_LIMIT: usize = 2 * 1024;

// ---------------------------------------------------------------------------
// Standard fields
// ---------------------------------------------------------------------------

/// Copy document id, display URL, form, authors and timestamps.
pub fn map_standard_fields(record: &mut CrawlRecord, source: &SourceDocument, domain: &str) {
    let http_url = record.http_url(domain);
    record.doc_id = http_url.clone();
    record.display_url = http_url;
    record.form = source.form().to_string();
    record.authors = source.authors.clone();
    record.created = source.created;
    record.last_modified = source.last_modified;
}

// ---------------------------------------------------------------------------
// Title and description
// ---------------------------------------------------------------------------

/// Result of evaluating one formula-backed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormulaOutcome {
    /// The formula produced a non-empty first value.
    Evaluated,
    /// No formula configured, or it produced nothing; the field is empty.
    Blank,
    /// Evaluation failed; the field is empty.
    Failed(String),
}

/// Evaluate the title and description formulas of the current selection.
///
/// Failures fall back to the empty string and are reported, never raised.
pub async fn map_title_and_description(
    record: &mut CrawlRecord,
    source: &SourceDocument,
    selection: &ConfigSelection<'_>,
    session: &mut dyn RepositorySession,
) -> (FormulaOutcome, FormulaOutcome) {
    let (title, title_outcome) =
        evaluate_field(session, selection.title_formula(), source, "title").await;
    let (description, description_outcome) =
        evaluate_field(session, selection.description_formula(), source, "description").await;

    record.title = title;
    record.description = description;
    (title_outcome, description_outcome)
}

async fn evaluate_field(
    session: &mut dyn RepositorySession,
    formula: &str,
    source: &SourceDocument,
    item: &str,
) -> (String, FormulaOutcome) {
    if formula.trim().is_empty() {
        return (String::new(), FormulaOutcome::Blank);
    }

    match session.evaluate(formula, source).await {
        Ok(values) => match values.into_iter().next() {
            Some(first) if !first.is_empty() => (first, FormulaOutcome::Evaluated),
            _ => (String::new(), FormulaOutcome::Blank),
        },
        Err(e) => {
            warn!(item, formula, error = %e, "unable to evaluate formula");
            (String::new(), FormulaOutcome::Failed(e.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Meta fields
// ---------------------------------------------------------------------------

/// Why a meta-field rule did not write anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaSkip {
    /// The rule failed to parse.
    NoFieldName,
    /// The rule is scoped to another form.
    FormMismatch { expected: String, actual: String },
    /// The source document has no such field.
    MissingField,
    /// The field exists but carries no values.
    NoValues,
    /// An earlier rule already wrote the destination.
    AlreadyMapped,
}

/// Per-rule outcome of [`map_meta_fields`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaFieldReport {
    /// Destination keys written, in rule order.
    pub mapped: Vec<String>,
    /// Rules skipped, rendered with their reason.
    pub skipped: Vec<(String, MetaSkip)>,
}

/// Apply meta-field rules in order. The first rule to write a destination
/// wins.
pub fn map_meta_fields(
    record: &mut CrawlRecord,
    source: &SourceDocument,
    rules: &[MetaFieldRule],
) -> MetaFieldReport {
    let mut report = MetaFieldReport::default();

    for rule in rules {
        let (Some(field_name), Some(meta)) = (rule.field(), rule.meta()) else {
            trace!("skipping rule without field name");
            report.skipped.push((rule.to_string(), MetaSkip::NoFieldName));
            continue;
        };

        if !rule.matches_form(source.form()) {
            trace!(rule = %rule, form = source.form(), "rule is for another form");
            report.skipped.push((
                rule.to_string(),
                MetaSkip::FormMismatch {
                    expected: rule.form().unwrap_or_default().to_string(),
                    actual: source.form().to_string(),
                },
            ));
            continue;
        }

        let Some(field) = source.field(field_name) else {
            trace!(field = field_name, "source document lacks field");
            report.skipped.push((rule.to_string(), MetaSkip::MissingField));
            continue;
        };

        if !field.has_values() {
            trace!(field = field_name, "source field has no value");
            report.skipped.push((rule.to_string(), MetaSkip::NoValues));
            continue;
        }

        let values = if field.kind == FieldKind::RichText {
            vec![field.text(META_RICH_TEXT_LIMIT)]
        } else {
            field.values.clone()
        };

        let key = format!("{META_FIELDS_PREFIX}{meta}");
        if record.meta_fields.contains_key(&key) {
            warn!(meta, "meta field already exists in crawl record");
            report.skipped.push((rule.to_string(), MetaSkip::AlreadyMapped));
            continue;
        }

        debug!(meta_field = %key, "mapped meta field");
        record.meta_fields.insert(key.clone(), values);
        report.mapped.push(key);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{RepositoryClient, SourceField};
    use crate::resolver::ConfigResolver;
    use crate::rules::parse_rules;
    use crate::snapshot::SnapshotRepository;
    use crate::content::extract_content;
    use crate::testing::{fixture_snapshot, test_storage};
    use notescrawl_shared::{FormConfig, TemplateConfig};

    fn field(name: &str, kind: FieldKind, values: &[&str]) -> SourceField {
        SourceField {
            name: name.into(),
            kind,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn memo() -> SourceDocument {
        SourceDocument {
            unid: "U1".into(),
            fields: vec![
                field("Form", FieldKind::Text, &["Memo"]),
                field("Subject", FieldKind::Text, &["Q3 budget"]),
                field("Topic", FieldKind::Text, &["Finance"]),
                field("Body", FieldKind::RichText, &["x".repeat(5000).as_str()]),
                field("Empty", FieldKind::Text, &[]),
            ],
            authors: vec!["CN=Ann/O=Acme".into()],
            ..SourceDocument::default()
        }
    }

    #[test]
    fn standard_fields_use_http_url() {
        let mut record = CrawlRecord::request("mail1", "R1", "U1", "T1");
        map_standard_fields(&mut record, &memo(), ".acme.com");
        assert_eq!(record.doc_id, "http://mail1.acme.com/R1/0/U1");
        assert_eq!(record.display_url, record.doc_id);
        assert_eq!(record.form, "Memo");
        assert_eq!(record.authors, vec!["CN=Ann/O=Acme"]);
    }

    #[test]
    fn form_scoped_rule_maps_subject() {
        let mut record = CrawlRecord::request("mail1", "R1", "U1", "T1");
        let rules = parse_rules(&["Memo===Subject=subj".into()]);
        let report = map_meta_fields(&mut record, &memo(), &rules);
        assert_eq!(report.mapped, vec!["x.subj"]);
        assert_eq!(record.meta_fields["x.subj"], vec!["Q3 budget"]);

        let mut reply = memo();
        reply.fields[0] = field("Form", FieldKind::Text, &["Reply"]);
        let mut record = CrawlRecord::request("mail1", "R1", "U1", "T1");
        let report = map_meta_fields(&mut record, &reply, &rules);
        assert!(record.meta_fields.is_empty());
        assert!(matches!(
            report.skipped[0].1,
            MetaSkip::FormMismatch { .. }
        ));
    }

    #[test]
    fn first_rule_wins_and_skips_are_reported() {
        let mut record = CrawlRecord::request("mail1", "R1", "U1", "T1");
        let rules = parse_rules(&[
            "Subject=topic".into(),
            "Topic=topic".into(),
            "a=b=c".into(),
            "Missing".into(),
            "Empty".into(),
            "Body".into(),
        ]);
        let report = map_meta_fields(&mut record, &memo(), &rules);

        assert_eq!(record.meta_fields["x.topic"], vec!["Q3 budget"]);
        assert_eq!(report.mapped, vec!["x.topic", "x.Body"]);
        let reasons: Vec<&MetaSkip> = report.skipped.iter().map(|(_, r)| r).collect();
        assert_eq!(
            reasons,
            vec![
                &MetaSkip::AlreadyMapped,
                &MetaSkip::NoFieldName,
                &MetaSkip::MissingField,
                &MetaSkip::NoValues,
            ]
        );
        assert_eq!(
            record.meta_fields["x.Body"][0].chars().count(),
            META_RICH_TEXT_LIMIT
        );
    }

    #[test]
    fn meta_mapping_is_deterministic() {
        let rules = parse_rules(&["Subject=subj".into(), "Topic".into()]);
        let mut first = CrawlRecord::request("mail1", "R1", "U1", "T1");
        let mut second = first.clone();
        map_meta_fields(&mut first, &memo(), &rules);
        map_meta_fields(&mut second, &memo(), &rules);
        assert_eq!(first.meta_fields, second.meta_fields);

        // Re-running on an already mapped record changes nothing.
        let snapshot = first.meta_fields.clone();
        map_meta_fields(&mut first, &memo(), &rules);
        assert_eq!(first.meta_fields, snapshot);
    }

    #[tokio::test]
    async fn title_formula_failure_falls_back_to_empty() {
        let storage = test_storage().await;
        storage
            .upsert_template(&TemplateConfig {
                name: "T1".into(),
                title_formula: "Subject".into(),
                description_formula: "@NoSuchFunction".into(),
                forms: vec![FormConfig {
                    alias: "Memo".into(),
                    title_formula: "\"Memo: \" + Subject".into(),
                    ..FormConfig::default()
                }],
                ..TemplateConfig::default()
            })
            .await
            .unwrap();

        let repo = SnapshotRepository::from_json(r#"{"databases":[]}"#).unwrap();
        let mut session = repo.open_session().await.unwrap();
        let mut resolver = ConfigResolver::new();
        resolver.resolve(&storage, "T1").await.unwrap();

        let source = memo();
        let mut record = CrawlRecord::request("mail1", "R1", "U1", "T1");
        let selection = resolver.selection().unwrap();
        let (title, description) =
            map_title_and_description(&mut record, &source, &selection, session.as_mut()).await;
        assert_eq!(record.title, "Q3 budget");
        assert_eq!(title, FormulaOutcome::Evaluated);
        assert!(record.description.is_empty());
        assert!(matches!(description, FormulaOutcome::Failed(_)));

        resolver.resolve_form("Memo");
        let selection = resolver.selection().unwrap();
        let (_, description) =
            map_title_and_description(&mut record, &source, &selection, session.as_mut()).await;
        assert_eq!(record.title, "Memo: Q3 budget");
        assert_eq!(description, FormulaOutcome::Blank);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn mapping_and_content_are_idempotent() {
        let storage = test_storage().await;
        storage
            .upsert_template(&TemplateConfig {
                name: "T1".into(),
                title_formula: "Subject".into(),
                description_formula: "\"Budget memo\"".into(),
                ..TemplateConfig::default()
            })
            .await
            .unwrap();

        let repo = fixture_snapshot();
        let mut session = repo.open_session().await.unwrap();
        session.open_database("mail1", "R1").await.unwrap();
        let source = session.document_by_unid("U1").await.unwrap();

        let mut resolver = ConfigResolver::new();
        resolver.resolve(&storage, "T1").await.unwrap();
        resolver.resolve_form(source.form());
        let selection = resolver.selection().unwrap();

        let mut first = CrawlRecord::request("mail1", "R1", "U1", "T1");
        let mut second = first.clone();
        for record in [&mut first, &mut second] {
            map_standard_fields(record, &source, ".acme.com");
            map_title_and_description(record, &source, &selection, session.as_mut()).await;
            record.content = extract_content(&source, selection.form);
        }
        let mapped = serde_json::to_string(&first).unwrap();
        assert_eq!(mapped, serde_json::to_string(&second).unwrap());
        assert!(first.content.contains("third quarter"));

        map_standard_fields(&mut first, &source, ".acme.com");
        map_title_and_description(&mut first, &source, &selection, session.as_mut()).await;
        first.content = extract_content(&source, selection.form);
        assert_eq!(serde_json::to_string(&first).unwrap(), mapped);
        session.close().await.unwrap();
    }
}
