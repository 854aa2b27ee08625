//! Indexable body text of a source document.

use notescrawl_shared::FormConfig;

use crate::repository::SourceDocument;

/// Each content field is rendered up to this many characters.
pub const CONTENT_FIELD_LIMIT: usize = 2 * 1024 * 1024;

/// Reserved system fields start with `$`; the form name is never content.
fn is_reserved(name: &str) -> bool {
    name.is_empty() || name.starts_with('$') || name.eq_ignore_ascii_case("form")
}

/// Build the content body.
///
/// With a form configuration only its listed fields are used, in order; a
/// listed field missing from the document still contributes its newline.
/// Without one, every textual field is used once, in document order.
pub fn extract_content(source: &SourceDocument, form: Option<&FormConfig>) -> String {
    let mut content = String::new();

    match form {
        Some(form) => {
            for name in form.fields_to_index.iter().filter(|n| !is_reserved(n)) {
                content.push('\n');
                if let Some(field) = source.field(name) {
                    content.push_str(&field.text(CONTENT_FIELD_LIMIT));
                }
            }
        }
        None => {
            let mut seen: Vec<String> = Vec::new();
            for field in &source.fields {
                if is_reserved(&field.name) || !field.kind.is_textual() {
                    continue;
                }
                let key = field.name.to_lowercase();
                if seen.contains(&key) {
                    continue;
                }
                seen.push(key);

                content.push('\n');
                content.push_str(&field.text(CONTENT_FIELD_LIMIT));
            }
        }
    }

    content
}
