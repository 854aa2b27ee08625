//! Meta-field rule parsing.
//!
//! A rule copies a source field into an extended metadata field. Three
//! grammars are accepted:
//!
//! - `form===field=meta`: only for documents of `form`
//! - `field=meta`: any form, renamed
//! - `field`: any form, same name

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

static FORM_FIELD_META: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\A(.+)===([^=]+)=([^=]+)\z").expect("valid form===field=meta pattern")
});
static FIELD_META: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A([^=]+)=([^=]+)\z").expect("valid field=meta pattern"));
static FIELD_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A([^=]+)\z").expect("valid field pattern"));

/// A parsed meta-field rule. A rule without a field never applies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaFieldRule {
    form: Option<String>,
    field: Option<String>,
    meta: Option<String>,
}

impl MetaFieldRule {
    /// Parse one rule string. Malformed input yields a rule with no field.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::default();
        }

        if let Some(caps) = FORM_FIELD_META.captures(raw) {
            return Self::from_parts(Some(&caps[1]), &caps[2], &caps[3]);
        }
        if let Some(caps) = FIELD_META.captures(raw) {
            return Self::from_parts(None, &caps[1], &caps[2]);
        }
        if let Some(caps) = FIELD_ONLY.captures(raw) {
            return Self::from_parts(None, &caps[1], &caps[1]);
        }

        warn!(rule = raw, "could not parse meta field rule");
        Self::default()
    }

    fn from_parts(form: Option<&str>, field: &str, meta: &str) -> Self {
        let non_blank = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };
        let rule = Self {
            form: form.and_then(non_blank),
            field: non_blank(field),
            meta: non_blank(meta),
        };
        if rule.field.is_none() || rule.meta.is_none() {
            warn!(rule = %rule, "meta field rule has a blank part");
            return Self::default();
        }
        rule
    }

    pub fn form(&self) -> Option<&str> {
        self.form.as_deref()
    }

    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }

    pub fn meta(&self) -> Option<&str> {
        self.meta.as_deref()
    }

    /// Whether this rule applies to documents of `form`.
    pub fn matches_form(&self, form: &str) -> bool {
        self.form
            .as_deref()
            .is_none_or(|f| f.to_lowercase() == form.to_lowercase())
    }
}

impl std::fmt::Display for MetaFieldRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[form: {}; field: {}; meta: {}]",
            self.form.as_deref().unwrap_or(""),
            self.field.as_deref().unwrap_or(""),
            self.meta.as_deref().unwrap_or("")
        )
    }
}

/// Parse a template's raw rule strings, in order.
pub fn parse_rules(raw: &[String]) -> Vec<MetaFieldRule> {
    raw.iter().map(|r| MetaFieldRule::parse(r)).collect()
}
