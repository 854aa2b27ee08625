//! Per-worker cache of the current template and form configuration.

use tracing::{debug, info};

use notescrawl_shared::{CrawlError, FormConfig, Result, TemplateConfig};

use crate::rules::{MetaFieldRule, parse_rules};
use crate::store::QueueConnection;

/// Template and form currently in effect for a document.
#[derive(Debug, Clone, Copy)]
pub struct ConfigSelection<'a> {
    pub template: &'a TemplateConfig,
    pub form: Option<&'a FormConfig>,
    pub rules: &'a [MetaFieldRule],
}

impl ConfigSelection<'_> {
    /// Title formula of the form when one is loaded, else of the template.
    pub fn title_formula(&self) -> &str {
        match self.form {
            Some(form) => &form.title_formula,
            None => &self.template.title_formula,
        }
    }

    /// Description formula of the form when one is loaded, else of the template.
    pub fn description_formula(&self) -> &str {
        match self.form {
            Some(form) => &form.description_formula,
            None => &self.template.description_formula,
        }
    }
}

#[derive(Debug)]
struct LoadedTemplate {
    config: TemplateConfig,
    rules: Vec<MetaFieldRule>,
}

/// Caches one template (with its parsed rules) and one form.
///
/// Consecutive documents usually share a template, so a lookup only hits the
/// store when the requested name differs from the loaded one.
#[derive(Debug, Default)]
pub struct ConfigResolver {
    template: Option<LoadedTemplate>,
    /// Index into the loaded template's forms.
    form: Option<usize>,
    loads: u64,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `name` the current template, reloading it on a cache miss.
    pub async fn resolve(&mut self, queue: &dyn QueueConnection, name: &str) -> Result<()> {
        if self
            .template
            .as_ref()
            .is_some_and(|t| t.config.name == name)
        {
            debug!(template = name, "template cache hit");
            return Ok(());
        }

        self.invalidate();
        let config = queue
            .template(name)
            .await?
            .ok_or_else(|| CrawlError::TemplateNotFound {
                name: name.to_string(),
            })?;

        let rules = parse_rules(&config.meta_fields);
        info!(
            template = name,
            rules = rules.len(),
            forms = config.forms.len(),
            "loaded template"
        );
        self.loads += 1;
        self.template = Some(LoadedTemplate { config, rules });
        Ok(())
    }

    /// Make `form_name` the current form of the loaded template. A miss
    /// leaves no form selected.
    pub fn resolve_form(&mut self, form_name: &str) {
        let Some(template) = &self.template else {
            self.form = None;
            return;
        };

        let cached = self
            .form
            .is_some_and(|idx| template.config.forms[idx].alias == form_name);
        if cached {
            return;
        }

        self.form = template
            .config
            .forms
            .iter()
            .position(|f| f.alias == form_name);
        if self.form.is_none() {
            debug!(form = form_name, "no form configuration");
        }
    }

    /// Current selection; `None` until a template has been resolved.
    pub fn selection(&self) -> Option<ConfigSelection<'_>> {
        self.template.as_ref().map(|t| ConfigSelection {
            template: &t.config,
            form: self.form.map(|idx| &t.config.forms[idx]),
            rules: &t.rules,
        })
    }

    /// Drop the cached template, form and rules.
    pub fn invalidate(&mut self) {
        self.template = None;
        self.form = None;
    }

    /// Number of template loads from the store so far.
    pub fn loads(&self) -> u64 {
        self.loads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_storage;

    fn template(name: &str) -> TemplateConfig {
        TemplateConfig {
            name: name.into(),
            meta_fields: vec!["Memo===Subject=subj".into(), "bad=a=b".into()],
            title_formula: "Subject".into(),
            description_formula: "Summary".into(),
            forms: vec![FormConfig {
                alias: "Memo".into(),
                fields_to_index: vec!["Body".into()],
                title_formula: "\"Memo\"".into(),
                description_formula: String::new(),
            }],
        }
    }

    #[tokio::test]
    async fn cache_hit_skips_store() {
        let storage = test_storage().await;
        storage.upsert_template(&template("T1")).await.unwrap();
        storage.upsert_template(&template("T2")).await.unwrap();

        let mut resolver = ConfigResolver::new();
        resolver.resolve(&storage, "T1").await.expect("resolve T1");
        resolver.resolve(&storage, "T1").await.expect("resolve T1 again");
        assert_eq!(resolver.loads(), 1);

        resolver.resolve(&storage, "T2").await.expect("resolve T2");
        assert_eq!(resolver.loads(), 2);
        assert_eq!(resolver.selection().unwrap().template.name, "T2");
        assert_eq!(resolver.selection().unwrap().rules.len(), 2);
    }

    #[tokio::test]
    async fn missing_template_clears_cache() {
        let storage = test_storage().await;
        storage.upsert_template(&template("T1")).await.unwrap();

        let mut resolver = ConfigResolver::new();
        resolver.resolve(&storage, "T1").await.unwrap();
        resolver.resolve_form("Memo");

        let err = resolver.resolve(&storage, "Nope").await.unwrap_err();
        assert!(matches!(err, CrawlError::TemplateNotFound { .. }));
        assert!(resolver.selection().is_none());
    }

    #[tokio::test]
    async fn form_selection_and_formulas() {
        let storage = test_storage().await;
        storage.upsert_template(&template("T1")).await.unwrap();

        let mut resolver = ConfigResolver::new();
        resolver.resolve(&storage, "T1").await.unwrap();

        resolver.resolve_form("Memo");
        let selection = resolver.selection().unwrap();
        assert_eq!(selection.form.unwrap().alias, "Memo");
        assert_eq!(selection.title_formula(), "\"Memo\"");
        assert_eq!(selection.description_formula(), "");

        resolver.resolve_form("Reply");
        let selection = resolver.selection().unwrap();
        assert!(selection.form.is_none());
        assert_eq!(selection.title_formula(), "Subject");
        assert_eq!(selection.description_formula(), "Summary");
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let storage = test_storage().await;
        storage.upsert_template(&template("T1")).await.unwrap();

        let mut resolver = ConfigResolver::new();
        resolver.resolve(&storage, "T1").await.unwrap();
        resolver.invalidate();
        assert!(resolver.selection().is_none());
        resolver.resolve(&storage, "T1").await.unwrap();
        assert_eq!(resolver.loads(), 2);
    }

    #[tokio::test]
    async fn form_alias_is_case_sensitive() {
        let storage = test_storage().await;
        storage.upsert_template(&template("T1")).await.unwrap();

        let mut resolver = ConfigResolver::new();
        resolver.resolve(&storage, "T1").await.unwrap();

        resolver.resolve_form("Memo");
        assert!(resolver.selection().unwrap().form.is_some());
        resolver.resolve_form("MEMO");
        assert!(resolver.selection().unwrap().form.is_none());
    }
}
