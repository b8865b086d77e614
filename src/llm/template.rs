//! Prompt templates
//!
//! Templates are identified as `{component}/{task_type}_{operation}` and
//! contain `{identifier}` placeholders. The store ships a built-in set and
//! can layer a directory of `{component}/{name}.txt` files on top.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::{QuillError, Result};

/// Values substituted into a template
pub type Variables = BTreeMap<String, Value>;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

const BUILTIN: &[(&str, &str)] = &[
    (
        "planner/generic_plan",
        include_str!("../../templates/planner/generic_plan.txt"),
    ),
    (
        "planner/creative_plan",
        include_str!("../../templates/planner/creative_plan.txt"),
    ),
    (
        "worker/generic_execution",
        include_str!("../../templates/worker/generic_execution.txt"),
    ),
    (
        "worker/creative_execution",
        include_str!("../../templates/worker/creative_execution.txt"),
    ),
    (
        "reviewer/generic_review",
        include_str!("../../templates/reviewer/generic_review.txt"),
    ),
    (
        "reviewer/generic_improvement",
        include_str!("../../templates/reviewer/generic_improvement.txt"),
    ),
    (
        "director/generic_integration",
        include_str!("../../templates/director/generic_integration.txt"),
    ),
];

/// A single renderable template
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    id: String,
    body: String,
    required: BTreeSet<String>,
}

impl PromptTemplate {
    /// Parse a template body and record its placeholders
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        let required = PLACEHOLDER
            .captures_iter(&body)
            .map(|c| c[1].to_string())
            .collect();

        Self {
            id: id.into(),
            body,
            required,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Placeholder names the template needs
    pub fn required(&self) -> &BTreeSet<String> {
        &self.required
    }

    /// Substitute every placeholder; all of them must have a value
    pub fn render(&self, variables: &Variables) -> Result<String> {
        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|name| !variables.contains_key(*name))
            .cloned()
            .collect();

        if !missing.is_empty() {
            return Err(QuillError::MissingVariable(missing));
        }

        let rendered = PLACEHOLDER.replace_all(&self.body, |caps: &regex::Captures| {
            variables
                .get(&caps[1])
                .map(format_value)
                .unwrap_or_default()
        });

        Ok(rendered.into_owned())
    }
}

/// Render a value the way prompts expect it
fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .map(|item| format!("- {}", format_value(item)))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(_) => serde_json::to_string_pretty(value).unwrap_or_default(),
        other => other.to_string(),
    }
}

/// Registry of prompt templates keyed by id
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: HashMap<String, PromptTemplate>,
}

impl TemplateStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with the templates compiled into the binary
    pub fn builtin() -> Self {
        let mut store = Self::new();
        for (id, body) in BUILTIN {
            store.register(*id, *body);
        }
        store
    }

    /// Load `{dir}/{component}/{name}.txt` files, replacing same-id entries
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;

        for component in std::fs::read_dir(dir)? {
            let component = component?;
            if !component.file_type()?.is_dir() {
                continue;
            }
            let component_name = component.file_name().to_string_lossy().to_string();

            for entry in std::fs::read_dir(component.path())? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };

                let body = std::fs::read_to_string(&path)?;
                self.register(format!("{}/{}", component_name, stem), body);
                loaded += 1;
            }
        }

        tracing::debug!(dir = %dir.display(), loaded, "loaded templates");
        Ok(loaded)
    }

    /// Add or replace a template
    pub fn register(&mut self, id: impl Into<String>, body: impl Into<String>) {
        let template = PromptTemplate::new(id, body);
        self.templates.insert(template.id.clone(), template);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.templates.contains_key(id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.templates.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Look up a template by id
    pub fn get(&self, id: &str) -> Result<&PromptTemplate> {
        self.templates
            .get(id)
            .ok_or_else(|| QuillError::TemplateNotFound {
                template_id: id.to_string(),
                available: self.ids(),
            })
    }

    /// Pick `{component}/{task_type}_{operation}`, else the generic variant.
    ///
    /// Returns the specific id when neither exists so the lookup error names it.
    pub fn resolve(&self, component: &str, task_type: &str, operation: &str) -> String {
        let specific = format!("{}/{}_{}", component, task_type, operation);
        if self.contains(&specific) {
            return specific;
        }

        let generic = format!("{}/generic_{}", component, operation);
        if self.contains(&generic) {
            generic
        } else {
            specific
        }
    }

    /// Render template `id` with `variables`
    pub fn render(&self, id: &str, variables: &Variables) -> Result<String> {
        self.get(id)?.render(variables)
    }
}
