/*
 * template.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Templates, the engine-level configuration, and template resolution.
//!
//! A [`Template`] is an immutable parsed tree plus template-level
//! settings; it is shared behind `Arc` and never mutated by execution.
//! A [`Configuration`] is the engine-level collaborator shared by every
//! execution: default settings, shared variables, the template resolver,
//! custom format factories, and the per-configuration custom state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::custom_state::SharedStateStore;
use crate::error::EngineResult;
use crate::formats::{DateTimeFormatFactory, NumberFormatFactory};
use crate::node::{Node, NodeKind};
use crate::settings::Settings;
use crate::value::Value;

/// A parsed template.
#[derive(Debug)]
pub struct Template {
    name: String,
    source_name: Option<String>,
    root: Arc<Node>,
    /// Every macro/function definition node in the tree, in source
    /// order. Importing a template's macros walks this list.
    macros: Vec<Arc<Node>>,
    settings: Settings,
    /// Prefix → namespace URI declarations, for node-handler dispatch.
    prefix_to_uri: HashMap<String, String>,
    /// Opaque hint forwarded to the resolver on includes/imports made
    /// from this template.
    lookup_condition: Option<String>,
}

impl Template {
    pub fn new(name: impl Into<String>, root: Arc<Node>) -> Self {
        let mut macros = Vec::new();
        collect_macros(&root, &mut macros);
        Self {
            name: name.into(),
            source_name: None,
            root,
            macros,
            settings: Settings::default(),
            prefix_to_uri: HashMap::new(),
            lookup_condition: None,
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_source_name(mut self, source_name: impl Into<String>) -> Self {
        self.source_name = Some(source_name.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Self {
        self.prefix_to_uri.insert(prefix.into(), uri.into());
        self
    }

    pub fn with_lookup_condition(mut self, condition: impl Into<String>) -> Self {
        self.lookup_condition = Some(condition.into());
        self
    }

    /// The name the template was resolved under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name for error messages; falls back to the lookup name.
    pub fn source_name(&self) -> &str {
        self.source_name.as_deref().unwrap_or(&self.name)
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    pub fn macros(&self) -> &[Arc<Node>] {
        &self.macros
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn lookup_condition(&self) -> Option<&str> {
        self.lookup_condition.as_deref()
    }

    pub fn prefix_for_namespace_uri(&self, uri: &str) -> Option<&str> {
        self.prefix_to_uri
            .iter()
            .find(|(_, u)| u.as_str() == uri)
            .map(|(p, _)| p.as_str())
    }

    pub fn namespace_uri_for_prefix(&self, prefix: &str) -> Option<&str> {
        self.prefix_to_uri.get(prefix).map(String::as_str)
    }
}

fn collect_macros(node: &Arc<Node>, out: &mut Vec<Arc<Node>>) {
    if let NodeKind::MacroOrFunction(_) = &node.kind {
        out.push(node.clone());
    }
    match &node.kind {
        NodeKind::Block(children) => {
            for child in children {
                collect_macros(child, out);
            }
        }
        NodeKind::Conditional {
            branches,
            else_branch,
        } => {
            for (_, body) in branches {
                for child in body {
                    collect_macros(child, out);
                }
            }
            if let Some(body) = else_branch {
                for child in body {
                    collect_macros(child, out);
                }
            }
        }
        NodeKind::List { body, .. } => {
            for child in body {
                collect_macros(child, out);
            }
        }
        NodeKind::MacroOrFunction(def) => {
            for child in &def.body {
                collect_macros(child, out);
            }
        }
        NodeKind::Call(site) => {
            for child in &site.nested_content {
                collect_macros(child, out);
            }
        }
        NodeKind::AttemptRecover {
            attempted,
            recovery,
        } => {
            collect_macros(attempted, out);
            for child in recovery {
                collect_macros(child, out);
            }
        }
        _ => {}
    }
}

/// Strips the leading slash of root-based template names so that
/// `"lib/util.wft"` and `"/lib/util.wft"` refer to the same registry
/// entry.
pub(crate) fn normalize_template_name(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

/// Resolves template names to templates.
///
/// `locale` and `lookup_condition` let implementations serve localized
/// or otherwise specialized template variants; the engine passes the
/// effective locale and the including template's lookup condition.
pub trait TemplateResolver: Send + Sync {
    fn resolve(
        &self,
        name: &str,
        locale: &str,
        lookup_condition: Option<&str>,
    ) -> EngineResult<Option<Arc<Template>>>;
}

/// Resolver backed by an in-memory map, ignoring locale and condition.
#[derive(Debug, Default)]
pub struct MemoryTemplateResolver {
    templates: HashMap<String, Arc<Template>>,
}

impl MemoryTemplateResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, template: Template) -> &mut Self {
        self.templates
            .insert(template.name().to_string(), Arc::new(template));
        self
    }
}

impl TemplateResolver for MemoryTemplateResolver {
    fn resolve(
        &self,
        name: &str,
        _locale: &str,
        _lookup_condition: Option<&str>,
    ) -> EngineResult<Option<Arc<Template>>> {
        Ok(self.templates.get(normalize_template_name(name)).cloned())
    }
}

/// Resolver that never finds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTemplateResolver;

impl TemplateResolver for NullTemplateResolver {
    fn resolve(
        &self,
        _name: &str,
        _locale: &str,
        _lookup_condition: Option<&str>,
    ) -> EngineResult<Option<Arc<Template>>> {
        Ok(None)
    }
}

/// Engine-level shared state. Built once, then shared (behind `Arc`)
/// by every execution; everything in it is immutable after construction
/// except the keyed custom state store, which is synchronized.
pub struct Configuration {
    settings: Settings,
    /// Shared variables are stored as plain data so the configuration
    /// stays `Send + Sync`; they are wrapped into [`Value`]s on access.
    shared_variables: HashMap<String, serde_json::Value>,
    resolver: Arc<dyn TemplateResolver>,
    custom_number_formats: HashMap<String, Arc<dyn NumberFormatFactory>>,
    custom_date_formats: HashMap<String, Arc<dyn DateTimeFormatFactory>>,
    custom_state: SharedStateStore,
}

impl Configuration {
    pub fn new(resolver: Arc<dyn TemplateResolver>) -> Self {
        Self {
            settings: Settings::default(),
            shared_variables: HashMap::new(),
            resolver,
            custom_number_formats: HashMap::new(),
            custom_date_formats: HashMap::new(),
            custom_state: SharedStateStore::default(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn set_shared_variable(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.shared_variables.insert(name.into(), value);
    }

    /// Shared variable wrapped into the runtime value model.
    pub fn wrapped_shared_variable(&self, name: &str) -> Option<Value> {
        self.shared_variables.get(name).cloned().map(Value::from)
    }

    pub fn shared_variable_names(&self) -> impl Iterator<Item = &str> {
        self.shared_variables.keys().map(String::as_str)
    }

    pub fn resolver(&self) -> &Arc<dyn TemplateResolver> {
        &self.resolver
    }

    pub fn register_number_format(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn NumberFormatFactory>,
    ) {
        self.custom_number_formats.insert(name.into(), factory);
    }

    pub fn register_date_format(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn DateTimeFormatFactory>,
    ) {
        self.custom_date_formats.insert(name.into(), factory);
    }

    pub(crate) fn custom_number_format(&self, name: &str) -> Option<&Arc<dyn NumberFormatFactory>> {
        self.custom_number_formats.get(name)
    }

    pub(crate) fn custom_date_format(&self, name: &str) -> Option<&Arc<dyn DateTimeFormatFactory>> {
        self.custom_date_formats.get(name)
    }

    /// The per-configuration custom state store, shared by all engines
    /// created from this configuration.
    pub fn custom_state(&self) -> &SharedStateStore {
        &self.custom_state
    }
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("settings", &self.settings)
            .field("shared_variables", &self.shared_variables.len())
            .field("custom_number_formats", &self.custom_number_formats.len())
            .field("custom_date_formats", &self.custom_date_formats.len())
            .finish()
    }
}
