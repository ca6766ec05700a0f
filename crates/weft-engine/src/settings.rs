/*
 * settings.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Layered execution settings.
//!
//! The same [`Settings`] struct is carried at three levels —
//! configuration, template, and per-execution — with every field
//! optional. Effective values cascade execution → template →
//! configuration → built-in default; the environment owns the cascade
//! (and the cache invalidation that mutating a setting triggers).
//!
//! Auto-imports are insertion-ordered: each level's map preserves the
//! order entries were added, which together with the level precedence
//! makes the bootstrap order total.

use std::sync::Arc;

use hashlink::LinkedHashMap;

use crate::error::{AttemptReporter, TemplateErrorHandler};

pub const DEFAULT_LOCALE: &str = "en_US";
pub const DEFAULT_TIME_ZONE: &str = "UTC";
pub const DEFAULT_NUMBER_FORMAT: &str = "number";
pub const DEFAULT_BOOLEAN_FORMAT: &str = "true,false";
pub const DEFAULT_DATE_LIKE_FORMAT: &str = "iso";

#[derive(Clone, Default)]
pub struct Settings {
    pub locale: Option<String>,
    pub time_zone: Option<String>,
    /// Time zone for database-sourced date/times. When unset at every
    /// level, such values use the normal time zone.
    pub sql_time_zone: Option<String>,
    pub number_format: Option<String>,
    /// Two comma-separated words, e.g. `"yes,no"`.
    pub boolean_format: Option<String>,
    pub date_format: Option<String>,
    pub time_format: Option<String>,
    pub datetime_format: Option<String>,
    pub url_escaping_charset: Option<String>,
    /// Whether `process` flushes the sink on successful completion.
    pub auto_flush: Option<bool>,
    /// Whether explicit `import` creates namespaces lazily.
    pub lazy_imports: Option<bool>,
    /// Laziness of auto-imports; falls back to `lazy_imports` when
    /// unset at every level.
    pub lazy_auto_imports: Option<bool>,
    /// Alias → template name, imported before the main template runs.
    pub auto_imports: Option<LinkedHashMap<String, String>>,
    /// Template names included before the main template runs.
    pub auto_includes: Option<Vec<String>>,
    pub error_handler: Option<Arc<dyn TemplateErrorHandler>>,
    pub attempt_reporter: Option<Arc<dyn AttemptReporter>>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_auto_import(&mut self, alias: impl Into<String>, template_name: impl Into<String>) {
        self.auto_imports
            .get_or_insert_with(LinkedHashMap::new)
            .insert(alias.into(), template_name.into());
    }

    pub fn add_auto_include(&mut self, template_name: impl Into<String>) {
        self.auto_includes
            .get_or_insert_with(Vec::new)
            .push(template_name.into());
    }

    pub(crate) fn has_auto_import(&self, alias: &str) -> bool {
        self.auto_imports
            .as_ref()
            .is_some_and(|m| m.contains_key(alias))
    }

    pub(crate) fn has_auto_include(&self, template_name: &str) -> bool {
        self.auto_includes
            .as_ref()
            .is_some_and(|v| v.iter().any(|n| n == template_name))
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("locale", &self.locale)
            .field("time_zone", &self.time_zone)
            .field("sql_time_zone", &self.sql_time_zone)
            .field("number_format", &self.number_format)
            .field("boolean_format", &self.boolean_format)
            .field("date_format", &self.date_format)
            .field("time_format", &self.time_format)
            .field("datetime_format", &self.datetime_format)
            .field("url_escaping_charset", &self.url_escaping_charset)
            .field("auto_flush", &self.auto_flush)
            .field("lazy_imports", &self.lazy_imports)
            .field("lazy_auto_imports", &self.lazy_auto_imports)
            .field("auto_imports", &self.auto_imports)
            .field("auto_includes", &self.auto_includes)
            .field("error_handler", &self.error_handler.is_some())
            .field("attempt_reporter", &self.attempt_reporter.is_some())
            .finish()
    }
}
