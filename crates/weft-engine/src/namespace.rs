/*
 * namespace.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Namespaces: named variable scopes tied to templates.
//!
//! Every execution has a main namespace, a globals namespace, and one
//! namespace per imported library. Namespaces are per-execution and
//! single-threaded, so they are shared as `Rc<RefCell<..>>`; the
//! associated [`Template`] is a non-owning handle to the shared,
//! immutable template.
//!
//! A namespace created by a lazy import records what to load and stays
//! empty until first accessed *through the environment* — the engine is
//! needed to execute the library's top level, so forcing lives in
//! [`crate::environment::Environment`], not here. The raw accessors on
//! [`NamespaceData`] never force.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::template::Template;
use crate::value::Value;

pub type NamespaceRef = Rc<RefCell<NamespaceData>>;

/// Lazy-initialization lifecycle of an imported namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    Uninitialized,
    /// Initialization is running; accesses from inside it see the
    /// namespace as-is instead of recursing.
    Initializing,
    Initialized,
    /// Initialization failed once; it is never retried.
    Failed,
}

/// What a lazily imported namespace needs in order to initialize later.
///
/// The locale and template lookup condition are snapshotted at import
/// time so that a later `set_locale` cannot change which template
/// variant the import resolves to.
#[derive(Debug)]
pub(crate) struct LazyInit {
    pub template_name: String,
    pub locale: String,
    pub lookup_condition: Option<String>,
    pub status: InitStatus,
}

#[derive(Debug, Default)]
pub struct NamespaceData {
    map: HashMap<String, Value>,
    template: Option<Arc<Template>>,
    pub(crate) lazy: Option<LazyInit>,
}

impl NamespaceData {
    /// An eagerly usable namespace, optionally tied to a template.
    pub fn new(template: Option<Arc<Template>>) -> NamespaceRef {
        Rc::new(RefCell::new(Self {
            map: HashMap::new(),
            template,
            lazy: None,
        }))
    }

    pub(crate) fn new_lazy(
        template_name: String,
        locale: String,
        lookup_condition: Option<String>,
    ) -> NamespaceRef {
        Rc::new(RefCell::new(Self {
            map: HashMap::new(),
            template: None,
            lazy: Some(LazyInit {
                template_name,
                locale,
                lookup_condition,
                status: InitStatus::Uninitialized,
            }),
        }))
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.map.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn put(&mut self, name: impl Into<String>, value: Value) {
        self.map.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.map.remove(name)
    }

    pub fn keys(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The template this namespace belongs to, when it has one. The
    /// globals namespace and not-yet-initialized lazy namespaces have
    /// none; callers fall back to the main template.
    pub fn template(&self) -> Option<Arc<Template>> {
        self.template.clone()
    }

    pub(crate) fn set_template(&mut self, template: Arc<Template>) {
        debug_assert!(self.template.is_none(), "namespace template set twice");
        self.template = Some(template);
    }

    pub(crate) fn status(&self) -> InitStatus {
        match &self.lazy {
            None => InitStatus::Initialized,
            Some(l) => l.status,
        }
    }

    pub(crate) fn set_status(&mut self, status: InitStatus) {
        if let Some(l) = self.lazy.as_mut() {
            l.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_basic_map_operations() {
        let ns = NamespaceData::new(None);
        ns.borrow_mut().put("x", Value::from(1.0));
        ns.borrow_mut().put("y", Value::from("s"));
        assert_eq!(ns.borrow().len(), 2);
        assert_eq!(ns.borrow().get("x"), Some(Value::from(1.0)));
        assert!(ns.borrow().contains("y"));
        assert_eq!(ns.borrow_mut().remove("x"), Some(Value::from(1.0)));
        assert!(!ns.borrow().contains("x"));
        assert!(!ns.borrow().is_empty());
    }

    #[test]
    fn test_eager_namespace_is_initialized() {
        let ns = NamespaceData::new(None);
        assert_eq!(ns.borrow().status(), InitStatus::Initialized);
    }

    #[test]
    fn test_lazy_namespace_starts_uninitialized() {
        let ns = NamespaceData::new_lazy("lib.wft".to_string(), "en_US".to_string(), None);
        assert_eq!(ns.borrow().status(), InitStatus::Uninitialized);
        assert!(ns.borrow().template().is_none());
        ns.borrow_mut().set_status(InitStatus::Failed);
        assert_eq!(ns.borrow().status(), InitStatus::Failed);
    }
}
