/*
 * custom_state.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Keyed custom state at three lifetimes.
//!
//! Extensions attach state to the engine without the engine knowing the
//! concrete types involved:
//!
//! - **per-node**: one memoized payload on a template tree node, shared
//!   by every execution of that template (synchronized, double-checked);
//! - **per-execution**: keyed storage on one engine instance
//!   (single-threaded, plain map);
//! - **per-configuration**: keyed storage shared by every engine created
//!   from one configuration (mutex-protected).

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::TemplateError;
use crate::node::Node;

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

fn next_identity() -> u64 {
    NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed)
}

/// Identity key for per-execution and per-configuration state.
///
/// Each key value is unique; two keys created with the same name are
/// still distinct. The initializer runs on first access per store.
pub struct CustomStateKey<T> {
    id: u64,
    name: &'static str,
    init: fn() -> T,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CustomStateKey<T> {
    pub fn new(name: &'static str, init: fn() -> T) -> Self {
        Self {
            id: next_identity(),
            name,
            init,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> std::fmt::Debug for CustomStateKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomStateKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Per-execution keyed storage. Values live as long as the engine.
#[derive(Debug, Default)]
pub(crate) struct ExecutionStateStore {
    entries: HashMap<u64, Rc<dyn Any>>,
}

impl ExecutionStateStore {
    pub(crate) fn get_or_create<T: 'static>(&mut self, key: &CustomStateKey<T>) -> Rc<T> {
        let entry = self
            .entries
            .entry(key.id)
            .or_insert_with(|| Rc::new((key.init)()));
        match entry.clone().downcast::<T>() {
            Ok(v) => v,
            Err(_) => unreachable!("key identity guarantees the stored type"),
        }
    }
}

/// Per-configuration keyed storage, shared by every engine built from
/// the configuration. Creation races are serialized by the mutex; the
/// first access creates, later accesses observe the same value.
#[derive(Debug, Default)]
pub struct SharedStateStore {
    entries: Mutex<HashMap<u64, Arc<dyn Any + Send + Sync>>>,
}

impl SharedStateStore {
    pub fn get_or_create<T: Send + Sync + 'static>(&self, key: &CustomStateKey<T>) -> Arc<T> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry(key.id)
            .or_insert_with(|| Arc::new((key.init)()));
        match entry.clone().downcast::<T>() {
            Ok(v) => v,
            Err(_) => unreachable!("key identity guarantees the stored type"),
        }
    }
}

/// Identity of a per-node custom data provider. A cached payload is
/// only reused when it was produced for the same provider identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderIdentity(u64);

impl ProviderIdentity {
    pub fn new() -> Self {
        Self(next_identity())
    }
}

impl Default for ProviderIdentity {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct NodeCustomData {
    provider: u64,
    value: Arc<dyn Any + Send + Sync>,
}

/// The memoization slot carried by every template tree node.
#[derive(Debug, Default)]
pub(crate) struct NodeDataSlot {
    slot: RwLock<Option<NodeCustomData>>,
}

pub type CustomDataSupplier<T> =
    Box<dyn FnOnce() -> Result<Option<T>, Box<dyn std::error::Error + Send + Sync>>>;

impl Node {
    /// Get this node's memoized payload for `provider`, computing it on
    /// first access. Read path is lock-shared; the slow path re-checks
    /// under the write lock so the supplier runs at most once per
    /// provider change.
    pub fn get_or_create_custom_data<T: Send + Sync + 'static>(
        &self,
        provider: &ProviderIdentity,
        supplier: CustomDataSupplier<T>,
    ) -> Result<Arc<T>, TemplateError> {
        {
            let guard = self
                .custom_data
                .slot
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(data) = guard.as_ref() {
                if data.provider == provider.0 {
                    if let Ok(v) = data.value.clone().downcast::<T>() {
                        return Ok(v);
                    }
                }
            }
        }

        let mut guard = self
            .custom_data
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(data) = guard.as_ref() {
            if data.provider == provider.0 {
                if let Ok(v) = data.value.clone().downcast::<T>() {
                    return Ok(v);
                }
            }
        }
        let value = match supplier() {
            Ok(Some(v)) => Arc::new(v),
            Ok(None) => {
                return Err(TemplateError::CustomDataInitialization {
                    detail: "the supplier has returned no value".to_string(),
                });
            }
            Err(e) => {
                return Err(TemplateError::CustomDataInitialization {
                    detail: e.to_string(),
                });
            }
        };
        *guard = Some(NodeCustomData {
            provider: provider.0,
            value: value.clone(),
        });
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, SourcePos};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_execution_store_initializes_once() {
        let key: CustomStateKey<std::cell::Cell<u32>> =
            CustomStateKey::new("counter", || std::cell::Cell::new(0));
        let mut store = ExecutionStateStore::default();
        let counter = store.get_or_create(&key);
        counter.set(counter.get() + 1);
        let again = store.get_or_create(&key);
        assert_eq!(again.get(), 1);
        assert!(Rc::ptr_eq(&counter, &again));
    }

    #[test]
    fn test_keys_with_same_name_are_distinct() {
        let a: CustomStateKey<u32> = CustomStateKey::new("same", || 1);
        let b: CustomStateKey<u32> = CustomStateKey::new("same", || 2);
        let mut store = ExecutionStateStore::default();
        assert_eq!(*store.get_or_create(&a), 1);
        assert_eq!(*store.get_or_create(&b), 2);
    }

    #[test]
    fn test_shared_store_returns_same_value() {
        let key: CustomStateKey<Mutex<Vec<String>>> =
            CustomStateKey::new("log", || Mutex::new(Vec::new()));
        let store = SharedStateStore::default();
        let first = store.get_or_create(&key);
        first.lock().unwrap().push("x".to_string());
        let second = store.get_or_create(&key);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_node_custom_data_memoizes_per_provider() {
        let node = Node::new(NodeKind::Text("t".to_string()), SourcePos::default());
        let provider = ProviderIdentity::new();
        let first = node
            .get_or_create_custom_data::<u64>(&provider, Box::new(|| Ok(Some(41))))
            .unwrap();
        // Second supplier must not run.
        let second = node
            .get_or_create_custom_data::<u64>(
                &provider,
                Box::new(|| panic!("cached value should be reused")),
            )
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // A different provider identity recomputes.
        let other = ProviderIdentity::new();
        let replaced = node
            .get_or_create_custom_data::<u64>(&other, Box::new(|| Ok(Some(7))))
            .unwrap();
        assert_eq!(*replaced, 7);
    }

    #[test]
    fn test_node_custom_data_supplier_failures() {
        let node = Node::new(NodeKind::Text("t".to_string()), SourcePos::default());
        let provider = ProviderIdentity::new();
        let absent = node.get_or_create_custom_data::<u64>(&provider, Box::new(|| Ok(None)));
        assert!(matches!(
            absent,
            Err(TemplateError::CustomDataInitialization { .. })
        ));
        let failed = node.get_or_create_custom_data::<u64>(
            &provider,
            Box::new(|| Err("boom".to_string().into())),
        );
        assert!(
            matches!(failed, Err(TemplateError::CustomDataInitialization { detail }) if detail == "boom")
        );
    }
}
