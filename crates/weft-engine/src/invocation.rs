/*
 * invocation.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Macro/function invocation frames and argument binding.
//!
//! Each active call owns an [`InvocationContext`]: the callable, its
//! local variables, the call site (for nested content), the namespace
//! that nested content must run in, and the caller's local-context
//! stack, parked here while the body runs. Frames form a linked chain
//! through `prev`, giving the engine the "previous frame" hop that
//! nested-content execution needs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::environment::Environment;
use crate::error::{ExecResult, TemplateError};
use crate::local_context::LocalContextStack;
use crate::namespace::NamespaceRef;
use crate::node::{Expr, Node, SourcePos};
use crate::value::{TemplateCallable, Value};

pub struct InvocationContext {
    /// The callee's local variables, starting from the bound arguments.
    pub(crate) locals: RefCell<HashMap<String, Value>>,
    pub(crate) callable: Rc<TemplateCallable>,
    /// The invocation node; `None` for function calls in expressions,
    /// which have no nested content.
    pub(crate) call_site: Option<Arc<Node>>,
    /// The caller's namespace, in force while nested content runs.
    pub(crate) nested_content_namespace: NamespaceRef,
    /// The caller's local-context stack, parked for the duration of the
    /// body and temporarily reinstalled around nested content.
    pub(crate) saved_local_context_stack: RefCell<LocalContextStack>,
    /// The frame that was current when this call started.
    pub(crate) prev: Option<Rc<InvocationContext>>,
}

impl InvocationContext {
    pub(crate) fn new(
        callable: Rc<TemplateCallable>,
        call_site: Option<Arc<Node>>,
        nested_content_namespace: NamespaceRef,
        prev: Option<Rc<InvocationContext>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            locals: RefCell::new(HashMap::new()),
            callable,
            call_site,
            nested_content_namespace,
            saved_local_context_stack: RefCell::new(LocalContextStack::default()),
            prev,
        })
    }

    pub(crate) fn local(&self, name: &str) -> Option<Value> {
        self.locals.borrow().get(name).cloned()
    }

    pub(crate) fn set_local(&self, name: impl Into<String>, value: Value) {
        self.locals.borrow_mut().insert(name.into(), value);
    }

    pub(crate) fn local_names(&self) -> Vec<String> {
        self.locals.borrow().keys().cloned().collect()
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("callable", &self.callable.name())
            .field("locals", &self.locals.borrow().len())
            .finish()
    }
}

/// Binds call-site arguments to the callable's declared slot array.
///
/// Positional arguments fill the declared positional slots left to
/// right; overflow goes into the positional-varargs sequence when one
/// is declared and is an arity error otherwise. Named arguments bind to
/// their declared slot, fall back to the named-varargs hash, and are an
/// error (listing the acceptable names) when neither exists. Argument
/// expressions are evaluated in the caller's scope, in source order.
///
/// Slots left `None` are filled from parameter defaults later, in the
/// callee's scope.
pub(crate) fn bind_arguments(
    env: &mut Environment,
    callable: &TemplateCallable,
    positional: &[Expr],
    named: &[(String, Expr)],
    position: SourcePos,
) -> ExecResult<Vec<Option<Value>>> {
    let layout = &callable.layout().params;
    let mut slots: Vec<Option<Value>> = (0..layout.total_slots()).map(|_| None).collect();

    let declared = layout.positional.len();
    for (i, expr) in positional.iter().enumerate().take(declared) {
        slots[i] = Some(env.eval_expr(expr, position)?);
    }
    if let Some(varargs_index) = layout.positional_varargs_index() {
        let mut rest = Vec::new();
        for expr in positional.iter().skip(declared) {
            rest.push(env.eval_expr(expr, position)?);
        }
        slots[varargs_index] = Some(Value::Sequence(rest));
    } else if positional.len() > declared {
        return Err(TemplateError::TooManyPositionalArguments {
            callable_kind: callable.kind_name(),
            name: callable.name().to_string(),
            declared,
            passed: positional.len(),
        }
        .into());
    }

    let mut named_varargs: Option<HashMap<String, Value>> =
        layout.named_varargs_index().map(|_| HashMap::new());
    for (name, expr) in named {
        let value = env.eval_expr(expr, position)?;
        if let Some(slot) = layout.named_slot_index(name) {
            slots[slot] = Some(value);
        } else if let Some(overflow) = named_varargs.as_mut() {
            overflow.insert(name.clone(), value);
        } else {
            return Err(TemplateError::UnknownNamedArgument {
                callable_kind: callable.kind_name(),
                name: callable.name().to_string(),
                argument: name.clone(),
                valid_names: layout.by_name_parameter_names(),
            }
            .into());
        }
    }
    if let (Some(index), Some(overflow)) = (layout.named_varargs_index(), named_varargs) {
        slots[index] = Some(Value::Hash(overflow));
    }

    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NamespaceData;
    use crate::node::{MacroDefinition, NodeKind, ParameterLayout};
    use pretty_assertions::assert_eq;

    fn callable() -> Rc<TemplateCallable> {
        let definition = Node::new(
            NodeKind::MacroOrFunction(MacroDefinition {
                name: "m".to_string(),
                function: false,
                params: ParameterLayout::default(),
                body: vec![],
            }),
            SourcePos::default(),
        );
        Rc::new(TemplateCallable {
            definition,
            namespace: NamespaceData::new(None),
            function: false,
        })
    }

    #[test]
    fn test_invocation_locals() {
        let ctx = InvocationContext::new(callable(), None, NamespaceData::new(None), None);
        assert_eq!(ctx.local("x"), None);
        ctx.set_local("x", Value::from(1.0));
        assert_eq!(ctx.local("x"), Some(Value::from(1.0)));
        assert_eq!(ctx.local_names(), vec!["x".to_string()]);
    }

    #[test]
    fn test_invocation_chain() {
        let outer = InvocationContext::new(callable(), None, NamespaceData::new(None), None);
        let inner =
            InvocationContext::new(callable(), None, NamespaceData::new(None), Some(outer.clone()));
        assert!(inner.prev.as_ref().is_some_and(|p| Rc::ptr_eq(p, &outer)));
        assert!(outer.prev.is_none());
    }
}
