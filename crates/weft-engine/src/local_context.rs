/*
 * local_context.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Scoped variable frames.
//!
//! Constructs that introduce scoped variables (loops, nested-content
//! parameters) push a frame implementing [`LocalContext`] onto the
//! environment's stack for exactly the lexical extent of the construct.
//! Resolution walks the stack top-down, so inner frames shadow outer
//! ones. The stack is saved and swapped out entirely when a macro body
//! starts, and restored when it ends — macro bodies never see the
//! caller's frames.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::value::Value;

/// One frame of scoped variables.
pub trait LocalContext {
    /// The frame's value for `name`, or `None` when the frame does not
    /// define it (resolution then continues below).
    fn local_variable(&self, name: &str) -> Option<Value>;

    fn local_variable_names(&self) -> Vec<String>;
}

/// A fixed name-to-value frame, used for nested-content parameters.
#[derive(Debug)]
pub struct LocalBindings {
    names: Vec<String>,
    values: Vec<Value>,
}

impl LocalBindings {
    /// Binds `names[i]` to `values[i]`; extra names are left undefined
    /// by this frame.
    pub fn new(names: Vec<String>, values: Vec<Value>) -> Self {
        Self { names, values }
    }
}

impl LocalContext for LocalBindings {
    fn local_variable(&self, name: &str) -> Option<Value> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i).cloned())
    }

    fn local_variable_names(&self) -> Vec<String> {
        self.names.clone()
    }
}

/// The frame a list loop keeps for its whole run. One frame serves all
/// iterations; the loop rebinds it before each body pass. Besides the
/// loop variable it exposes `<var>_index` (0-based) and
/// `<var>_has_next`.
#[derive(Debug)]
pub struct IterationContext {
    var_name: String,
    current: RefCell<Value>,
    index: Cell<usize>,
    has_next: Cell<bool>,
}

impl IterationContext {
    pub fn new(var_name: String) -> Self {
        Self {
            var_name,
            current: RefCell::new(Value::Null),
            index: Cell::new(0),
            has_next: Cell::new(false),
        }
    }

    pub fn rebind(&self, value: Value, index: usize, has_next: bool) {
        *self.current.borrow_mut() = value;
        self.index.set(index);
        self.has_next.set(has_next);
    }
}

impl LocalContext for IterationContext {
    fn local_variable(&self, name: &str) -> Option<Value> {
        if name == self.var_name {
            Some(self.current.borrow().clone())
        } else if let Some(suffix) = name.strip_prefix(self.var_name.as_str()) {
            match suffix {
                "_index" => Some(Value::from(self.index.get() as f64)),
                "_has_next" => Some(Value::from(self.has_next.get())),
                _ => None,
            }
        } else {
            None
        }
    }

    fn local_variable_names(&self) -> Vec<String> {
        vec![
            self.var_name.clone(),
            format!("{}_index", self.var_name),
            format!("{}_has_next", self.var_name),
        ]
    }
}

/// The stack of active frames. Pushes and pops are strictly balanced;
/// the environment only mutates it through scoped helpers.
#[derive(Default)]
pub struct LocalContextStack {
    frames: Vec<Rc<dyn LocalContext>>,
}

impl LocalContextStack {
    pub fn push(&mut self, frame: Rc<dyn LocalContext>) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames from the most recently pushed down.
    pub fn iter_top_down(&self) -> impl Iterator<Item = &Rc<dyn LocalContext>> {
        self.frames.iter().rev()
    }
}

impl std::fmt::Debug for LocalContextStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalContextStack")
            .field("depth", &self.frames.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bindings_lookup() {
        let frame = LocalBindings::new(
            vec!["a".to_string(), "b".to_string()],
            vec![Value::from(1.0), Value::from(2.0)],
        );
        assert_eq!(frame.local_variable("a"), Some(Value::from(1.0)));
        assert_eq!(frame.local_variable("b"), Some(Value::from(2.0)));
        assert_eq!(frame.local_variable("c"), None);
    }

    #[test]
    fn test_bindings_with_fewer_values_than_names() {
        let frame = LocalBindings::new(
            vec!["a".to_string(), "b".to_string()],
            vec![Value::from(1.0)],
        );
        assert_eq!(frame.local_variable("a"), Some(Value::from(1.0)));
        assert_eq!(frame.local_variable("b"), None);
    }

    #[test]
    fn test_iteration_context_extras() {
        let ctx = IterationContext::new("item".to_string());
        ctx.rebind(Value::from("first"), 0, true);
        assert_eq!(ctx.local_variable("item"), Some(Value::from("first")));
        assert_eq!(ctx.local_variable("item_index"), Some(Value::from(0.0)));
        assert_eq!(ctx.local_variable("item_has_next"), Some(Value::from(true)));
        assert_eq!(ctx.local_variable("other"), None);
        assert_eq!(ctx.local_variable("item_unknown"), None);

        ctx.rebind(Value::from("last"), 1, false);
        assert_eq!(ctx.local_variable("item"), Some(Value::from("last")));
        assert_eq!(ctx.local_variable("item_has_next"), Some(Value::from(false)));
    }

    #[test]
    fn test_stack_shadowing_order() {
        let mut stack = LocalContextStack::default();
        stack.push(Rc::new(LocalBindings::new(
            vec!["x".to_string()],
            vec![Value::from("outer")],
        )));
        stack.push(Rc::new(LocalBindings::new(
            vec!["x".to_string()],
            vec![Value::from("inner")],
        )));

        let found = stack
            .iter_top_down()
            .find_map(|frame| frame.local_variable("x"));
        assert_eq!(found, Some(Value::from("inner")));

        stack.pop();
        let found = stack
            .iter_top_down()
            .find_map(|frame| frame.local_variable("x"));
        assert_eq!(found, Some(Value::from("outer")));
    }
}
