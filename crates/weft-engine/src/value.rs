/*
 * value.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The runtime value model.
//!
//! Values form a closed tagged union rather than an open trait hierarchy;
//! capability checks are `match`es on the tag. A lookup that finds nothing
//! yields `None` ("absent"), which is distinct from a binding whose value
//! is [`Value::Null`] — the two are never conflated by the engine.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::namespace::NamespaceRef;
use crate::node::{MacroDefinition, Node};

/// A template-visible value.
#[derive(Debug, Clone)]
pub enum Value {
    /// A bound null. Distinct from an absent binding.
    Null,
    Scalar(Scalar),
    Sequence(Vec<Value>),
    Hash(HashMap<String, Value>),
    /// A namespace value, as produced by `import`.
    Namespace(NamespaceRef),
    /// A user-defined directive (produces output, callable with a body).
    Directive(Rc<TemplateCallable>),
    /// A user-defined function (produces a return value, callable in
    /// expressions).
    Function(Rc<TemplateCallable>),
    /// A markup-like data node, dispatched on by node handlers.
    Node(Rc<DataNode>),
}

/// Scalar leaf values.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    String(String),
    Number(f64),
    Bool(bool),
    DateTime(DateTimeValue),
}

/// A point in time plus the axes the date/time format cache is keyed by.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DateTimeValue {
    /// Milliseconds since the Unix epoch, UTC.
    pub epoch_millis: i64,
    pub kind: DateTimeKind,
    /// Zoneless values came from a source with no time zone attached and
    /// must not be converted through the current time zone.
    pub zoneless: bool,
    /// Database-sourced values use the dedicated SQL time zone setting.
    pub sql: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateTimeKind {
    /// Subtype not known; formatting requires an explicit format string.
    Unknown,
    Time,
    Date,
    DateTime,
}

impl DateTimeKind {
    pub(crate) fn index(self) -> usize {
        match self {
            DateTimeKind::Unknown => 0,
            DateTimeKind::Time => 1,
            DateTimeKind::Date => 2,
            DateTimeKind::DateTime => 3,
        }
    }
}

/// A directive or function defined by a template, closed over the
/// namespace it was defined in.
#[derive(Debug)]
pub struct TemplateCallable {
    /// The defining tree node; always a macro-or-function definition.
    pub definition: Arc<Node>,
    /// The namespace captured at definition time. Bodies resolve
    /// variables against this namespace, not the caller's.
    pub namespace: NamespaceRef,
    /// Functions return values and run against a null sink; directives
    /// write output and may have nested content.
    pub function: bool,
}

impl TemplateCallable {
    pub(crate) fn layout(&self) -> &MacroDefinition {
        // The definition node is always NodeKind::MacroOrFunction; the
        // constructor in the environment guarantees it.
        self.definition
            .as_macro()
            .unwrap_or_else(|| unreachable!("callable definition is always a macro node"))
    }

    pub fn name(&self) -> &str {
        &self.layout().name
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        if self.function { "function" } else { "macro" }
    }
}

impl Value {
    /// Human-readable tag name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Scalar(Scalar::String(_)) => "string",
            Value::Scalar(Scalar::Number(_)) => "number",
            Value::Scalar(Scalar::Bool(_)) => "boolean",
            Value::Scalar(Scalar::DateTime(_)) => "date-time",
            Value::Sequence(_) => "sequence",
            Value::Hash(_) => "hash",
            Value::Namespace(_) => "namespace",
            Value::Directive(_) => "directive",
            Value::Function(_) => "function",
            Value::Node(_) => "node",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Directive(_) | Value::Function(_))
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Scalar(Scalar::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Scalar(Scalar::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }

    /// Key lookup on a plain hash. Namespace values are looked up through
    /// the environment instead, so lazily imported namespaces get forced.
    pub fn hash_get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Hash(map) => map.get(key),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Scalar(a), Value::Scalar(b)) => a == b,
            (Value::Sequence(a), Value::Sequence(b)) => a == b,
            (Value::Hash(a), Value::Hash(b)) => a == b,
            (Value::Namespace(a), Value::Namespace(b)) => Rc::ptr_eq(a, b),
            (Value::Directive(a), Value::Directive(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Node(a), Value::Node(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Scalar(Scalar::String(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Scalar(Scalar::String(s))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Scalar(Scalar::Number(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Scalar(Scalar::Number(n as f64))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Scalar(Scalar::Bool(b))
    }
}

impl From<DateTimeValue> for Value {
    fn from(dt: DateTimeValue) -> Self {
        Value::Scalar(Scalar::DateTime(dt))
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::from(b),
            serde_json::Value::Number(n) => Value::from(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::from(s),
            serde_json::Value::Array(items) => {
                Value::Sequence(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Hash(
                map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            ),
        }
    }
}

/// A node in a markup-like data tree, dispatched on by node handlers.
#[derive(Debug)]
pub struct DataNode {
    pub name: String,
    pub kind: DataNodeKind,
    pub namespace_uri: Option<String>,
    pub text: Option<String>,
    pub children: Vec<Rc<DataNode>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataNodeKind {
    Element,
    Text,
    Document,
    ProcessingInstruction,
    Comment,
    Doctype,
}

impl DataNode {
    pub fn element(name: impl Into<String>, children: Vec<Rc<DataNode>>) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            kind: DataNodeKind::Element,
            namespace_uri: None,
            text: None,
            children,
        })
    }

    pub fn element_ns(
        name: impl Into<String>,
        namespace_uri: impl Into<String>,
        children: Vec<Rc<DataNode>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            kind: DataNodeKind::Element,
            namespace_uri: Some(namespace_uri.into()),
            text: None,
            children,
        })
    }

    pub fn text(content: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            name: "@text".to_string(),
            kind: DataNodeKind::Text,
            namespace_uri: None,
            text: Some(content.into()),
            children: Vec::new(),
        })
    }

    pub fn document(children: Vec<Rc<DataNode>>) -> Rc<Self> {
        Rc::new(Self {
            name: "@document".to_string(),
            kind: DataNodeKind::Document,
            namespace_uri: None,
            text: None,
            children,
        })
    }

    pub fn comment(content: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            name: "@comment".to_string(),
            kind: DataNodeKind::Comment,
            namespace_uri: None,
            text: Some(content.into()),
            children: Vec::new(),
        })
    }

    pub fn processing_instruction(name: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            kind: DataNodeKind::ProcessingInstruction,
            namespace_uri: None,
            text: None,
            children: Vec::new(),
        })
    }

    /// The node-type name used for `@type` default handlers.
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            DataNodeKind::Element => "element",
            DataNodeKind::Text => "text",
            DataNodeKind::Document => "document",
            DataNodeKind::ProcessingInstruction => "pi",
            DataNodeKind::Comment => "comment",
            DataNodeKind::Doctype => "document_type",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_json_round_trips_structure() {
        let json = serde_json::json!({
            "name": "Ada",
            "tags": ["a", "b"],
            "age": 36,
            "active": true,
            "note": null
        });
        let value = Value::from(json);
        assert_eq!(
            value.hash_get("name"),
            Some(&Value::from("Ada")),
        );
        assert_eq!(
            value.hash_get("tags"),
            Some(&Value::Sequence(vec![Value::from("a"), Value::from("b")])),
        );
        assert_eq!(value.hash_get("age"), Some(&Value::from(36.0)));
        assert_eq!(value.hash_get("active"), Some(&Value::from(true)));
        // JSON null maps to a *bound* null, not an absent key.
        assert_eq!(value.hash_get("note"), Some(&Value::Null));
        assert_eq!(value.hash_get("missing"), None);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Value::Null.kind_name(), "null");
        assert_eq!(Value::from("x").kind_name(), "string");
        assert_eq!(Value::from(1.0).kind_name(), "number");
        assert_eq!(Value::Sequence(vec![]).kind_name(), "sequence");
    }

    #[test]
    fn test_data_node_type_names() {
        assert_eq!(DataNode::text("t").type_name(), "text");
        assert_eq!(DataNode::document(vec![]).type_name(), "document");
        assert_eq!(DataNode::comment("c").type_name(), "comment");
        assert_eq!(
            DataNode::processing_instruction("xml").type_name(),
            "pi"
        );
    }

    #[test]
    fn test_date_time_kind_index() {
        assert_eq!(DateTimeKind::Unknown.index(), 0);
        assert_eq!(DateTimeKind::Time.index(), 1);
        assert_eq!(DateTimeKind::Date.index(), 2);
        assert_eq!(DateTimeKind::DateTime.index(), 3);
    }
}
