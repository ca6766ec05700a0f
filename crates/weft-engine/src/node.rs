/*
 * node.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The immutable template tree.
//!
//! A parsed template is a tree of [`Node`]s behind `Arc`, shared freely
//! between executions and threads. Child lists are plain vectors; the
//! engine never mutates a node after construction (the only interior
//! mutability is the per-node custom data slot, which is synchronized).

use std::fmt;
use std::sync::Arc;

use crate::custom_state::NodeDataSlot;
use crate::value::Scalar;

/// 1-based source location of a node in its template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourcePos {
    pub line: u32,
    pub column: u32,
}

impl SourcePos {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at line {}, column {}", self.line, self.column)
    }
}

/// A node in the template tree.
#[derive(Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub position: SourcePos,
    /// Whether this node appears as its own frame in stack dumps.
    /// Literal text and plain containers are hidden unless topmost.
    pub shown_in_stack_trace: bool,
    pub(crate) custom_data: NodeDataSlot,
}

impl Node {
    pub fn new(kind: NodeKind, position: SourcePos) -> Arc<Self> {
        let shown = !matches!(kind, NodeKind::Text(_) | NodeKind::Block(_));
        Arc::new(Self {
            kind,
            position,
            shown_in_stack_trace: shown,
            custom_data: NodeDataSlot::default(),
        })
    }

    pub(crate) fn as_macro(&self) -> Option<&MacroDefinition> {
        match &self.kind {
            NodeKind::MacroOrFunction(def) => Some(def),
            _ => None,
        }
    }

    /// One-line description of the node for stack dumps.
    pub fn description(&self) -> String {
        match &self.kind {
            NodeKind::Text(t) => {
                let trimmed: String = t.chars().take(20).collect();
                format!("text {:?}", trimmed)
            }
            NodeKind::Block(_) => "block".to_string(),
            NodeKind::Interpolation(_) => "${...}".to_string(),
            NodeKind::Assign { name, scope, .. } => match scope {
                AssignScope::Current => format!("#assign {}", name),
                AssignScope::Global => format!("#global {}", name),
                AssignScope::Local => format!("#local {}", name),
            },
            NodeKind::Conditional { .. } => "#if".to_string(),
            NodeKind::List { var, .. } => format!("#list ... as {}", var),
            NodeKind::MacroOrFunction(def) => {
                if def.function {
                    format!("#function {}", def.name)
                } else {
                    format!("#macro {}", def.name)
                }
            }
            NodeKind::Call(_) => "@...".to_string(),
            NodeKind::NestedContent { .. } => "#nested".to_string(),
            NodeKind::Return { .. } => "#return".to_string(),
            NodeKind::Stop { .. } => "#stop".to_string(),
            NodeKind::AttemptRecover { .. } => "#attempt".to_string(),
            NodeKind::Include { .. } => "#include".to_string(),
            NodeKind::Import { alias, .. } => format!("#import ... as {}", alias),
            NodeKind::VisitNode { .. } => "#visit".to_string(),
            NodeKind::RecurseNode { .. } => "#recurse".to_string(),
            NodeKind::Fallback => "#fallback".to_string(),
            NodeKind::Setting { name, .. } => format!("#setting {}", name),
        }
    }

    /// Nesting-related frames are shown with `~` in terse stack dumps and
    /// are the first candidates for hiding.
    pub(crate) fn is_nesting_related(&self) -> bool {
        matches!(self.kind, NodeKind::NestedContent { .. })
    }
}

#[derive(Debug)]
pub enum NodeKind {
    /// Literal template text.
    Text(String),
    /// Plain container; executing it executes the children in order.
    Block(Vec<Arc<Node>>),
    /// `${expr}` — evaluate and write, formatting scalars through the
    /// per-execution format caches.
    Interpolation(Expr),
    Assign {
        name: String,
        scope: AssignScope,
        value: Expr,
    },
    Conditional {
        /// `(condition, body)` pairs; first true condition wins.
        branches: Vec<(Expr, Vec<Arc<Node>>)>,
        else_branch: Option<Vec<Arc<Node>>>,
    },
    List {
        seq: Expr,
        var: String,
        body: Vec<Arc<Node>>,
    },
    /// A macro or function definition. Executing it binds the callable
    /// into the current namespace; the body only runs when called.
    MacroOrFunction(MacroDefinition),
    /// A directive invocation, `<@expr arg... >body</@>`.
    Call(CallSite),
    /// `<#nested expr...>` inside a directive body.
    NestedContent { params: Vec<Expr> },
    Return { value: Option<Expr> },
    Stop { message: Option<Expr> },
    AttemptRecover {
        attempted: Arc<Node>,
        recovery: Vec<Arc<Node>>,
    },
    Include { name: Expr },
    Import { name: Expr, alias: String },
    /// Dispatch a data node to its handler directive.
    VisitNode {
        target: Expr,
        /// Optional sequence of namespaces to search for handlers.
        namespaces: Option<Expr>,
    },
    /// Dispatch the current node's children (or an explicit node's).
    RecurseNode {
        target: Option<Expr>,
        namespaces: Option<Expr>,
    },
    /// Continue the handler search where the current handler was found.
    Fallback,
    /// `<#setting name=value>` — mutate a per-execution setting.
    Setting { name: String, value: Expr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignScope {
    /// The current namespace.
    Current,
    /// The globals namespace.
    Global,
    /// The innermost macro/function invocation's locals.
    Local,
}

/// A macro or function signature plus body.
#[derive(Debug)]
pub struct MacroDefinition {
    pub name: String,
    pub function: bool,
    pub params: ParameterLayout,
    pub body: Vec<Arc<Node>>,
}

/// One declared parameter.
#[derive(Debug)]
pub struct Parameter {
    pub name: String,
    /// Default expression, evaluated in the callee's scope when the
    /// argument is omitted or null.
    pub default: Option<Expr>,
}

impl Parameter {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn with_default(name: impl Into<String>, default: Expr) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
        }
    }
}

/// The declared parameter layout of a callable.
///
/// Arguments bind into one flat slot array:
/// positional parameters first, then by-name parameters, then (when
/// declared) the positional-varargs slot and the named-varargs slot.
#[derive(Debug, Default)]
pub struct ParameterLayout {
    pub positional: Vec<Parameter>,
    pub named: Vec<Parameter>,
    pub positional_varargs: Option<String>,
    pub named_varargs: Option<String>,
}

impl ParameterLayout {
    pub fn positional_only(params: Vec<Parameter>) -> Self {
        Self {
            positional: params,
            ..Self::default()
        }
    }

    pub fn named_only(params: Vec<Parameter>) -> Self {
        Self {
            named: params,
            ..Self::default()
        }
    }

    pub(crate) fn total_slots(&self) -> usize {
        self.positional.len()
            + self.named.len()
            + usize::from(self.positional_varargs.is_some())
            + usize::from(self.named_varargs.is_some())
    }

    pub(crate) fn named_slot_index(&self, name: &str) -> Option<usize> {
        self.named
            .iter()
            .position(|p| p.name == name)
            .map(|i| self.positional.len() + i)
    }

    pub(crate) fn positional_varargs_index(&self) -> Option<usize> {
        self.positional_varargs
            .as_ref()
            .map(|_| self.positional.len() + self.named.len())
    }

    pub(crate) fn named_varargs_index(&self) -> Option<usize> {
        self.named_varargs.as_ref().map(|_| {
            self.positional.len()
                + self.named.len()
                + usize::from(self.positional_varargs.is_some())
        })
    }

    /// The declared name for a slot index, valid for every slot.
    pub(crate) fn slot_name(&self, index: usize) -> &str {
        let np = self.positional.len();
        let nn = self.named.len();
        if index < np {
            &self.positional[index].name
        } else if index < np + nn {
            &self.named[index - np].name
        } else if Some(index) == self.positional_varargs_index() {
            self.positional_varargs.as_deref().unwrap_or("")
        } else {
            self.named_varargs.as_deref().unwrap_or("")
        }
    }

    /// Default expression for a slot, when one was declared.
    pub(crate) fn slot_default(&self, index: usize) -> Option<&Expr> {
        let np = self.positional.len();
        let nn = self.named.len();
        if index < np {
            self.positional[index].default.as_ref()
        } else if index < np + nn {
            self.named[index - np].default.as_ref()
        } else {
            None
        }
    }

    /// Names acceptable as by-name arguments, for error messages.
    pub(crate) fn by_name_parameter_names(&self) -> Vec<String> {
        self.named.iter().map(|p| p.name.clone()).collect()
    }
}

/// A directive invocation site.
#[derive(Debug)]
pub struct CallSite {
    pub callee: Expr,
    pub positional_args: Vec<Expr>,
    pub named_args: Vec<(String, Expr)>,
    /// The body between the open and close tags, run by `#nested`.
    pub nested_content: Vec<Arc<Node>>,
    /// Loop-variable names the body receives from `#nested` parameters.
    pub nested_content_params: Vec<String>,
}

/// An expression in the template language.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Scalar),
    NullLiteral,
    /// A simple name, resolved through the full variable-resolution
    /// order. Absent is an error here (use `Exists`/`WithDefault` to
    /// probe).
    Variable(String),
    /// `base.key` on hashes and namespaces.
    Dot(Box<Expr>, String),
    /// A function call in expression position.
    FunctionCall {
        callee: Box<Expr>,
        positional: Vec<Expr>,
        named: Vec<(String, Expr)>,
    },
    /// `expr??` — true when the operand is present and non-null.
    Exists(Box<Expr>),
    /// `expr!default` — the operand when present and non-null, otherwise
    /// the default.
    WithDefault(Box<Expr>, Box<Expr>),
    /// `.error` — the message of the error being recovered.
    RecoveredErrorMessage,
}

impl Expr {
    pub fn str(s: impl Into<String>) -> Self {
        Expr::Literal(Scalar::String(s.into()))
    }

    pub fn num(n: f64) -> Self {
        Expr::Literal(Scalar::Number(n))
    }

    pub fn bool(b: bool) -> Self {
        Expr::Literal(Scalar::Bool(b))
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Variable(name.into())
    }

    pub fn dot(base: Expr, key: impl Into<String>) -> Self {
        Expr::Dot(Box::new(base), key.into())
    }
}
