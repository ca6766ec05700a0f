/*
 * lib.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Template execution engine for the weft template language.
//!
//! This crate executes parsed template trees. It covers the runtime half
//! of a template system: an immutable [`Template`] tree goes in, and an
//! [`Environment`] runs it against root data, writing rendered text to an
//! [`OutputSink`]. Parsing is out of scope; trees are built by a parser
//! front end (or by hand, as the tests here do).
//!
//! The engine supports:
//!
//! - Interpolations, conditionals, list loops, and assignments at
//!   current/global/local scope
//! - Macros and functions with positional, named, and varargs parameters,
//!   nested content (`#nested`), and `#return`
//! - Namespaces: `#import` (eager or lazy), `#include`, auto-imports and
//!   auto-includes at configuration/template/execution level
//! - Error recovery (`#attempt`/`#recover`) with buffered output, plus a
//!   pluggable error handler and attempt reporter
//! - Node handler dispatch over markup-like data trees (`#visit`,
//!   `#recurse`, `#fallback`)
//! - Locale/zone-aware number, boolean, and date-time formatting behind
//!   per-execution caches with fine-grained invalidation
//!
//! # Example
//!
//! ```ignore
//! use weft_engine::{Configuration, Environment, MemoryTemplateResolver, StringSink, Template};
//!
//! let resolver = MemoryTemplateResolver::new();
//! let config = Arc::new(Configuration::new(Arc::new(resolver)));
//! let template = Arc::new(Template::new("hello.wft", root));
//!
//! let sink = StringSink::new();
//! let mut env = Environment::new(config, template, data, Box::new(sink.clone()));
//! env.process()?;
//! let rendered = sink.into_string();
//! ```

pub mod custom_state;
pub mod environment;
pub mod error;
pub mod formats;
pub mod local_context;
pub mod namespace;
pub mod node;
pub mod output;
pub mod settings;
pub mod template;
pub mod value;

mod invocation;

// Re-export main types at crate root
pub use custom_state::{CustomDataSupplier, CustomStateKey, ProviderIdentity, SharedStateStore};
pub use environment::{Environment, ExecutionId, TERSE_STACK_FRAME_LIMIT};
pub use error::{
    AttemptReporter, DebugHandler, EngineError, EngineResult, IgnoreHandler, LogAttemptReporter,
    RethrowHandler, TemplateError, TemplateErrorHandler,
};
pub use formats::{
    BooleanFormat, Collator, DateTimeFormatFactory, DateTimeFormatter, NumberFormatFactory,
    NumberFormatter,
};
pub use local_context::{IterationContext, LocalBindings, LocalContext};
pub use namespace::{InitStatus, NamespaceData, NamespaceRef};
pub use node::{
    AssignScope, CallSite, Expr, MacroDefinition, Node, NodeKind, Parameter, ParameterLayout,
    SourcePos,
};
pub use output::{NullSink, OutputSink, StringSink, WriterSink};
pub use settings::Settings;
pub use template::{
    Configuration, MemoryTemplateResolver, NullTemplateResolver, Template, TemplateResolver,
};
pub use value::{DataNode, DataNodeKind, DateTimeKind, DateTimeValue, Scalar, TemplateCallable, Value};
