/*
 * environment.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The execution engine.
//!
//! An [`Environment`] holds everything that is mutable while one
//! template processes: the output sink, the namespace set, the
//! instruction stack, the local-context stack, the invocation chain,
//! per-execution settings, and the format caches. It is created for one
//! `process` call and discarded afterwards.
//!
//! Execution is recursive descent over the template tree. Each element
//! visit pushes the node on the instruction stack, runs it, funnels any
//! template error through the pluggable handler, and pops the node on
//! every path — the stack is balanced even while an error unwinds, so
//! the error funnel can always render an accurate stack dump.
//!
//! There is no ambient "current environment": everything that needs the
//! engine receives `&mut Environment` explicitly. A thread-local
//! registry tracks only the active [`ExecutionId`] so callers can ask
//! whether an execution is running on the current thread.

use std::cell::Cell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::custom_state::{CustomStateKey, ExecutionStateStore};
use crate::error::{
    run_to_completion, AttemptReporter, EngineError, EngineResult, ExecResult, Interrupt,
    LogAttemptReporter, RethrowHandler, TemplateError, TemplateErrorHandler,
};
use crate::formats::{
    date_cache_index, parse_zone_offset, BooleanFormat, Collator, DateTimeFormatter, FormatCaches,
    NumberFormatter, StandardDateTimeFormat, StandardNumberFormat,
};
use crate::invocation::{bind_arguments, InvocationContext};
use crate::local_context::{IterationContext, LocalBindings, LocalContext, LocalContextStack};
use crate::namespace::{InitStatus, NamespaceData, NamespaceRef};
use crate::node::{AssignScope, Expr, Node, NodeKind, SourcePos};
use crate::output::{NullSink, OutputSink, StringSink};
use crate::settings::{
    Settings, DEFAULT_BOOLEAN_FORMAT, DEFAULT_DATE_LIKE_FORMAT, DEFAULT_LOCALE,
    DEFAULT_NUMBER_FORMAT, DEFAULT_TIME_ZONE,
};
use crate::template::{normalize_template_name, Configuration, Template};
use crate::value::{DataNode, DataNodeKind, DateTimeKind, Scalar, TemplateCallable, Value};

/// Frames shown by a terse stack dump before the rest is elided.
pub const TERSE_STACK_FRAME_LIMIT: usize = 10;

static NEXT_EXECUTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one `process` run, unique within the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionId(u64);

thread_local! {
    static ACTIVE_EXECUTION: Cell<Option<ExecutionId>> = const { Cell::new(None) };
}

/// Installs an execution id in the thread-local registry, restoring the
/// previous one on drop (executions can nest when a handler processes
/// another template on the same thread).
struct ExecutionScope {
    prev: Option<ExecutionId>,
}

impl ExecutionScope {
    fn enter(id: ExecutionId) -> Self {
        let prev = ACTIVE_EXECUTION.with(|c| c.replace(Some(id)));
        Self { prev }
    }
}

impl Drop for ExecutionScope {
    fn drop(&mut self) {
        let prev = self.prev;
        ACTIVE_EXECUTION.with(|c| c.set(prev));
    }
}

pub struct Environment {
    configuration: Arc<Configuration>,
    main_template: Arc<Template>,
    root_data: HashMap<String, Value>,
    out: Box<dyn OutputSink>,
    settings: Settings,

    instruction_stack: Vec<Arc<Node>>,
    /// Templates whose code is currently executing, innermost last.
    /// Includes and macro calls into other namespaces push here.
    template_stack: Vec<Arc<Template>>,
    recovered_error_stack: Vec<Arc<TemplateError>>,
    local_context_stack: LocalContextStack,
    current_invocation: Option<Rc<InvocationContext>>,

    global_namespace: NamespaceRef,
    main_namespace: NamespaceRef,
    current_namespace: NamespaceRef,
    /// Normalized template name → library namespace.
    loaded_libs: HashMap<String, NamespaceRef>,

    in_attempt_block: bool,
    fast_invalid_references: bool,
    /// The last error offered to the handler; unwinding re-delivers the
    /// same `Arc`, which must not be offered twice.
    last_error: Option<Arc<TemplateError>>,
    last_return_value: Option<Value>,

    caches: FormatCaches,
    execution_state: ExecutionStateStore,

    current_visitor_node: Option<Rc<DataNode>>,
    node_handler_namespaces: Vec<NamespaceRef>,
    /// One past the index where the current handler was found; the
    /// starting point for `fallback`.
    node_handler_index: usize,
    current_node_name: Option<String>,
    current_node_namespace_uri: Option<String>,

    execution_id: ExecutionId,
}

impl Environment {
    pub fn new(
        configuration: Arc<Configuration>,
        template: Arc<Template>,
        root_data: HashMap<String, Value>,
        out: Box<dyn OutputSink>,
    ) -> Self {
        let global_namespace = NamespaceData::new(None);
        let main_namespace = NamespaceData::new(Some(template.clone()));
        Self {
            configuration,
            main_template: template,
            root_data,
            out,
            settings: Settings::default(),
            instruction_stack: Vec::new(),
            template_stack: Vec::new(),
            recovered_error_stack: Vec::new(),
            local_context_stack: LocalContextStack::default(),
            current_invocation: None,
            global_namespace,
            current_namespace: main_namespace.clone(),
            main_namespace,
            loaded_libs: HashMap::new(),
            in_attempt_block: false,
            fast_invalid_references: false,
            last_error: None,
            last_return_value: None,
            caches: FormatCaches::default(),
            execution_state: ExecutionStateStore::default(),
            current_visitor_node: None,
            node_handler_namespaces: Vec::new(),
            node_handler_index: 0,
            current_node_name: None,
            current_node_namespace_uri: None,
            execution_id: ExecutionId(NEXT_EXECUTION_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.configuration
    }

    pub fn main_template(&self) -> &Arc<Template> {
        &self.main_template
    }

    /// The template whose code is currently executing.
    pub fn current_template(&self) -> Arc<Template> {
        self.template_stack
            .last()
            .cloned()
            .unwrap_or_else(|| self.main_template.clone())
    }

    pub fn main_namespace(&self) -> NamespaceRef {
        self.main_namespace.clone()
    }

    pub fn global_namespace(&self) -> NamespaceRef {
        self.global_namespace.clone()
    }

    pub fn current_namespace(&self) -> NamespaceRef {
        self.current_namespace.clone()
    }

    /// The already-registered library namespace for a template name, if
    /// any; does not import or initialize.
    pub fn imported_namespace(&self, template_name: &str) -> Option<NamespaceRef> {
        self.loaded_libs
            .get(normalize_template_name(template_name))
            .cloned()
    }

    /// Per-execution settings. Format-affecting settings must be changed
    /// through the `set_*` methods once processing has started, so that
    /// the dependent caches are invalidated.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// The execution currently running on this thread, if any.
    pub fn current_execution_id() -> Option<ExecutionId> {
        ACTIVE_EXECUTION.with(|c| c.get())
    }

    pub fn is_current_execution(&self) -> bool {
        Self::current_execution_id() == Some(self.execution_id)
    }

    pub fn is_in_attempt_block(&self) -> bool {
        self.in_attempt_block
    }

    /// Inside attempted sections, missing-reference errors are raised
    /// with reduced detail since they are about to be recovered.
    pub fn set_fast_invalid_references(&mut self, fast: bool) -> bool {
        std::mem::replace(&mut self.fast_invalid_references, fast)
    }

    /// Swap the output sink, returning the previous one.
    pub fn set_output_sink(&mut self, sink: Box<dyn OutputSink>) -> Box<dyn OutputSink> {
        std::mem::replace(&mut self.out, sink)
    }

    pub fn write_text(&mut self, text: &str) -> EngineResult<()> {
        self.out.write_str(text).map_err(EngineError::Io)
    }

    /// Per-execution custom state for `key`, created on first access.
    pub fn custom_state<T: 'static>(&mut self, key: &CustomStateKey<T>) -> Rc<T> {
        self.execution_state.get_or_create(key)
    }

    // ------------------------------------------------------------------
    // Processing

    /// Run the main template against the root data, writing to the sink.
    pub fn process(&mut self) -> EngineResult<()> {
        tracing::debug!(template = %self.main_template.name(), "Processing template");
        let _scope = ExecutionScope::enter(self.execution_id);
        self.caches.clear_all();
        self.last_error = None;
        let result = run_to_completion(self.process_inner());
        self.caches.clear_all();
        result?;
        if self.effective_auto_flush() {
            self.out.flush().map_err(EngineError::Io)?;
        }
        Ok(())
    }

    fn process_inner(&mut self) -> ExecResult<()> {
        let main = self.main_template.clone();
        // Macro definitions are in force from the start of processing,
        // regardless of where they appear in the template.
        self.import_macros(&main);
        self.do_auto_imports().map_err(Interrupt::from)?;
        self.do_auto_includes()?;
        let root = main.root().clone();
        self.visit(&root)
    }

    // ------------------------------------------------------------------
    // Element visitation

    /// Execute one element. Pushes the element on the instruction stack,
    /// funnels template errors raised by it (or below it) through the
    /// error handler, and pops the stack on every path.
    pub(crate) fn visit(&mut self, node: &Arc<Node>) -> ExecResult<()> {
        self.instruction_stack.push(node.clone());
        let outcome = match self.visit_inner(node) {
            Err(Interrupt::Error(err)) => self.funnel_error(err),
            other => other,
        };
        self.instruction_stack.pop();
        outcome
    }

    fn visit_inner(&mut self, node: &Arc<Node>) -> ExecResult<()> {
        let follow_ups = self.apply(node)?;
        for child in &follow_ups {
            self.visit(child)?;
        }
        Ok(())
    }

    fn visit_all(&mut self, nodes: &[Arc<Node>]) -> ExecResult<()> {
        for node in nodes {
            self.visit(node)?;
        }
        Ok(())
    }

    /// Execute the element itself and return the children to visit next.
    /// Elements that need scoped state around their children (loops,
    /// calls, attempted sections) run them internally and return none.
    fn apply(&mut self, node: &Arc<Node>) -> ExecResult<Vec<Arc<Node>>> {
        match &node.kind {
            NodeKind::Text(text) => {
                self.write_text(text)?;
                Ok(Vec::new())
            }
            NodeKind::Block(children) => Ok(children.clone()),
            NodeKind::Interpolation(expr) => {
                let value = self.eval_expr(expr, node.position)?;
                let text = self.format_value(&value, node.position)?;
                self.write_text(&text)?;
                Ok(Vec::new())
            }
            NodeKind::Assign { name, scope, value } => {
                let v = self.eval_expr(value, node.position)?;
                match scope {
                    AssignScope::Current => {
                        let ns = self.current_namespace.clone();
                        ns.borrow_mut().put(name.clone(), v);
                    }
                    AssignScope::Global => {
                        self.global_namespace.borrow_mut().put(name.clone(), v);
                    }
                    AssignScope::Local => {
                        self.set_local_variable(name.clone(), v)
                            .map_err(Interrupt::from)?;
                    }
                }
                Ok(Vec::new())
            }
            NodeKind::Conditional {
                branches,
                else_branch,
            } => {
                for (condition, body) in branches {
                    let value = self.eval_expr(condition, node.position)?;
                    match value.as_bool() {
                        Some(true) => return Ok(body.clone()),
                        Some(false) => {}
                        None => {
                            return Err(TemplateError::TypeMismatch {
                                expected: "boolean",
                                actual: value.kind_name(),
                                position: node.position,
                            }
                            .into());
                        }
                    }
                }
                Ok(else_branch.clone().unwrap_or_default())
            }
            NodeKind::List { seq, var, body } => {
                let value = self.eval_expr(seq, node.position)?;
                let items = match value {
                    Value::Sequence(items) => items,
                    other => {
                        return Err(TemplateError::TypeMismatch {
                            expected: "sequence",
                            actual: other.kind_name(),
                            position: node.position,
                        }
                        .into());
                    }
                };
                if !items.is_empty() {
                    let iteration = Rc::new(IterationContext::new(var.clone()));
                    let frame: Rc<dyn LocalContext> = iteration.clone();
                    let body = body.clone();
                    self.with_local_context(frame, move |env| {
                        let len = items.len();
                        for (i, item) in items.into_iter().enumerate() {
                            iteration.rebind(item, i, i + 1 < len);
                            env.visit_all(&body)?;
                        }
                        Ok(())
                    })?;
                }
                Ok(Vec::new())
            }
            NodeKind::MacroOrFunction(_) => {
                self.define_callable(node);
                Ok(Vec::new())
            }
            NodeKind::Call(site) => {
                let callee = self.eval_expr(&site.callee, node.position)?;
                match callee {
                    Value::Directive(callable) => {
                        let args = bind_arguments(
                            self,
                            &callable,
                            &site.positional_args,
                            &site.named_args,
                            node.position,
                        )?;
                        self.generic_execute(&callable, Some(node.clone()), args, false)?;
                    }
                    Value::Function(_) => {
                        return Err(TemplateError::evaluation(
                            "routine is a function, not a directive; call it in an expression",
                            node.position,
                        )
                        .into());
                    }
                    other => {
                        return Err(TemplateError::NotCallable {
                            actual: other.kind_name(),
                            position: node.position,
                        }
                        .into());
                    }
                }
                Ok(Vec::new())
            }
            NodeKind::NestedContent { params } => {
                let mut values = Vec::with_capacity(params.len());
                for param in params {
                    values.push(self.eval_expr(param, node.position)?);
                }
                self.execute_nested_content(values, node.position)?;
                Ok(Vec::new())
            }
            NodeKind::Return { value } => {
                if let Some(expr) = value {
                    let v = self.eval_expr(expr, node.position)?;
                    self.last_return_value = Some(v);
                }
                Err(Interrupt::Return)
            }
            NodeKind::Stop { message } => {
                let message = match message {
                    Some(expr) => {
                        let v = self.eval_expr(expr, node.position)?;
                        match v.as_str() {
                            Some(s) => s.to_string(),
                            None => self.format_value(&v, node.position)?,
                        }
                    }
                    None => String::new(),
                };
                Err(TemplateError::Stopped { message }.into())
            }
            NodeKind::AttemptRecover {
                attempted,
                recovery,
            } => {
                self.visit_attempt_recover(attempted, recovery)?;
                Ok(Vec::new())
            }
            NodeKind::Include { name } => {
                let name = self.eval_to_string(name, node.position)?;
                self.include_by_name(&name)?;
                Ok(Vec::new())
            }
            NodeKind::Import { name, alias } => {
                let name = self.eval_to_string(name, node.position)?;
                let lazy = self.effective_lazy_imports();
                self.import_lib(&name, Some(alias.as_str()), lazy)
                    .map_err(Interrupt::from)?;
                Ok(Vec::new())
            }
            NodeKind::VisitNode { target, namespaces } => {
                let value = self.eval_expr(target, node.position)?;
                let data = match value {
                    Value::Node(data) => data,
                    other => {
                        return Err(TemplateError::TypeMismatch {
                            expected: "node",
                            actual: other.kind_name(),
                            position: node.position,
                        }
                        .into());
                    }
                };
                let ns_override = self.eval_handler_namespaces(namespaces.as_ref(), node.position)?;
                self.invoke_node_handler(data, ns_override)?;
                Ok(Vec::new())
            }
            NodeKind::RecurseNode { target, namespaces } => {
                let data = match target {
                    Some(expr) => match self.eval_expr(expr, node.position)? {
                        Value::Node(data) => data,
                        other => {
                            return Err(TemplateError::TypeMismatch {
                                expected: "node",
                                actual: other.kind_name(),
                                position: node.position,
                            }
                            .into());
                        }
                    },
                    None => self.current_visitor_node.clone().ok_or_else(|| {
                        Interrupt::from(TemplateError::evaluation(
                            "recursion requires a node being processed",
                            node.position,
                        ))
                    })?,
                };
                let ns_override = self.eval_handler_namespaces(namespaces.as_ref(), node.position)?;
                self.recurse_children(&data, ns_override)?;
                Ok(Vec::new())
            }
            NodeKind::Fallback => {
                self.node_fallback()?;
                Ok(Vec::new())
            }
            NodeKind::Setting { name, value } => {
                let text = self.eval_to_string(value, node.position)?;
                self.apply_setting(name, &text, node.position)
                    .map_err(Interrupt::from)?;
                Ok(Vec::new())
            }
        }
    }

    fn with_local_context<T>(
        &mut self,
        frame: Rc<dyn LocalContext>,
        f: impl FnOnce(&mut Self) -> ExecResult<T>,
    ) -> ExecResult<T> {
        self.local_context_stack.push(frame);
        let result = f(self);
        self.local_context_stack.pop();
        result
    }

    // ------------------------------------------------------------------
    // The error funnel

    /// Offer a template error to the handler, exactly once per error
    /// value. I/O errors and stop signals bypass the handler.
    fn funnel_error(&mut self, err: EngineError) -> ExecResult<()> {
        let error = match err {
            EngineError::Io(e) => return Err(Interrupt::Error(EngineError::Io(e))),
            EngineError::Template(error) => error,
        };
        if self
            .last_error
            .as_ref()
            .is_some_and(|last| Arc::ptr_eq(last, &error))
        {
            // Already offered to the handler further down the stack.
            return Err(error.into());
        }
        self.last_error = Some(error.clone());
        if error.bypasses_handler() {
            return Err(error.into());
        }
        let handler = self.effective_error_handler();
        match handler.handle(&error, self) {
            Ok(()) => Ok(()),
            Err(rethrown) => {
                if self.in_attempt_block {
                    // The rethrown error is about to be swallowed by the
                    // recovery section; report the original.
                    let reporter = self.effective_attempt_reporter();
                    reporter.report(&error, self);
                }
                Err(Interrupt::Error(rethrown))
            }
        }
    }

    // ------------------------------------------------------------------
    // Expression evaluation

    pub(crate) fn eval_expr(&mut self, expr: &Expr, position: SourcePos) -> ExecResult<Value> {
        match expr {
            Expr::Literal(scalar) => Ok(Value::Scalar(scalar.clone())),
            Expr::NullLiteral => Ok(Value::Null),
            Expr::Variable(name) => match self.get_variable(name).map_err(Interrupt::from)? {
                Some(value) => Ok(value),
                None => Err(self.invalid_reference(name, position)),
            },
            Expr::Dot(base, key) => {
                let base_value = self.eval_expr(base, position)?;
                match self.dot_lookup(&base_value, key, position)? {
                    Some(value) => Ok(value),
                    None => Err(self.invalid_reference(key, position)),
                }
            }
            Expr::FunctionCall {
                callee,
                positional,
                named,
            } => {
                let callee_value = self.eval_expr(callee, position)?;
                self.call_function(callee_value, positional, named, position)
            }
            Expr::Exists(inner) => {
                let present = matches!(
                    self.eval_optional(inner, position)?,
                    Some(v) if !v.is_null()
                );
                Ok(Value::from(present))
            }
            Expr::WithDefault(inner, default) => match self.eval_optional(inner, position)? {
                Some(v) if !v.is_null() => Ok(v),
                _ => self.eval_expr(default, position),
            },
            Expr::RecoveredErrorMessage => self
                .recovered_error_message()
                .map(Value::from)
                .map_err(Interrupt::from),
        }
    }

    /// Like `eval_expr`, but absence of a variable or hash key is
    /// `None` instead of an error. Used by the presence operators.
    fn eval_optional(&mut self, expr: &Expr, position: SourcePos) -> ExecResult<Option<Value>> {
        match expr {
            Expr::Variable(name) => self.get_variable(name).map_err(Interrupt::from),
            Expr::Dot(base, key) => match self.eval_optional(base, position)? {
                Some(base_value) => self.dot_lookup(&base_value, key, position),
                None => Ok(None),
            },
            other => self.eval_expr(other, position).map(Some),
        }
    }

    fn dot_lookup(
        &mut self,
        base: &Value,
        key: &str,
        position: SourcePos,
    ) -> ExecResult<Option<Value>> {
        match base {
            Value::Hash(map) => Ok(map.get(key).cloned()),
            Value::Namespace(ns) => {
                let ns = ns.clone();
                self.namespace_get(&ns, key).map_err(Interrupt::from)
            }
            other => Err(TemplateError::TypeMismatch {
                expected: "hash or namespace",
                actual: other.kind_name(),
                position,
            }
            .into()),
        }
    }

    fn eval_to_string(&mut self, expr: &Expr, position: SourcePos) -> ExecResult<String> {
        let value = self.eval_expr(expr, position)?;
        match value.as_str() {
            Some(s) => Ok(s.to_string()),
            None => Err(TemplateError::TypeMismatch {
                expected: "string",
                actual: value.kind_name(),
                position,
            }
            .into()),
        }
    }

    fn invalid_reference(&self, name: &str, position: SourcePos) -> Interrupt {
        if self.fast_invalid_references {
            TemplateError::FastInvalidReference.into()
        } else {
            TemplateError::InvalidReference {
                name: name.to_string(),
                position,
            }
            .into()
        }
    }

    /// Render a scalar through the format caches.
    fn format_value(&mut self, value: &Value, position: SourcePos) -> ExecResult<String> {
        match value {
            Value::Scalar(Scalar::String(s)) => Ok(s.clone()),
            Value::Scalar(Scalar::Number(n)) => {
                let formatter = self.number_formatter()?;
                Ok(formatter.format(*n)?)
            }
            Value::Scalar(Scalar::Bool(b)) => {
                let formatter = self.boolean_formatter()?;
                Ok(formatter.format(*b).to_string())
            }
            Value::Scalar(Scalar::DateTime(dt)) => {
                let formatter = self.date_formatter(dt.kind, dt.zoneless, dt.sql)?;
                Ok(formatter.format(dt)?)
            }
            Value::Null => Err(self.invalid_reference("(null value)", position)),
            other => Err(TemplateError::TypeMismatch {
                expected: "string, number, boolean, or date-time",
                actual: other.kind_name(),
                position,
            }
            .into()),
        }
    }

    // ------------------------------------------------------------------
    // Variable resolution and assignment

    /// Resolve a simple name through the full scoping order: local
    /// context frames (innermost first), invocation locals, the current
    /// namespace, globals, root data, then configuration shared
    /// variables. `Ok(None)` means absent everywhere.
    pub fn get_variable(&mut self, name: &str) -> EngineResult<Option<Value>> {
        if let Some(value) = self
            .local_context_stack
            .iter_top_down()
            .find_map(|frame| frame.local_variable(name))
        {
            return Ok(Some(value));
        }
        if let Some(ctx) = &self.current_invocation {
            if let Some(value) = ctx.local(name) {
                return Ok(Some(value));
            }
        }
        let current = self.current_namespace.clone();
        if let Some(value) = self.namespace_get(&current, name)? {
            return Ok(Some(value));
        }
        if let Some(value) = self.global_namespace.borrow().get(name) {
            return Ok(Some(value));
        }
        if let Some(value) = self.root_data.get(name) {
            return Ok(Some(value.clone()));
        }
        Ok(self.configuration.wrapped_shared_variable(name))
    }

    /// Bind in the current namespace.
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.current_namespace.borrow_mut().put(name, value);
    }

    /// Bind in the globals namespace, visible from every namespace but
    /// below all of them in the resolution order... above root data.
    pub fn set_global_variable(&mut self, name: impl Into<String>, value: Value) {
        self.global_namespace.borrow_mut().put(name, value);
    }

    /// Bind a local in the innermost macro/function invocation.
    pub fn set_local_variable(
        &mut self,
        name: impl Into<String>,
        value: Value,
    ) -> Result<(), TemplateError> {
        match &self.current_invocation {
            Some(ctx) => {
                ctx.set_local(name, value);
                Ok(())
            }
            None => Err(TemplateError::evaluation(
                "local variables require an enclosing macro or function call",
                SourcePos::default(),
            )),
        }
    }

    /// Every name `get_variable` could resolve right now.
    pub fn known_variable_names(&mut self) -> EngineResult<BTreeSet<String>> {
        let mut names: BTreeSet<String> = self
            .configuration
            .shared_variable_names()
            .map(str::to_string)
            .collect();
        names.extend(self.root_data.keys().cloned());
        names.extend(self.global_namespace.borrow().keys());
        let current = self.current_namespace.clone();
        self.ensure_namespace_initialized(&current)?;
        names.extend(current.borrow().keys());
        if let Some(ctx) = &self.current_invocation {
            names.extend(ctx.local_names());
        }
        for frame in self.local_context_stack.iter_top_down() {
            names.extend(frame.local_variable_names());
        }
        Ok(names)
    }

    // ------------------------------------------------------------------
    // Namespaces, includes, imports

    /// Namespace lookup that forces lazy initialization first.
    pub fn namespace_get(
        &mut self,
        ns: &NamespaceRef,
        name: &str,
    ) -> EngineResult<Option<Value>> {
        self.ensure_namespace_initialized(ns)?;
        let value = ns.borrow().get(name);
        Ok(value)
    }

    /// Force a lazily imported namespace. Idempotent once initialized;
    /// re-entrant accesses during initialization see the namespace
    /// as-is; a failed initialization is remembered and never retried.
    pub fn ensure_namespace_initialized(&mut self, ns: &NamespaceRef) -> EngineResult<()> {
        let (template_name, locale, lookup_condition) = {
            let data = ns.borrow();
            match data.status() {
                InitStatus::Initialized | InitStatus::Initializing => return Ok(()),
                InitStatus::Failed => {
                    let template_name = data
                        .lazy
                        .as_ref()
                        .map(|l| l.template_name.clone())
                        .unwrap_or_default();
                    return Err(TemplateError::LazyNamespaceInitNotRetried { template_name }.into());
                }
                InitStatus::Uninitialized => match &data.lazy {
                    Some(lazy) => (
                        lazy.template_name.clone(),
                        lazy.locale.clone(),
                        lazy.lookup_condition.clone(),
                    ),
                    None => return Ok(()),
                },
            }
        };
        ns.borrow_mut().set_status(InitStatus::Initializing);
        tracing::debug!(template = %template_name, "Lazily initializing imported namespace");
        let result =
            self.run_lazy_initialization(ns, &template_name, &locale, lookup_condition.as_deref());
        match result {
            Ok(()) => {
                ns.borrow_mut().set_status(InitStatus::Initialized);
                Ok(())
            }
            Err(cause) => {
                ns.borrow_mut().set_status(InitStatus::Failed);
                Err(TemplateError::LazyNamespaceInitFailed {
                    template_name,
                    cause: cause.to_string(),
                }
                .into())
            }
        }
    }

    fn run_lazy_initialization(
        &mut self,
        ns: &NamespaceRef,
        template_name: &str,
        locale: &str,
        lookup_condition: Option<&str>,
    ) -> EngineResult<()> {
        let template = self
            .configuration
            .resolver()
            .resolve(template_name, locale, lookup_condition)?
            .ok_or_else(|| {
                EngineError::from(TemplateError::TemplateNotFound {
                    name: template_name.to_string(),
                })
            })?;
        ns.borrow_mut().set_template(template.clone());
        // The library runs under the locale snapshotted at import time.
        let prev_locale = self.settings.locale.clone();
        self.set_locale(locale.to_string());
        let result = self.initialize_import_namespace(ns, &template);
        match prev_locale {
            Some(locale) => self.set_locale(locale),
            None => {
                let before = self.effective_locale();
                self.settings.locale = None;
                if self.effective_locale() != before {
                    self.caches.on_locale_changed();
                }
            }
        }
        result
    }

    /// Run a library template's top level with the library namespace
    /// current and output discarded.
    fn initialize_import_namespace(
        &mut self,
        ns: &NamespaceRef,
        template: &Arc<Template>,
    ) -> EngineResult<()> {
        let prev_namespace = std::mem::replace(&mut self.current_namespace, ns.clone());
        let prev_out = std::mem::replace(&mut self.out, Box::new(NullSink));
        let result = run_to_completion(self.include_template(template));
        self.out = prev_out;
        self.current_namespace = prev_namespace;
        result
    }

    /// Include a template by name: its macros join the current
    /// namespace, then its content runs against the current output.
    pub(crate) fn include_by_name(&mut self, name: &str) -> ExecResult<()> {
        let template = self.resolve_required(name).map_err(Interrupt::from)?;
        self.include_template(&template)
    }

    pub(crate) fn include_template(&mut self, template: &Arc<Template>) -> ExecResult<()> {
        tracing::debug!(template = %template.name(), "Including template");
        self.import_macros(template);
        self.template_stack.push(template.clone());
        let root = template.root().clone();
        let result = self.visit(&root);
        self.template_stack.pop();
        result
    }

    fn resolve_required(&mut self, name: &str) -> EngineResult<Arc<Template>> {
        let locale = self.effective_locale();
        let condition = self.current_template().lookup_condition().map(str::to_string);
        self.configuration
            .resolver()
            .resolve(name, &locale, condition.as_deref())?
            .ok_or_else(|| {
                EngineError::from(TemplateError::TemplateNotFound {
                    name: name.to_string(),
                })
            })
    }

    fn import_macros(&mut self, template: &Arc<Template>) {
        for definition in template.macros().to_vec() {
            self.define_callable(&definition);
        }
    }

    fn define_callable(&mut self, node: &Arc<Node>) {
        let Some(def) = node.as_macro() else { return };
        let callable = Rc::new(TemplateCallable {
            definition: node.clone(),
            namespace: self.current_namespace.clone(),
            function: def.function,
        });
        let value = if def.function {
            Value::Function(callable)
        } else {
            Value::Directive(callable)
        };
        self.current_namespace.borrow_mut().put(def.name.clone(), value);
    }

    /// Import a library template under `alias`.
    ///
    /// The same normalized template name always yields the same
    /// namespace within one execution. When importing from the main
    /// namespace, the alias is also bound globally. Re-importing an
    /// existing lazy namespace with `lazy == false` forces it.
    pub fn import_lib(
        &mut self,
        template_name: &str,
        alias: Option<&str>,
        lazy: bool,
    ) -> EngineResult<NamespaceRef> {
        let key = normalize_template_name(template_name).to_string();
        let (ns, to_init) = match self.loaded_libs.get(&key).cloned() {
            Some(existing) => (existing, None),
            None if lazy => {
                let locale = self.effective_locale();
                let condition = self.current_template().lookup_condition().map(str::to_string);
                let ns = NamespaceData::new_lazy(key.clone(), locale, condition);
                self.loaded_libs.insert(key.clone(), ns.clone());
                (ns, None)
            }
            None => {
                let template = self.resolve_required(&key)?;
                let ns = NamespaceData::new(Some(template.clone()));
                self.loaded_libs.insert(key.clone(), ns.clone());
                (ns, Some(template))
            }
        };
        if let Some(alias) = alias {
            self.current_namespace
                .borrow_mut()
                .put(alias, Value::Namespace(ns.clone()));
            if Rc::ptr_eq(&self.current_namespace, &self.main_namespace) {
                self.global_namespace
                    .borrow_mut()
                    .put(alias, Value::Namespace(ns.clone()));
            }
        }
        match to_init {
            Some(template) => self.initialize_import_namespace(&ns, &template)?,
            None if !lazy => self.ensure_namespace_initialized(&ns)?,
            None => {}
        }
        Ok(ns)
    }

    /// Configuration-, template-, and execution-level auto-imports, in
    /// that order. For the same alias the most specific level wins and
    /// suppresses the others entirely.
    fn do_auto_imports(&mut self) -> EngineResult<()> {
        let lazy = self.effective_lazy_auto_imports();
        let config_imports = self.configuration.settings().auto_imports.clone();
        let template_imports = self.main_template.settings().auto_imports.clone();
        let env_imports = self.settings.auto_imports.clone();
        if let Some(imports) = &config_imports {
            for (alias, name) in imports.iter() {
                let overridden = template_imports
                    .as_ref()
                    .is_some_and(|m| m.contains_key(alias))
                    || env_imports.as_ref().is_some_and(|m| m.contains_key(alias));
                if !overridden {
                    self.import_lib(name, Some(alias), lazy)?;
                }
            }
        }
        if let Some(imports) = &template_imports {
            for (alias, name) in imports.iter() {
                let overridden = env_imports.as_ref().is_some_and(|m| m.contains_key(alias));
                if !overridden {
                    self.import_lib(name, Some(alias), lazy)?;
                }
            }
        }
        if let Some(imports) = &env_imports {
            for (alias, name) in imports.iter() {
                self.import_lib(name, Some(alias), lazy)?;
            }
        }
        Ok(())
    }

    /// Auto-includes run after auto-imports, with the same override
    /// rule by template name.
    fn do_auto_includes(&mut self) -> ExecResult<()> {
        let config_includes = self.configuration.settings().auto_includes.clone();
        let template_includes = self.main_template.settings().auto_includes.clone();
        let env_includes = self.settings.auto_includes.clone();
        if let Some(includes) = &config_includes {
            for name in includes {
                let overridden = self.main_template.settings().has_auto_include(name)
                    || self.settings.has_auto_include(name);
                if !overridden {
                    self.include_by_name(name)?;
                }
            }
        }
        if let Some(includes) = &template_includes {
            for name in includes {
                if !self.settings.has_auto_include(name) {
                    self.include_by_name(name)?;
                }
            }
        }
        if let Some(includes) = &env_includes {
            for name in includes {
                self.include_by_name(name)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Macro and function calls

    /// Run a callable's body in a fresh invocation frame: arguments are
    /// already bound to slots (caller's scope); defaults are filled here
    /// in the callee's scope. The caller's local-context stack is parked
    /// in the frame and the callable's defining namespace becomes
    /// current. All of it is restored on every exit path; a `return`
    /// signal ends the body normally.
    fn generic_execute(
        &mut self,
        callable: &Rc<TemplateCallable>,
        call_site: Option<Arc<Node>>,
        args: Vec<Option<Value>>,
        discard_output: bool,
    ) -> ExecResult<()> {
        self.instruction_stack.push(callable.definition.clone());
        let ctx = InvocationContext::new(
            callable.clone(),
            call_site,
            self.current_namespace.clone(),
            self.current_invocation.take(),
        );
        self.current_invocation = Some(ctx.clone());
        *ctx.saved_local_context_stack.borrow_mut() =
            std::mem::take(&mut self.local_context_stack);
        let prev_namespace =
            std::mem::replace(&mut self.current_namespace, callable.namespace.clone());
        let definition_template = callable
            .namespace
            .borrow()
            .template()
            .unwrap_or_else(|| self.main_template.clone());
        self.template_stack.push(definition_template);
        let prev_out = if discard_output {
            Some(std::mem::replace(&mut self.out, Box::new(NullSink)))
        } else {
            None
        };

        let result = self
            .fill_locals_from_arguments(&ctx, args)
            .and_then(|()| self.visit_all(&callable.layout().body));
        let result = match result {
            Ok(()) | Err(Interrupt::Return) => Ok(()),
            Err(Interrupt::Error(err)) => self.funnel_error(err),
        };

        if let Some(prev) = prev_out {
            self.out = prev;
        }
        self.template_stack.pop();
        self.current_namespace = prev_namespace;
        self.local_context_stack = ctx
            .saved_local_context_stack
            .replace(LocalContextStack::default());
        self.current_invocation = ctx.prev.clone();
        self.instruction_stack.pop();
        result
    }

    /// Slot values become invocation locals; empty or null slots fall
    /// back to the declared default, evaluated here so defaults can use
    /// earlier parameters.
    fn fill_locals_from_arguments(
        &mut self,
        ctx: &InvocationContext,
        args: Vec<Option<Value>>,
    ) -> ExecResult<()> {
        let definition = ctx.callable.definition.clone();
        let position = definition.position;
        for (index, arg) in args.into_iter().enumerate() {
            let layout = &ctx.callable.layout().params;
            let name = layout.slot_name(index).to_string();
            let value = match arg {
                Some(v) if !v.is_null() => v,
                _ => match layout.slot_default(index) {
                    Some(default) => {
                        let default = default.clone();
                        let v = self.eval_expr(&default, position)?;
                        if v.is_null() {
                            return Err(TemplateError::evaluation(
                                format!(
                                    "the default value of parameter {:?} evaluated to null",
                                    name
                                ),
                                position,
                            )
                            .into());
                        }
                        v
                    }
                    None => {
                        return Err(TemplateError::MissingRequiredArgument {
                            callable_kind: ctx.callable.kind_name(),
                            name: ctx.callable.name().to_string(),
                            parameter: name,
                        }
                        .into());
                    }
                },
            };
            ctx.set_local(name, value);
        }
        Ok(())
    }

    /// Call a function value from expression position. The body runs
    /// against a null sink; its `return` value is the result.
    fn call_function(
        &mut self,
        callee: Value,
        positional: &[Expr],
        named: &[(String, Expr)],
        position: SourcePos,
    ) -> ExecResult<Value> {
        match callee {
            Value::Function(function) => {
                let args = bind_arguments(self, &function, positional, named, position)?;
                let saved = self.last_return_value.take();
                let result = self.generic_execute(&function, None, args, true);
                let returned = self.last_return_value.take();
                self.last_return_value = saved;
                result?;
                Ok(returned.unwrap_or(Value::Null))
            }
            Value::Directive(_) => Err(TemplateError::evaluation(
                "routine is a directive, not a function; use a directive call",
                position,
            )
            .into()),
            other => Err(TemplateError::NotCallable {
                actual: other.kind_name(),
                position,
            }
            .into()),
        }
    }

    /// Run the call site's body from inside a directive body. The
    /// engine unwinds to the caller's world: its invocation frame, its
    /// namespace, and its parked local-context stack, with the nested
    /// content parameters pushed as one extra frame.
    fn execute_nested_content(
        &mut self,
        values: Vec<Value>,
        position: SourcePos,
    ) -> ExecResult<()> {
        let Some(ctx) = self.current_invocation.clone() else {
            return Err(TemplateError::evaluation(
                "nested content can only be executed inside a directive body",
                position,
            )
            .into());
        };
        let Some(call_site) = ctx.call_site.clone() else {
            return Ok(());
        };
        let (body, param_names) = match &call_site.kind {
            NodeKind::Call(site) => (
                site.nested_content.clone(),
                site.nested_content_params.clone(),
            ),
            _ => (Vec::new(), Vec::new()),
        };
        if body.is_empty() {
            return Ok(());
        }

        self.current_invocation = ctx.prev.clone();
        let prev_namespace = std::mem::replace(
            &mut self.current_namespace,
            ctx.nested_content_namespace.clone(),
        );
        let body_stack = std::mem::replace(
            &mut self.local_context_stack,
            ctx.saved_local_context_stack
                .replace(LocalContextStack::default()),
        );

        let result = if param_names.is_empty() {
            self.visit_all(&body)
        } else {
            let frame: Rc<dyn LocalContext> = Rc::new(LocalBindings::new(param_names, values));
            self.with_local_context(frame, |env| env.visit_all(&body))
        };

        let caller_stack = std::mem::replace(&mut self.local_context_stack, body_stack);
        ctx.saved_local_context_stack.replace(caller_stack);
        self.current_namespace = prev_namespace;
        self.current_invocation = Some(ctx);
        result
    }

    // ------------------------------------------------------------------
    // Attempt / recover

    /// Run the attempted block with output buffered. On success the
    /// buffer is flushed to the real sink; on a template error nothing
    /// of it is written and the recovery section runs with the error
    /// available through `recovered_error_message`.
    fn visit_attempt_recover(
        &mut self,
        attempted: &Arc<Node>,
        recovery: &[Arc<Node>],
    ) -> ExecResult<()> {
        let buffer = StringSink::new();
        let prev_out = std::mem::replace(&mut self.out, Box::new(buffer.clone()));
        let prev_fast = self.fast_invalid_references;
        self.fast_invalid_references = true;
        let prev_attempt = self.in_attempt_block;
        self.in_attempt_block = true;

        let result = self.visit(attempted);

        self.in_attempt_block = prev_attempt;
        self.fast_invalid_references = prev_fast;
        self.out = prev_out;

        match result {
            Ok(()) => {
                let text = buffer.into_string();
                self.write_text(&text).map_err(Interrupt::from)
            }
            Err(Interrupt::Error(EngineError::Template(error))) => {
                // A stop signal is never recovered.
                if error.bypasses_handler() {
                    return Err(error.into());
                }
                tracing::debug!(error = %error, "Recovering from error in attempted section");
                self.recovered_error_stack.push(error);
                let result = self.visit_all(recovery);
                self.recovered_error_stack.pop();
                result
            }
            // I/O failures and return signals are not recoverable here.
            Err(other) => Err(other),
        }
    }

    /// The message of the error being recovered, available only while a
    /// recovery section runs.
    pub fn recovered_error_message(&self) -> Result<String, TemplateError> {
        self.recovered_error_stack
            .last()
            .map(|e| e.to_string())
            .ok_or(TemplateError::NoRecoveredError)
    }

    // ------------------------------------------------------------------
    // Node handler dispatch

    /// Dispatch a data node to its handler directive. The handler is
    /// searched by node name through the handler namespaces in order;
    /// when none is found, `@<type>` default handlers are tried, then
    /// the built-in defaults (text prints, documents recurse into their
    /// children, comments and processing instructions are skipped,
    /// everything else is an error).
    pub(crate) fn invoke_node_handler(
        &mut self,
        node: Rc<DataNode>,
        namespaces: Option<Vec<NamespaceRef>>,
    ) -> ExecResult<()> {
        if self.node_handler_namespaces.is_empty() {
            self.node_handler_namespaces.push(self.current_namespace.clone());
        }
        let saved_node = self.current_visitor_node.take();
        let saved_namespaces = namespaces
            .map(|ns| std::mem::replace(&mut self.node_handler_namespaces, ns));
        let saved_index = self.node_handler_index;
        let saved_name = self.current_node_name.take();
        let saved_uri = self.current_node_namespace_uri.take();
        self.current_visitor_node = Some(node.clone());

        let result = self.dispatch_node(&node);

        self.current_node_namespace_uri = saved_uri;
        self.current_node_name = saved_name;
        self.node_handler_index = saved_index;
        if let Some(ns) = saved_namespaces {
            self.node_handler_namespaces = ns;
        }
        self.current_visitor_node = saved_node;
        result
    }

    fn dispatch_node(&mut self, node: &Rc<DataNode>) -> ExecResult<()> {
        if let Some(handler) =
            self.find_node_handler(&node.name, node.namespace_uri.as_deref(), 0)?
        {
            self.current_node_name = Some(node.name.clone());
            self.current_node_namespace_uri = node.namespace_uri.clone();
            return self.execute_node_handler(handler);
        }
        let default_name = format!("@{}", node.type_name());
        if let Some(handler) = self.find_node_handler(&default_name, None, 0)? {
            self.current_node_name = Some(default_name);
            self.current_node_namespace_uri = None;
            return self.execute_node_handler(handler);
        }
        match node.kind {
            DataNodeKind::Text => {
                let text = node.text.clone().unwrap_or_default();
                self.write_text(&text).map_err(Interrupt::from)
            }
            DataNodeKind::Document => self.recurse_children(node, None),
            DataNodeKind::ProcessingInstruction
            | DataNodeKind::Comment
            | DataNodeKind::Doctype => Ok(()),
            DataNodeKind::Element => Err(TemplateError::NoNodeHandler {
                node_name: node.name.clone(),
                node_type: node.type_name(),
            }
            .into()),
        }
    }

    /// Search the handler namespaces from `start_index` for a directive
    /// matching the node name (prefix-qualified when the node has a
    /// namespace URI). Records where the handler was found so that
    /// `fallback` can resume after it.
    fn find_node_handler(
        &mut self,
        name: &str,
        namespace_uri: Option<&str>,
        start_index: usize,
    ) -> ExecResult<Option<Rc<TemplateCallable>>> {
        let namespaces = self.node_handler_namespaces.clone();
        for (index, ns) in namespaces.iter().enumerate().skip(start_index) {
            self.ensure_namespace_initialized(ns).map_err(Interrupt::from)?;
            let key = match namespace_uri {
                None => Some(name.to_string()),
                Some(uri) => {
                    let template = ns
                        .borrow()
                        .template()
                        .unwrap_or_else(|| self.main_template.clone());
                    template.prefix_for_namespace_uri(uri).map(|prefix| {
                        if prefix.is_empty() {
                            name.to_string()
                        } else {
                            format!("{}:{}", prefix, name)
                        }
                    })
                }
            };
            let Some(key) = key else { continue };
            if let Some(Value::Directive(handler)) =
                self.namespace_get(ns, &key).map_err(Interrupt::from)?
            {
                self.node_handler_index = index + 1;
                return Ok(Some(handler));
            }
        }
        Ok(None)
    }

    fn execute_node_handler(&mut self, handler: Rc<TemplateCallable>) -> ExecResult<()> {
        let args = bind_arguments(self, &handler, &[], &[], SourcePos::default())?;
        self.generic_execute(&handler, None, args, false)
    }

    /// Continue the handler search where the current handler was found.
    /// A no-op when no later namespace has a handler.
    fn node_fallback(&mut self) -> ExecResult<()> {
        let Some(name) = self.current_node_name.clone() else {
            return Err(TemplateError::evaluation(
                "fallback is only valid while a node handler is running",
                SourcePos::default(),
            )
            .into());
        };
        let uri = self.current_node_namespace_uri.clone();
        let start = self.node_handler_index;
        match self.find_node_handler(&name, uri.as_deref(), start)? {
            Some(handler) => self.execute_node_handler(handler),
            None => Ok(()),
        }
    }

    /// Dispatch every child of `node` in order.
    pub(crate) fn recurse_children(
        &mut self,
        node: &Rc<DataNode>,
        namespaces: Option<Vec<NamespaceRef>>,
    ) -> ExecResult<()> {
        for child in node.children.clone() {
            self.invoke_node_handler(child, namespaces.clone())?;
        }
        Ok(())
    }

    fn eval_handler_namespaces(
        &mut self,
        expr: Option<&Expr>,
        position: SourcePos,
    ) -> ExecResult<Option<Vec<NamespaceRef>>> {
        let Some(expr) = expr else { return Ok(None) };
        let value = self.eval_expr(expr, position)?;
        match value {
            Value::Namespace(ns) => Ok(Some(vec![ns])),
            Value::Sequence(items) => {
                let mut namespaces = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Namespace(ns) => namespaces.push(ns),
                        other => {
                            return Err(TemplateError::TypeMismatch {
                                expected: "namespace",
                                actual: other.kind_name(),
                                position,
                            }
                            .into());
                        }
                    }
                }
                Ok(Some(namespaces))
            }
            other => Err(TemplateError::TypeMismatch {
                expected: "namespace or sequence of namespaces",
                actual: other.kind_name(),
                position,
            }
            .into()),
        }
    }

    // ------------------------------------------------------------------
    // Instruction stack dump

    /// Render the instruction stack, topmost frame first. Hidden-by-
    /// default frames (literal text, containers) appear only when
    /// topmost. Terse mode caps the output at
    /// [`TERSE_STACK_FRAME_LIMIT`] frames and notes how many were
    /// elided; nesting-transfer frames are marked with `~`.
    pub fn instruction_stack_dump(&self, terse: bool) -> String {
        let frames = self.visible_stack_frames();
        if frames.is_empty() {
            return "(the stack was empty)".to_string();
        }
        let total = frames.len();
        let shown = if terse {
            total.min(TERSE_STACK_FRAME_LIMIT)
        } else {
            total
        };
        let mut out = String::new();
        for (i, frame) in frames.iter().take(shown).enumerate() {
            let marker = if i == 0 {
                "- Failed at: "
            } else if frame.is_nesting_related() {
                "~ Reached through: "
            } else {
                "- Reached through: "
            };
            out.push_str(marker);
            out.push_str(&frame.description());
            out.push_str(&format!(" [{}]\n", frame.position));
        }
        if shown < total {
            out.push_str(&format!("... ({} frames hidden)\n", total - shown));
        }
        out
    }

    fn visible_stack_frames(&self) -> Vec<Arc<Node>> {
        let mut frames = Vec::new();
        let top = self.instruction_stack.len().saturating_sub(1);
        for (i, node) in self.instruction_stack.iter().enumerate().rev() {
            if i == top || node.shown_in_stack_trace {
                frames.push(node.clone());
            }
        }
        frames
    }

    /// Current depth of the instruction stack. Zero between visits.
    pub fn instruction_stack_depth(&self) -> usize {
        self.instruction_stack.len()
    }

    /// Current depth of the local-context stack.
    pub fn local_context_stack_depth(&self) -> usize {
        self.local_context_stack.len()
    }

    // ------------------------------------------------------------------
    // Settings cascade

    pub fn effective_locale(&self) -> String {
        self.settings
            .locale
            .clone()
            .or_else(|| self.main_template.settings().locale.clone())
            .or_else(|| self.configuration.settings().locale.clone())
            .unwrap_or_else(|| DEFAULT_LOCALE.to_string())
    }

    pub fn effective_time_zone(&self) -> String {
        self.settings
            .time_zone
            .clone()
            .or_else(|| self.main_template.settings().time_zone.clone())
            .or_else(|| self.configuration.settings().time_zone.clone())
            .unwrap_or_else(|| DEFAULT_TIME_ZONE.to_string())
    }

    /// `None` means database-sourced values use the normal time zone.
    pub fn effective_sql_time_zone(&self) -> Option<String> {
        self.settings
            .sql_time_zone
            .clone()
            .or_else(|| self.main_template.settings().sql_time_zone.clone())
            .or_else(|| self.configuration.settings().sql_time_zone.clone())
    }

    pub fn effective_number_format(&self) -> String {
        self.settings
            .number_format
            .clone()
            .or_else(|| self.main_template.settings().number_format.clone())
            .or_else(|| self.configuration.settings().number_format.clone())
            .unwrap_or_else(|| DEFAULT_NUMBER_FORMAT.to_string())
    }

    pub fn effective_boolean_format(&self) -> String {
        self.settings
            .boolean_format
            .clone()
            .or_else(|| self.main_template.settings().boolean_format.clone())
            .or_else(|| self.configuration.settings().boolean_format.clone())
            .unwrap_or_else(|| DEFAULT_BOOLEAN_FORMAT.to_string())
    }

    pub fn effective_date_like_format(&self, kind: DateTimeKind) -> String {
        let per_level = |s: &Settings| match kind {
            DateTimeKind::Date => s.date_format.clone(),
            DateTimeKind::Time => s.time_format.clone(),
            DateTimeKind::DateTime | DateTimeKind::Unknown => s.datetime_format.clone(),
        };
        per_level(&self.settings)
            .or_else(|| per_level(self.main_template.settings()))
            .or_else(|| per_level(self.configuration.settings()))
            .unwrap_or_else(|| DEFAULT_DATE_LIKE_FORMAT.to_string())
    }

    pub fn effective_auto_flush(&self) -> bool {
        self.settings
            .auto_flush
            .or(self.main_template.settings().auto_flush)
            .or(self.configuration.settings().auto_flush)
            .unwrap_or(true)
    }

    pub fn effective_lazy_imports(&self) -> bool {
        self.settings
            .lazy_imports
            .or(self.main_template.settings().lazy_imports)
            .or(self.configuration.settings().lazy_imports)
            .unwrap_or(false)
    }

    pub fn effective_lazy_auto_imports(&self) -> bool {
        self.settings
            .lazy_auto_imports
            .or(self.main_template.settings().lazy_auto_imports)
            .or(self.configuration.settings().lazy_auto_imports)
            .unwrap_or_else(|| self.effective_lazy_imports())
    }

    pub fn effective_error_handler(&self) -> Arc<dyn TemplateErrorHandler> {
        self.settings
            .error_handler
            .clone()
            .or_else(|| self.main_template.settings().error_handler.clone())
            .or_else(|| self.configuration.settings().error_handler.clone())
            .unwrap_or_else(|| Arc::new(RethrowHandler))
    }

    pub fn effective_attempt_reporter(&self) -> Arc<dyn AttemptReporter> {
        self.settings
            .attempt_reporter
            .clone()
            .or_else(|| self.main_template.settings().attempt_reporter.clone())
            .or_else(|| self.configuration.settings().attempt_reporter.clone())
            .unwrap_or_else(|| Arc::new(LogAttemptReporter))
    }

    // ------------------------------------------------------------------
    // Setting mutation with partial cache invalidation

    pub fn set_locale(&mut self, locale: impl Into<String>) {
        let locale = locale.into();
        let changed = self.effective_locale() != locale;
        self.settings.locale = Some(locale);
        if changed {
            self.caches.on_locale_changed();
        }
    }

    pub fn set_time_zone(&mut self, time_zone: impl Into<String>) {
        let time_zone = time_zone.into();
        let changed = self.effective_time_zone() != time_zone;
        self.settings.time_zone = Some(time_zone);
        if changed {
            self.caches.on_time_zone_changed();
        }
    }

    pub fn set_sql_time_zone(&mut self, time_zone: Option<String>) {
        let before = self.effective_sql_time_zone();
        self.settings.sql_time_zone = time_zone;
        if self.effective_sql_time_zone() != before {
            self.caches.on_sql_time_zone_changed();
        }
    }

    pub fn set_number_format(&mut self, format: impl Into<String>) {
        self.settings.number_format = Some(format.into());
        self.caches.on_number_format_changed();
    }

    pub fn set_boolean_format(&mut self, format: impl Into<String>) {
        self.settings.boolean_format = Some(format.into());
        self.caches.on_boolean_format_changed();
    }

    pub fn set_date_format(&mut self, format: impl Into<String>) {
        self.settings.date_format = Some(format.into());
        self.caches.on_date_format_changed(DateTimeKind::Date);
    }

    pub fn set_time_format(&mut self, format: impl Into<String>) {
        self.settings.time_format = Some(format.into());
        self.caches.on_date_format_changed(DateTimeKind::Time);
    }

    pub fn set_datetime_format(&mut self, format: impl Into<String>) {
        self.settings.datetime_format = Some(format.into());
        self.caches.on_date_format_changed(DateTimeKind::DateTime);
        self.caches.on_date_format_changed(DateTimeKind::Unknown);
    }

    pub fn set_url_escaping_charset(&mut self, charset: Option<String>) {
        self.settings.url_escaping_charset = charset;
        self.caches.on_url_escaping_charset_changed();
    }

    /// Apply a setting by name, as the `setting` directive does.
    pub fn apply_setting(
        &mut self,
        name: &str,
        value: &str,
        position: SourcePos,
    ) -> Result<(), TemplateError> {
        match name {
            "locale" => self.set_locale(value),
            "time_zone" => self.set_time_zone(value),
            "sql_time_zone" => self.set_sql_time_zone(Some(value.to_string())),
            "number_format" => self.set_number_format(value),
            "boolean_format" => self.set_boolean_format(value),
            "date_format" => self.set_date_format(value),
            "time_format" => self.set_time_format(value),
            "datetime_format" => self.set_datetime_format(value),
            "url_escaping_charset" => self.set_url_escaping_charset(Some(value.to_string())),
            other => {
                return Err(TemplateError::evaluation(
                    format!(
                        "unknown setting {:?}; supported settings are: locale, time_zone, \
                         sql_time_zone, number_format, boolean_format, date_format, \
                         time_format, datetime_format, url_escaping_charset",
                        other
                    ),
                    position,
                ));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Format cache accessors

    /// The cached formatter for the effective default number format.
    pub fn number_formatter(&mut self) -> EngineResult<Arc<dyn NumberFormatter>> {
        if let Some(f) = &self.caches.number_format {
            return Ok(f.clone());
        }
        let format = self.effective_number_format();
        let formatter = self.create_number_formatter(&format)?;
        self.caches.number_format = Some(formatter.clone());
        Ok(formatter)
    }

    /// Cached formatter for an explicit format string.
    pub fn number_formatter_for(&mut self, format: &str) -> EngineResult<Arc<dyn NumberFormatter>> {
        if let Some(f) = self.caches.number_formats_by_string.get(format) {
            return Ok(f.clone());
        }
        let formatter = self.create_number_formatter(format)?;
        self.caches
            .number_formats_by_string
            .insert(format.to_string(), formatter.clone());
        Ok(formatter)
    }

    fn create_number_formatter(&self, format: &str) -> EngineResult<Arc<dyn NumberFormatter>> {
        let locale = self.effective_locale();
        if let Some(rest) = format.strip_prefix('@') {
            let (name, params) = rest.split_once(' ').unwrap_or((rest, ""));
            let factory = self.configuration.custom_number_format(name).ok_or_else(|| {
                EngineError::from(TemplateError::InvalidFormatString {
                    format: format.to_string(),
                    detail: format!("no custom number format registered as {:?}", name),
                })
            })?;
            Ok(factory.create(params, &locale)?)
        } else {
            Ok(Arc::new(StandardNumberFormat::parse(format, &locale)?))
        }
    }

    pub fn boolean_formatter(&mut self) -> EngineResult<Arc<BooleanFormat>> {
        if let Some(f) = &self.caches.boolean_format {
            return Ok(f.clone());
        }
        let format = self.effective_boolean_format();
        let formatter = Arc::new(BooleanFormat::parse(&format)?);
        self.caches.boolean_format = Some(formatter.clone());
        Ok(formatter)
    }

    /// The cached default formatter for one combination of the value
    /// axes (subtype, zoneless, SQL-sourced).
    pub fn date_formatter(
        &mut self,
        kind: DateTimeKind,
        zoneless: bool,
        sql: bool,
    ) -> EngineResult<Arc<dyn DateTimeFormatter>> {
        // SQL-sourced values only occupy the SQL half of the cache when
        // a distinct SQL time zone is configured; otherwise they share
        // the normal-zone entries and their invalidation.
        let sql = sql && self.effective_sql_time_zone().is_some();
        let index = date_cache_index(kind, zoneless, sql);
        if let Some(f) = &self.caches.date_formats[index] {
            return Ok(f.clone());
        }
        let format = self.effective_date_like_format(kind);
        let formatter = self.create_date_formatter(&format, kind, zoneless, sql)?;
        self.caches.date_formats[index] = Some(formatter.clone());
        Ok(formatter)
    }

    /// Cached formatter for an explicit date/time format string plus
    /// value axes.
    pub fn date_formatter_for(
        &mut self,
        format: &str,
        kind: DateTimeKind,
        zoneless: bool,
        sql: bool,
    ) -> EngineResult<Arc<dyn DateTimeFormatter>> {
        let sql = sql && self.effective_sql_time_zone().is_some();
        let index = date_cache_index(kind, zoneless, sql);
        if let Some(f) = self.caches.date_formats_by_string[index]
            .as_ref()
            .and_then(|m| m.get(format))
        {
            return Ok(f.clone());
        }
        let formatter = self.create_date_formatter(format, kind, zoneless, sql)?;
        self.caches.date_formats_by_string[index]
            .get_or_insert_with(HashMap::new)
            .insert(format.to_string(), formatter.clone());
        Ok(formatter)
    }

    fn create_date_formatter(
        &self,
        format: &str,
        kind: DateTimeKind,
        zoneless: bool,
        sql: bool,
    ) -> EngineResult<Arc<dyn DateTimeFormatter>> {
        let locale = self.effective_locale();
        let zone = if sql {
            self.effective_sql_time_zone()
                .unwrap_or_else(|| self.effective_time_zone())
        } else {
            self.effective_time_zone()
        };
        let offset = parse_zone_offset(&zone)?;
        if let Some(rest) = format.strip_prefix('@') {
            let (name, params) = rest.split_once(' ').unwrap_or((rest, ""));
            let factory = self.configuration.custom_date_format(name).ok_or_else(|| {
                EngineError::from(TemplateError::InvalidFormatString {
                    format: format.to_string(),
                    detail: format!("no custom date format registered as {:?}", name),
                })
            })?;
            Ok(factory.create(params, kind, &locale, offset)?)
        } else {
            Ok(Arc::new(StandardDateTimeFormat::parse(
                format, kind, zoneless, offset, &locale,
            )?))
        }
    }

    /// The cached string collator for the effective locale.
    pub fn collator(&mut self) -> Arc<Collator> {
        if let Some(c) = &self.caches.collator {
            return c.clone();
        }
        let collator = Arc::new(Collator::new(self.effective_locale()));
        self.caches.collator = Some(collator.clone());
        collator
    }

    /// The effective URL-escaping charset, resolved once and cached
    /// until the setting changes. `None` means no escaping charset is
    /// configured.
    pub fn url_escaping_charset(&mut self) -> Option<String> {
        if let Some(resolved) = &self.caches.url_escaping_charset {
            return resolved.clone();
        }
        let resolved = self
            .settings
            .url_escaping_charset
            .clone()
            .or_else(|| self.main_template.settings().url_escaping_charset.clone())
            .or_else(|| {
                self.configuration
                    .settings()
                    .url_escaping_charset
                    .clone()
            });
        self.caches.url_escaping_charset = Some(resolved.clone());
        resolved
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("template", &self.main_template.name())
            .field("execution_id", &self.execution_id)
            .field("instruction_stack_depth", &self.instruction_stack.len())
            .finish()
    }
}
