/*
 * error.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Error types for template execution.
//!
//! Template-level failures are modeled as a single [`TemplateError`] enum.
//! The engine wraps them in `Arc` so the error funnel can recognize an
//! error it has already offered to the handler (de-duplication is by
//! pointer identity, not message equality) while the same value unwinds
//! through nested element visits.

use std::sync::Arc;

use thiserror::Error;

use crate::environment::Environment;
use crate::node::SourcePos;

/// Errors raised while executing a template.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("The following has evaluated to nothing or missing: {name} [{position}]")]
    InvalidReference { name: String, position: SourcePos },

    /// Reduced-detail variant used inside attempted sections, where the
    /// error is likely to be recovered and never shown to anyone.
    #[error("Invalid reference")]
    FastInvalidReference,

    #[error("Expected a value of type {expected}, but the value was of type {actual} [{position}]")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
        position: SourcePos,
    },

    #[error("Value of type {actual} is not callable [{position}]")]
    NotCallable {
        actual: &'static str,
        position: SourcePos,
    },

    #[error(
        "The called {callable_kind} {name:?} can only have {declared} arguments passed by \
         position, but the invocation has {passed} such arguments"
    )]
    TooManyPositionalArguments {
        callable_kind: &'static str,
        name: String,
        declared: usize,
        passed: usize,
    },

    #[error(
        "The called {callable_kind} {name:?} has no parameter that can be passed by name called \
         {argument:?}. The supported parameter names, which can be passed by name, are: {}",
        format_name_list(.valid_names)
    )]
    UnknownNamedArgument {
        callable_kind: &'static str,
        name: String,
        argument: String,
        valid_names: Vec<String>,
    },

    #[error(
        "When calling {callable_kind} {name:?}, required parameter {parameter:?} \
         was either not specified, or had evaluated to null"
    )]
    MissingRequiredArgument {
        callable_kind: &'static str,
        name: String,
        parameter: String,
    },

    #[error("Template not found: {name:?}")]
    TemplateNotFound { name: String },

    #[error("Lazy initialization of the imported namespace for {template_name:?} has failed: {cause}")]
    LazyNamespaceInitFailed { template_name: String, cause: String },

    #[error(
        "Lazy initialization of the imported namespace for {template_name:?} has already failed \
         earlier; won't retry it"
    )]
    LazyNamespaceInitNotRetried { template_name: String },

    #[error("No macro or directive is defined for node named {node_name:?} (node type {node_type:?})")]
    NoNodeHandler {
        node_name: String,
        node_type: &'static str,
    },

    #[error("Invalid format string {format:?}: {detail}")]
    InvalidFormatString { format: String, detail: String },

    #[error("Failed to format value with format {format:?}: {detail}")]
    FormatFailure { format: String, detail: String },

    /// Raised by the `stop` directive. Bypasses the pluggable error
    /// handler entirely so that stopping is never suppressed.
    #[error("Template processing was stopped: {message}")]
    Stopped { message: String },

    #[error("The recovered error message is only available inside a recovery section")]
    NoRecoveredError,

    #[error("Custom data initialization failed: {detail}")]
    CustomDataInitialization { detail: String },

    #[error("{message} [{position}]")]
    Evaluation { message: String, position: SourcePos },
}

impl TemplateError {
    /// Whether this error must bypass the pluggable error handler.
    pub fn bypasses_handler(&self) -> bool {
        matches!(self, TemplateError::Stopped { .. })
    }

    pub(crate) fn evaluation(message: impl Into<String>, position: SourcePos) -> Self {
        TemplateError::Evaluation {
            message: message.into(),
            position,
        }
    }
}

fn format_name_list(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

/// Errors surfaced by the engine as a whole. I/O failures from the output
/// sink are fatal and never routed through the template error handler.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Template(Arc<TemplateError>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// The template error inside, if this is a template error.
    pub fn as_template_error(&self) -> Option<&Arc<TemplateError>> {
        match self {
            EngineError::Template(e) => Some(e),
            EngineError::Io(_) => None,
        }
    }
}

impl From<TemplateError> for EngineError {
    fn from(e: TemplateError) -> Self {
        EngineError::Template(Arc::new(e))
    }
}

impl From<Arc<TemplateError>> for EngineError {
    fn from(e: Arc<TemplateError>) -> Self {
        EngineError::Template(e)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Non-error control flow shares the error channel during execution:
/// a `return` directive unwinds to the nearest enclosing call the same
/// way an error does, but is caught there and treated as success.
#[derive(Debug)]
pub(crate) enum Interrupt {
    Error(EngineError),
    Return,
}

impl From<EngineError> for Interrupt {
    fn from(e: EngineError) -> Self {
        Interrupt::Error(e)
    }
}

impl From<TemplateError> for Interrupt {
    fn from(e: TemplateError) -> Self {
        Interrupt::Error(e.into())
    }
}

impl From<Arc<TemplateError>> for Interrupt {
    fn from(e: Arc<TemplateError>) -> Self {
        Interrupt::Error(EngineError::Template(e))
    }
}

impl From<std::io::Error> for Interrupt {
    fn from(e: std::io::Error) -> Self {
        Interrupt::Error(EngineError::Io(e))
    }
}

pub(crate) type ExecResult<T> = Result<T, Interrupt>;

/// Strips the control-flow channel from an execution result. A stray
/// `return` outside of any call ends processing normally.
pub(crate) fn run_to_completion(result: ExecResult<()>) -> EngineResult<()> {
    match result {
        Ok(()) | Err(Interrupt::Return) => Ok(()),
        Err(Interrupt::Error(e)) => Err(e),
    }
}

/// Pluggable policy for template errors that reach the error funnel.
///
/// Returning `Ok(())` suppresses the error and lets execution continue
/// after the failed element; returning an error propagates it (usually
/// the same error that was passed in).
pub trait TemplateErrorHandler: Send + Sync {
    fn handle(&self, error: &Arc<TemplateError>, env: &mut Environment) -> EngineResult<()>;
}

/// Default handler: always rethrows.
#[derive(Debug, Clone, Copy, Default)]
pub struct RethrowHandler;

impl TemplateErrorHandler for RethrowHandler {
    fn handle(&self, error: &Arc<TemplateError>, _env: &mut Environment) -> EngineResult<()> {
        Err(error.clone().into())
    }
}

/// Handler that suppresses every error and continues execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreHandler;

impl TemplateErrorHandler for IgnoreHandler {
    fn handle(&self, error: &Arc<TemplateError>, _env: &mut Environment) -> EngineResult<()> {
        tracing::debug!(error = %error, "Ignoring template error");
        Ok(())
    }
}

/// Handler that writes the error message into the output, then rethrows.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugHandler;

impl TemplateErrorHandler for DebugHandler {
    fn handle(&self, error: &Arc<TemplateError>, env: &mut Environment) -> EngineResult<()> {
        env.write_text(&format!("[ERROR: {}]", error))?;
        Err(error.clone().into())
    }
}

/// Receives errors that occur inside an attempted section when the error
/// handler decided to rethrow. The error is about to be recovered, so
/// this is the only place it becomes visible.
pub trait AttemptReporter: Send + Sync {
    fn report(&self, error: &TemplateError, env: &Environment);
}

/// Default reporter: logs the error.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAttemptReporter;

impl AttemptReporter for LogAttemptReporter {
    fn report(&self, error: &TemplateError, _env: &Environment) {
        tracing::error!(error = %error, "Error in attempted section");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unknown_named_argument_lists_valid_names() {
        let err = TemplateError::UnknownNamedArgument {
            callable_kind: "macro",
            name: "greet".to_string(),
            argument: "nmae".to_string(),
            valid_names: vec!["name".to_string(), "salutation".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("nmae"), "{msg}");
        assert!(msg.contains("name, salutation"), "{msg}");
    }

    #[test]
    fn test_unknown_named_argument_with_no_valid_names() {
        let err = TemplateError::UnknownNamedArgument {
            callable_kind: "function",
            name: "f".to_string(),
            argument: "x".to_string(),
            valid_names: vec![],
        };
        assert!(err.to_string().contains("(none)"));
    }

    #[test]
    fn test_stopped_bypasses_handler() {
        let stopped = TemplateError::Stopped {
            message: "done".to_string(),
        };
        assert!(stopped.bypasses_handler());
        assert!(!TemplateError::FastInvalidReference.bypasses_handler());
    }

    #[test]
    fn test_engine_error_preserves_template_error_identity() {
        let inner = Arc::new(TemplateError::FastInvalidReference);
        let engine: EngineError = inner.clone().into();
        let recovered = engine.as_template_error().cloned();
        assert!(recovered.is_some_and(|r| Arc::ptr_eq(&r, &inner)));
    }

    #[test]
    fn test_invalid_reference_message_includes_position() {
        let err = TemplateError::InvalidReference {
            name: "user.name".to_string(),
            position: SourcePos::new(3, 7),
        };
        assert_eq!(
            err.to_string(),
            "The following has evaluated to nothing or missing: user.name [at line 3, column 7]"
        );
    }
}
