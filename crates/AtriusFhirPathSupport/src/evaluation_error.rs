//! # FHIRPath Compilation and Evaluation Errors
//!
//! Every failure raised while compiling a FHIRPath expression into a columnar plan,
//! or while executing that plan, is reported as an [`EvaluationError`].
//!
//! Errors fall into three categories (see [`ErrorCategory`]):
//!
//! - **User input**: the expression is malformed, refers to elements that do not
//!   exist, or uses constructs the evaluator does not support. These are surfaced
//!   verbatim to the caller and abort compilation of that one expression.
//! - **Service**: the terminology service was unreachable or returned something
//!   unusable. The whole membership evaluation is aborted and no rows are emitted.
//! - **Internal**: an invariant the compiler guarantees was violated. This is a
//!   defect, not something a user can fix.

use thiserror::Error;

/// Result alias used throughout the FHIRPath crates.
pub type EvaluationResult<T> = Result<T, EvaluationError>;

/// Coarse classification of an [`EvaluationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caused by the expression or its arguments; never retried.
    UserInput,
    /// Caused by an external collaborator such as the terminology service.
    Service,
    /// A broken internal guarantee.
    Internal,
}

/// Errors raised while compiling or executing a FHIRPath expression.
///
/// # Examples
///
/// ```rust
/// use atrius_fhirpath_support::evaluation_error::{ErrorCategory, EvaluationError};
///
/// let error = EvaluationError::UnknownElement("No such child: name.foo".to_string());
/// assert_eq!(error.category(), ErrorCategory::UserInput);
/// assert_eq!(error.to_string(), "Unknown element: No such child: name.foo");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    /// The expression text could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// An operation was applied to an operand it cannot accept, e.g. path
    /// traversal on a literal or a comparison on a non-singular collection.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A path segment does not name a child of its parent type.
    #[error("Unknown element: {0}")]
    UnknownElement(String),

    /// A binary operator token has no registered implementation.
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    /// The construct is valid FHIRPath grammar but cannot be evaluated here.
    #[error("Unsupported construct: {0}")]
    UnsupportedConstruct(String),

    /// A function invocation names no registered function.
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// A function received the wrong number or kind of arguments.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The terminology service failed during discovery or expansion.
    #[error("Terminology service error: {0}")]
    Terminology(String),

    /// An internal invariant was violated.
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
}

impl EvaluationError {
    /// Returns the category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EvaluationError::Parse(_)
            | EvaluationError::InvalidOperation(_)
            | EvaluationError::UnknownElement(_)
            | EvaluationError::UnsupportedOperator(_)
            | EvaluationError::UnsupportedConstruct(_)
            | EvaluationError::UnknownFunction(_)
            | EvaluationError::InvalidArgument(_) => ErrorCategory::UserInput,
            EvaluationError::Terminology(_) => ErrorCategory::Service,
            EvaluationError::Invariant(_) => ErrorCategory::Internal,
        }
    }

    /// True when the error was caused by the caller's expression.
    pub fn is_user_error(&self) -> bool {
        self.category() == ErrorCategory::UserInput
    }
}

/// Unwraps a value the compiler guarantees to be present.
///
/// Absence is reported as [`EvaluationError::Invariant`] rather than a panic so that
/// the failure surfaces through the normal error path.
pub fn check_present<T>(value: Option<T>, what: &str) -> EvaluationResult<T> {
    value.ok_or_else(|| EvaluationError::Invariant(format!("expected {} to be present", what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            EvaluationError::UnsupportedConstruct("x".into()).category(),
            ErrorCategory::UserInput
        );
        assert_eq!(
            EvaluationError::Terminology("down".into()).category(),
            ErrorCategory::Service
        );
        assert_eq!(
            EvaluationError::Invariant("eid".into()).category(),
            ErrorCategory::Internal
        );
        assert!(!EvaluationError::Terminology("down".into()).is_user_error());
    }

    #[test]
    fn test_check_present() {
        assert_eq!(check_present(Some(3), "value"), Ok(3));
        assert!(matches!(
            check_present::<u8>(None, "element id"),
            Err(EvaluationError::Invariant(msg)) if msg.contains("element id")
        ));
    }
}
