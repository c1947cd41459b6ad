//! Error types for the FHIRPath query CLI and the terminology HTTP client
//!
//! Compilation and execution report [`EvaluationError`]. The outer layers that
//! deal with files, JSON documents and HTTP use [`FhirPathError`], which absorbs
//! evaluation errors through `From`.

use std::fmt;

use atrius_fhirpath_support::evaluation_error::EvaluationError;

/// Result type alias for FHIRPath I/O operations
pub type FhirPathResult<T> = Result<T, FhirPathError>;

/// Error types for FHIRPath I/O operations
#[derive(Debug)]
pub enum FhirPathError {
    /// Parse error with message
    ParseError(String),

    /// Compilation or execution error
    EvaluationError(String),

    /// IO error (file operations, etc.)
    IoError(std::io::Error),

    /// JSON serialization/deserialization error
    JsonError(serde_json::Error),

    /// Invalid input parameters or documents
    InvalidInput(String),

    /// Configuration error
    ConfigError(String),

    /// Non-success HTTP status from a remote server
    HttpError(u16, String),

    /// Network error (for terminology server operations)
    NetworkError(String),

    /// Terminology server error
    TerminologyError(String),
}

impl FhirPathError {
    /// True for failures that may succeed when the request is repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            FhirPathError::NetworkError(_) => true,
            FhirPathError::HttpError(status, _) => *status >= 500,
            _ => false,
        }
    }
}

impl fmt::Display for FhirPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FhirPathError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            FhirPathError::EvaluationError(msg) => write!(f, "Evaluation error: {}", msg),
            FhirPathError::IoError(err) => write!(f, "IO error: {}", err),
            FhirPathError::JsonError(err) => write!(f, "JSON error: {}", err),
            FhirPathError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            FhirPathError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            FhirPathError::HttpError(code, msg) => write!(f, "HTTP {} error: {}", code, msg),
            FhirPathError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            FhirPathError::TerminologyError(msg) => write!(f, "Terminology error: {}", msg),
        }
    }
}

impl std::error::Error for FhirPathError {}

impl From<std::io::Error> for FhirPathError {
    fn from(err: std::io::Error) -> Self {
        FhirPathError::IoError(err)
    }
}

impl From<serde_json::Error> for FhirPathError {
    fn from(err: serde_json::Error) -> Self {
        FhirPathError::JsonError(err)
    }
}

impl From<EvaluationError> for FhirPathError {
    fn from(err: EvaluationError) -> Self {
        match err {
            EvaluationError::Parse(msg) => FhirPathError::ParseError(msg),
            EvaluationError::Terminology(msg) => FhirPathError::TerminologyError(msg),
            other => FhirPathError::EvaluationError(other.to_string()),
        }
    }
}

impl From<FhirPathError> for EvaluationError {
    fn from(err: FhirPathError) -> Self {
        EvaluationError::Terminology(err.to_string())
    }
}
