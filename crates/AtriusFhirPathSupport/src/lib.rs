//! # FHIRPath Support Types
//!
//! This crate holds the vocabulary shared between the FHIRPath compiler and the
//! components it collaborates with:
//!
//! - [`EvaluationError`] - The error taxonomy for compilation and execution
//! - [`Coding`] / [`CodeSystemReference`] - Coded values and their matching rules
//! - [`ElementDefinition`] / [`MaxCardinality`] - Element metadata from a catalog
//! - [`ElementCatalog`] - The seam through which path segments are resolved
//!
//! ## Usage Example
//!
//! ```rust
//! use atrius_fhirpath_support::{Coding, MaxCardinality};
//!
//! let observed = Coding::new("http://snomed.info/sct", "44054006");
//! let resolved = Coding::versioned("http://snomed.info/sct", "44054006", "20240101");
//! assert!(observed.matches(&resolved));
//!
//! assert!(MaxCardinality::parse("*").unwrap().is_repeating());
//! ```

pub mod coding;
pub mod evaluation_error;
pub mod traits;
pub mod type_info;

pub use coding::{CodeSystemReference, Coding};
pub use evaluation_error::{ErrorCategory, EvaluationError, EvaluationResult};
pub use traits::ElementCatalog;
pub use type_info::{ElementDefinition, MaxCardinality};
