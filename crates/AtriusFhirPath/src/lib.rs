//! # FHIRPath Query Compiler
//!
//! This crate compiles [FHIRPath](https://hl7.org/fhirpath/) expressions into
//! plans over a partitioned, columnar dataset of FHIR resources, instead of
//! evaluating them one resource at a time.
//!
//! ## Overview
//!
//! - **Parser** (`parser.rs`): FHIRPath text to an expression tree
//! - **Dispatcher** (`evaluator.rs`): expression tree to a [`FhirPath`], a dataset
//!   plus the column that holds the expression's values
//! - **Path traversal** (`path_traversal.rs`): one path segment at a time, exploding
//!   repeating elements into rows and tracking each row's element id
//! - **Operators and functions** (`operators.rs`, `functions.rs`): comparisons,
//!   boolean logic and the `count`/`exists`/`empty` aggregations
//! - **`memberOf`** (`member_of.rs`): value set membership backed by a terminology
//!   server, resolved with one discovery pass and one expansion per query
//! - **Engine** (`dataset.rs`, `engine.rs`): logical plans and an in-memory
//!   executor that runs every partition on rayon
//!
//! ## Cardinality
//!
//! A compiled path is *singular* when it yields at most one value per record.
//! Traversing a repeating element makes it non-singular, and it stays that way
//! until an aggregation collapses it back to one row per record. Every row of a
//! non-singular path carries an element id, the positional path from the record
//! root, so values derived from the same elements can be matched up again.
//!
//! ## Usage Example
//!
//! ```rust
//! use std::sync::Arc;
//! use atrius_fhir_path::{LocalEngine, ParserContext, ResourceReader, StructureDefinitionCatalog, compile_expression};
//! use atrius_fhirpath_support::type_info::MaxCardinality;
//! use serde_json::json;
//!
//! let catalog = StructureDefinitionCatalog::new()
//!     .with_element("Patient", "name", MaxCardinality::Unbounded, "HumanName")
//!     .with_element("HumanName", "family", MaxCardinality::Bounded(1), "string");
//!
//! let patients = ResourceReader::new(2).read_resource_path(
//!     vec![
//!         json!({ "resourceType": "Patient", "id": "p1", "name": [{ "family": "Doe" }, { "family": "Roe" }] }),
//!         json!({ "resourceType": "Patient", "id": "p2" }),
//!     ],
//!     "Patient",
//! )?;
//! let context = ParserContext::new(patients.clone(), Arc::new(catalog));
//!
//! let families = compile_expression("name.family", &context)?;
//! assert!(!families.is_singular());
//! let rows = LocalEngine::new().collect(&families.result_dataset(&patients))?;
//! assert_eq!(rows.len(), 3);
//!
//! let counted = compile_expression("name.count()", &context)?;
//! assert!(counted.is_singular());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod catalog;
pub mod cli;
pub mod context;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod fhir_path;
pub mod functions;
pub mod member_of;
pub mod operators;
pub mod parser;
pub mod path_traversal;
pub mod resource_reader;
pub mod terminology_client;

pub use catalog::StructureDefinitionCatalog;
pub use context::ParserContext;
pub use dataset::Dataset;
pub use engine::LocalEngine;
pub use error::{FhirPathError, FhirPathResult};
pub use evaluator::compile_expression;
pub use fhir_path::{ElementPath, FhirPath, LiteralPath, Presence, ResourcePath};
pub use member_of::{MembershipSet, derive_membership_set, is_member};
pub use resource_reader::ResourceReader;
pub use terminology_client::{CompositeValueSet, TerminologyClient, TerminologyService};
pub use atrius_fhirpath_support::evaluation_error::{EvaluationError, EvaluationResult};
