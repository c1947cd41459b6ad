//! # Expression Dispatcher
//!
//! Compiles a parsed [`Expression`] into a [`FhirPath`] by structural recursion.
//!
//! - Terms resolve against the input context of the [`ParserContext`].
//! - Member invocations are delegated to [`traverse`].
//! - Binary nodes evaluate both operands, left first, and then dispatch on the
//!   operator token through the [operator registry](crate::operators).
//! - Function invocations dispatch through the [function registry](crate::functions).
//!
//! The grammar accepted by the parser is wider than what compiles to a plan.
//! Constructs outside the supported subset are rejected with
//! [`EvaluationError::UnsupportedConstruct`] as soon as they are reached.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use atrius_fhir_path::catalog::StructureDefinitionCatalog;
//! use atrius_fhir_path::context::ParserContext;
//! use atrius_fhir_path::evaluator::compile_expression;
//! use atrius_fhir_path::resource_reader::ResourceReader;
//! use atrius_fhirpath_support::type_info::MaxCardinality;
//! use serde_json::json;
//!
//! let catalog = StructureDefinitionCatalog::new()
//!     .with_element("Patient", "name", MaxCardinality::Unbounded, "HumanName")
//!     .with_element("HumanName", "given", MaxCardinality::Unbounded, "string");
//! let patients = ResourceReader::new(2)
//!     .read_resource_path(vec![json!({"resourceType": "Patient", "id": "p1"})], "Patient")
//!     .unwrap();
//! let context = ParserContext::new(patients, Arc::new(catalog));
//!
//! let given = compile_expression("Patient.name.given", &context).unwrap();
//! assert_eq!(given.expression(), "name.given");
//! assert!(!given.is_singular());
//! ```

use tracing::trace;

use crate::context::ParserContext;
use crate::fhir_path::{FhirPath, LiteralPath};
use crate::functions::{self, FunctionFn};
use crate::operators;
use crate::parser::{Expression, Invocation, Term, parse_expression};
use crate::path_traversal::traverse;
use atrius_fhirpath_support::evaluation_error::{EvaluationError, EvaluationResult};

/// Parses `text` and compiles it against `context`.
pub fn compile_expression(text: &str, context: &ParserContext) -> EvaluationResult<FhirPath> {
    let expression = parse_expression(text)?;
    trace!(request_id = context.request_id(), "Compiling {}", expression);
    evaluate(&expression, context)
}

/// Compiles an expression tree.
pub fn evaluate(expression: &Expression, context: &ParserContext) -> EvaluationResult<FhirPath> {
    if let Some((left, token, right)) = expression.as_binary() {
        let left = evaluate(left, context)?;
        let right = evaluate(right, context)?;
        let operator = operators::lookup(token)
            .ok_or_else(|| EvaluationError::UnsupportedOperator(token.to_string()))?;
        return operator(context, left, right);
    }

    match expression {
        Expression::Term(term) => evaluate_term(term, context),
        Expression::Invocation(left, invocation) => {
            let input = evaluate(left, context)?;
            evaluate_invocation(&input, invocation, context)
        }
        _ => Err(unsupported(expression)),
    }
}

fn evaluate_term(term: &Term, context: &ParserContext) -> EvaluationResult<FhirPath> {
    match term {
        Term::Literal(literal) => Ok(FhirPath::Literal(LiteralPath::from_literal(literal)?)),
        Term::Parenthesized(inner) => evaluate(inner, context),
        Term::ExternalConstant(name) => match name.as_str() {
            "resource" | "context" => Ok(context.input_context().clone()),
            _ => Err(EvaluationError::UnsupportedConstruct(format!(
                "Unsupported environment variable: %{}",
                name
            ))),
        },
        Term::Invocation(Invocation::Member(name)) if is_input_type(name, context) => {
            Ok(context.input_context().clone())
        }
        Term::Invocation(invocation) => {
            evaluate_invocation(context.input_context(), invocation, context)
        }
    }
}

fn evaluate_invocation(
    input: &FhirPath,
    invocation: &Invocation,
    context: &ParserContext,
) -> EvaluationResult<FhirPath> {
    match invocation {
        Invocation::Member(name) => traverse(input, name, context),
        Invocation::This => Ok(input.clone()),
        Invocation::Index | Invocation::Total => Err(EvaluationError::UnsupportedConstruct(
            format!("Unsupported variable: {}", invocation),
        )),
        Invocation::Function(name, arguments) => {
            let function = lookup_function(name)?;
            let arguments = evaluate_arguments(arguments, context)?;
            function(context, input.clone(), arguments)
        }
    }
}

fn evaluate_arguments(arguments: &[Expression], context: &ParserContext) -> EvaluationResult<Vec<FhirPath>> {
    arguments.iter().map(|argument| evaluate(argument, context)).collect()
}

fn lookup_function(name: &str) -> EvaluationResult<FunctionFn> {
    functions::lookup(name).ok_or_else(|| EvaluationError::UnknownFunction(name.to_string()))
}

fn is_input_type(name: &str, context: &ParserContext) -> bool {
    matches!(context.input_context(), FhirPath::Resource(resource) if resource.resource_type == name)
}

fn unsupported(expression: &Expression) -> EvaluationError {
    EvaluationError::UnsupportedConstruct(format!("Unsupported expression: {}", expression))
}
