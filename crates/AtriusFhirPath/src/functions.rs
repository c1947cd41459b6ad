//! Function registry.
//!
//! Functions receive the compiled input path and their compiled arguments.
//! Aggregations (`count`, `exists`, `empty`) collapse a path to one row per
//! record, which makes their results singular again.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::context::ParserContext;
use crate::dataset::{BinaryOp, Column, col, lit};
use crate::fhir_path::{ElementPath, FhirPath, LiteralPath};
use crate::member_of::member_of;
use atrius_fhirpath_support::evaluation_error::{EvaluationError, EvaluationResult};

/// Implementation of one function.
pub type FunctionFn = fn(&ParserContext, FhirPath, Vec<FhirPath>) -> EvaluationResult<FhirPath>;

static FUNCTIONS: Lazy<HashMap<&'static str, FunctionFn>> = Lazy::new(|| {
    let mut functions: HashMap<&'static str, FunctionFn> = HashMap::new();
    functions.insert("memberOf", member_of);
    functions.insert("count", |c, i, a| aggregate(Aggregation::Count, c, i, a));
    functions.insert("exists", |c, i, a| aggregate(Aggregation::Exists, c, i, a));
    functions.insert("empty", |c, i, a| aggregate(Aggregation::Empty, c, i, a));
    functions
});

/// Returns the function registered under `name`.
pub fn lookup(name: &str) -> Option<FunctionFn> {
    FUNCTIONS.get(name).copied()
}

#[derive(Debug, Clone, Copy)]
enum Aggregation {
    Count,
    Exists,
    Empty,
}

impl Aggregation {
    fn name(self) -> &'static str {
        match self {
            Aggregation::Count => "count",
            Aggregation::Exists => "exists",
            Aggregation::Empty => "empty",
        }
    }

    fn fhir_type(self) -> &'static str {
        match self {
            Aggregation::Count => "integer",
            Aggregation::Exists | Aggregation::Empty => "boolean",
        }
    }

    /// Derives the result from the number of non-null values.
    fn from_count(self, count: Column) -> Column {
        match self {
            Aggregation::Count => count,
            Aggregation::Exists => count.binary(BinaryOp::GreaterThan, lit(Value::from(0))),
            Aggregation::Empty => count.binary(BinaryOp::Equals, lit(Value::from(0))),
        }
    }

    fn fold(self, literal: &LiteralPath) -> Value {
        let count = u64::from(!literal.value.is_null());
        match self {
            Aggregation::Count => Value::from(count),
            Aggregation::Exists => Value::Bool(count > 0),
            Aggregation::Empty => Value::Bool(count == 0),
        }
    }
}

fn aggregate(
    aggregation: Aggregation,
    context: &ParserContext,
    input: FhirPath,
    arguments: Vec<FhirPath>,
) -> EvaluationResult<FhirPath> {
    if !arguments.is_empty() {
        return Err(EvaluationError::InvalidArgument(format!(
            "Arguments can not be passed to {} function",
            aggregation.name()
        )));
    }
    let expression = format!("{}.{}()", input.expression(), aggregation.name());

    let (dataset, id_column) = match &input {
        FhirPath::Literal(literal) => {
            return Ok(FhirPath::Literal(LiteralPath {
                expression,
                value: aggregation.fold(literal),
                fhir_type: Some(aggregation.fhir_type().to_string()),
            }));
        }
        FhirPath::Resource(resource) => (&resource.dataset, resource.id_column.as_str()),
        FhirPath::Element(element) => (&element.dataset, element.id_column.as_str()),
    };

    let count_alias = context.fresh_alias(aggregation.name());
    let counted = dataset.aggregate_count(id_column, count_alias.clone(), input.value_column());
    Ok(FhirPath::Element(ElementPath {
        expression,
        dataset: counted,
        id_column: id_column.to_string(),
        eid_column: None,
        value_column: aggregation.from_count(col(count_alias)),
        singular: true,
        definition: None,
        fhir_type: Some(aggregation.fhir_type().to_string()),
    }))
}
