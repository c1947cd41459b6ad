//! # Path Traversal
//!
//! Navigates one path segment from a compiled [`FhirPath`].
//!
//! Singular children pass their parent's rows through untouched and only change
//! the value column. Repeating children are exploded with *outer* semantics: each
//! input row yields one row per element, or a single null row when the field is
//! absent or empty, so record counts never shrink. Every exploded row receives an
//! element id, the parent's element id with the element's position appended.
//!
//! ```text
//! Patient            one row per record          singular, no eid
//! Patient.name       one row per name            eid [n]
//! Patient.name.given one row per given per name  eid [n, g]
//! ```

use tracing::trace;

use crate::context::ParserContext;
use crate::dataset::{Column, col};
use crate::fhir_path::{ElementPath, FhirPath};
use atrius_fhirpath_support::evaluation_error::{EvaluationError, EvaluationResult};

/// Resolves `child` against `left` and returns the child path.
pub fn traverse(left: &FhirPath, child: &str, context: &ParserContext) -> EvaluationResult<FhirPath> {
    let (parent_type, dataset, id_column, left_eid, left_value) = match left {
        FhirPath::Literal(literal) => {
            return Err(EvaluationError::InvalidOperation(format!(
                "Path traversal operator cannot be invoked on a literal value: {}",
                literal.expression
            )));
        }
        FhirPath::Resource(resource) => (
            Some(resource.resource_type.as_str()),
            resource.dataset.clone(),
            resource.id_column.clone(),
            None,
            resource.presence.guard(col(child)),
        ),
        FhirPath::Element(element) => (
            element.type_path(),
            element.dataset.clone(),
            element.id_column.clone(),
            element.eid_column.clone(),
            element.value_column.clone().field(child),
        ),
    };

    let expression = if left.expression() == context.input_context().expression() {
        child.to_string()
    } else {
        format!("{}.{}", left.expression(), child)
    };

    let definition = parent_type
        .and_then(|parent| context.catalog().lookup(parent, child))
        .ok_or_else(|| EvaluationError::UnknownElement(format!("No such child: {}", expression)))?;

    trace!(
        "Traversing {} ({}, max {})",
        expression, definition.fhir_type, definition.max_cardinality
    );

    let fhir_type = Some(definition.fhir_type.clone());
    if definition.is_repeating() {
        let index_alias = context.fresh_alias("index");
        let value_alias = context.fresh_alias("value");
        let eid_alias = context.fresh_alias("eid");
        let exploded = dataset
            .explode_outer(left_value, index_alias.clone(), value_alias.clone())
            .with_column(
                eid_alias.clone(),
                Column::append_index(left_eid, col(index_alias)),
            );
        return Ok(FhirPath::Element(ElementPath {
            expression,
            dataset: exploded,
            id_column,
            eid_column: Some(col(eid_alias)),
            value_column: col(value_alias),
            singular: false,
            definition: Some(definition),
            fhir_type,
        }));
    }

    let singular = left.is_singular();
    Ok(FhirPath::Element(ElementPath {
        expression,
        dataset,
        id_column,
        // A singular parent with a singular child has nothing to disambiguate.
        eid_column: if singular { None } else { left_eid },
        value_column: left_value,
        singular,
        definition: Some(definition),
        fhir_type,
    }))
}
