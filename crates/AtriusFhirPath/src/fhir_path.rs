//! # Compiled FHIRPath Expressions
//!
//! Evaluating a parsed [`Expression`](crate::parser::Expression) does not produce
//! values. It produces a [`FhirPath`]: a description of where the values of that
//! expression live in a columnar [`Dataset`].
//!
//! | Variant              | Dataset | Value                               | Singular |
//! |----------------------|---------|-------------------------------------|----------|
//! | [`ResourcePath`]     | yes     | the resource row, gated by presence | yes      |
//! | [`ElementPath`]      | yes     | a column expression                 | varies   |
//! | [`LiteralPath`]      | no      | a constant                          | yes      |
//!
//! Every dataset-backed path carries the name of its record-id column. Element
//! paths produced by exploding a repeating field also carry an *element id*: an
//! array of positional indices locating each row within its record. Once an
//! element path is non-singular it stays non-singular until an aggregation
//! function collapses it back to one row per record.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Number, Value, json};

use crate::dataset::{Column, Dataset, col, lit};
use crate::parser::Literal;
use atrius_fhirpath_support::evaluation_error::{EvaluationError, EvaluationResult};
use atrius_fhirpath_support::type_info::ElementDefinition;

/// Whether a resource row is present.
///
/// Root resources are always present. A resource reached through a join may be
/// absent for some records; its fields must then read as null even if the row
/// carries stale values.
#[derive(Debug, Clone, PartialEq)]
pub enum Presence {
    Always,
    /// Present exactly where the indicator column is non-null.
    Indicated(Column),
}

impl Presence {
    /// Forces `value` to null wherever the resource is absent.
    pub fn guard(&self, value: Column) -> Column {
        match self {
            Presence::Always => value,
            Presence::Indicated(indicator) => {
                Column::when(indicator.clone().is_null(), lit(Value::Null), value)
            }
        }
    }
}

/// A resource type rooted in a dataset of one row per resource.
#[derive(Debug, Clone)]
pub struct ResourcePath {
    pub expression: String,
    pub dataset: Dataset,
    pub id_column: String,
    pub presence: Presence,
    pub resource_type: String,
}

impl ResourcePath {
    /// The root input context for `resource_type`. Its expression is the type name.
    pub fn build(dataset: Dataset, resource_type: &str, id_column: &str) -> Self {
        Self {
            expression: resource_type.to_string(),
            dataset,
            id_column: id_column.to_string(),
            presence: Presence::Always,
            resource_type: resource_type.to_string(),
        }
    }

    pub fn with_presence(mut self, presence: Presence) -> Self {
        self.presence = presence;
        self
    }
}

/// An element (or derived value) located by a column expression.
#[derive(Debug, Clone)]
pub struct ElementPath {
    pub expression: String,
    pub dataset: Dataset,
    pub id_column: String,
    /// Positional path of each row within its record, when rows were exploded.
    pub eid_column: Option<Column>,
    pub value_column: Column,
    pub singular: bool,
    /// Catalog definition of the element, absent for computed values.
    pub definition: Option<ElementDefinition>,
    pub fhir_type: Option<String>,
}

impl ElementPath {
    /// Child lookups are keyed by the definition's type path.
    pub fn type_path(&self) -> Option<&str> {
        self.definition
            .as_ref()
            .map(|d| d.type_path.as_str())
            .or(self.fhir_type.as_deref())
    }
}

/// A constant.
#[derive(Debug, Clone, PartialEq)]
pub struct LiteralPath {
    pub expression: String,
    pub value: Value,
    pub fhir_type: Option<String>,
}

impl LiteralPath {
    /// Fails for decimals that have no JSON number representation.
    pub fn from_literal(literal: &Literal) -> EvaluationResult<Self> {
        let (value, fhir_type) = match literal {
            Literal::Null => (Value::Null, None),
            Literal::Boolean(b) => (Value::Bool(*b), Some("boolean")),
            Literal::String(s) => (Value::String(s.clone()), Some("string")),
            Literal::Integer(n) => (Value::from(*n), Some("integer")),
            Literal::Number(d) => (decimal_to_json(d)?, Some("decimal")),
            Literal::Date(d) => (Value::String(d.clone()), Some("date")),
            Literal::DateTime(dt) => (Value::String(dt.clone()), Some("dateTime")),
            Literal::Time(t) => (Value::String(t.clone()), Some("time")),
            Literal::Quantity(d, unit) => (
                json!({ "value": decimal_to_json(d)?, "unit": unit }),
                Some("Quantity"),
            ),
        };
        Ok(Self {
            expression: literal.to_string(),
            value,
            fhir_type: fhir_type.map(str::to_string),
        })
    }

    pub fn boolean(expression: String, value: Value) -> Self {
        Self {
            expression,
            value,
            fhir_type: Some("boolean".to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

/// Decimals become JSON numbers so they compare numerically with data values.
fn decimal_to_json(decimal: &Decimal) -> EvaluationResult<Value> {
    decimal
        .to_f64()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| {
            EvaluationError::UnsupportedConstruct(format!(
                "Decimal literal cannot be represented as a number: {}",
                decimal
            ))
        })
}

/// The result of evaluating an expression.
#[derive(Debug, Clone)]
pub enum FhirPath {
    Resource(ResourcePath),
    Element(ElementPath),
    Literal(LiteralPath),
}

impl FhirPath {
    pub fn expression(&self) -> &str {
        match self {
            FhirPath::Resource(r) => &r.expression,
            FhirPath::Element(e) => &e.expression,
            FhirPath::Literal(l) => &l.expression,
        }
    }

    pub fn is_singular(&self) -> bool {
        match self {
            FhirPath::Element(e) => e.singular,
            FhirPath::Resource(_) | FhirPath::Literal(_) => true,
        }
    }

    pub fn dataset(&self) -> Option<&Dataset> {
        match self {
            FhirPath::Resource(r) => Some(&r.dataset),
            FhirPath::Element(e) => Some(&e.dataset),
            FhirPath::Literal(_) => None,
        }
    }

    pub fn id_column(&self) -> Option<&str> {
        match self {
            FhirPath::Resource(r) => Some(&r.id_column),
            FhirPath::Element(e) => Some(&e.id_column),
            FhirPath::Literal(_) => None,
        }
    }

    /// The column holding this path's values. A resource's value is its id,
    /// gated by presence.
    pub fn value_column(&self) -> Column {
        match self {
            FhirPath::Resource(r) => r.presence.guard(col(r.id_column.clone())),
            FhirPath::Element(e) => e.value_column.clone(),
            FhirPath::Literal(l) => lit(l.value.clone()),
        }
    }

    pub fn eid_column(&self) -> Option<&Column> {
        match self {
            FhirPath::Element(e) => e.eid_column.as_ref(),
            FhirPath::Resource(_) | FhirPath::Literal(_) => None,
        }
    }

    pub fn fhir_type(&self) -> Option<&str> {
        match self {
            FhirPath::Resource(r) => Some(&r.resource_type),
            FhirPath::Element(e) => e.fhir_type.as_deref(),
            FhirPath::Literal(l) => l.fhir_type.as_deref(),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, FhirPath::Literal(_))
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, FhirPath::Resource(_))
    }

    pub fn as_element(&self) -> Option<&ElementPath> {
        match self {
            FhirPath::Element(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&LiteralPath> {
        match self {
            FhirPath::Literal(l) => Some(l),
            _ => None,
        }
    }

    /// Projects this path to `id`, `eid` and `value` columns.
    ///
    /// Literals have no dataset of their own and are evaluated once per record
    /// of `input_context`.
    pub fn result_dataset(&self, input_context: &ResourcePath) -> Dataset {
        let (dataset, id_column) = match self {
            FhirPath::Resource(r) => (&r.dataset, r.id_column.as_str()),
            FhirPath::Element(e) => (&e.dataset, e.id_column.as_str()),
            FhirPath::Literal(_) => (&input_context.dataset, input_context.id_column.as_str()),
        };
        dataset.select(vec![
            ("id".to_string(), col(id_column)),
            (
                "eid".to_string(),
                self.eid_column().cloned().unwrap_or(lit(Value::Null)),
            ),
            ("value".to_string(), self.value_column()),
        ])
    }
}

impl From<ResourcePath> for FhirPath {
    fn from(path: ResourcePath) -> Self {
        FhirPath::Resource(path)
    }
}

impl From<ElementPath> for FhirPath {
    fn from(path: ElementPath) -> Self {
        FhirPath::Element(path)
    }
}

impl From<LiteralPath> for FhirPath {
    fn from(path: LiteralPath) -> Self {
        FhirPath::Literal(path)
    }
}
