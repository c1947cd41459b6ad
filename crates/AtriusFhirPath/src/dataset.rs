//! # Columnar Datasets
//!
//! A [`Dataset`] is an immutable handle to a [`LogicalPlan`]. Compiling a FHIRPath
//! expression never touches data: it only stacks plan nodes on top of the dataset
//! of its input. Execution happens later in [`crate::engine::LocalEngine`].
//!
//! Rows are JSON objects keyed by column name. A column that is missing from a row
//! reads as `null`, so "absent" and "null" are indistinguishable once data has been
//! loaded.
//!
//! ## Column expressions
//!
//! [`Column`] is a small expression language evaluated against one row:
//!
//! ```rust
//! use atrius_fhir_path::dataset::{col, lit, Column};
//! use serde_json::{json, Map};
//!
//! let row: Map<_, _> = json!({ "id": "p1", "active": true }).as_object().unwrap().clone();
//! let expr = Column::when(col("active").is_null(), lit(json!("unknown")), col("id"));
//! assert_eq!(expr.evaluate(&row), json!("p1"));
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::engine::PreviewStage;

/// One record: column name to value.
pub type Row = Map<String, Value>;

/// A horizontal slice of a dataset processed by one task.
pub type Partition = Vec<Row>;

/// Binary operators understood by [`Column::Binary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Equals,
    NotEquals,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    And,
    Or,
    Xor,
    Implies,
}

impl BinaryOp {
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            BinaryOp::And | BinaryOp::Or | BinaryOp::Xor | BinaryOp::Implies
        )
    }

    fn apply(&self, left: Value, right: Value) -> Value {
        match self {
            BinaryOp::And => kleene(truth(&left), truth(&right), |l, r| match (l, r) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            }),
            BinaryOp::Or => kleene(truth(&left), truth(&right), |l, r| match (l, r) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            }),
            BinaryOp::Xor => kleene(truth(&left), truth(&right), |l, r| match (l, r) {
                (Some(l), Some(r)) => Some(l != r),
                _ => None,
            }),
            BinaryOp::Implies => kleene(truth(&left), truth(&right), |l, r| match (l, r) {
                (Some(false), _) | (_, Some(true)) => Some(true),
                (Some(true), Some(false)) => Some(false),
                _ => None,
            }),
            comparison => {
                if left.is_null() || right.is_null() {
                    return Value::Null;
                }
                let ordering = compare_values(&left, &right);
                let outcome = match comparison {
                    BinaryOp::Equals => ordering.map(|o| o == Ordering::Equal).or(Some(left == right)),
                    BinaryOp::NotEquals => ordering.map(|o| o != Ordering::Equal).or(Some(left != right)),
                    BinaryOp::LessThan => ordering.map(|o| o == Ordering::Less),
                    BinaryOp::LessOrEqual => ordering.map(|o| o != Ordering::Greater),
                    BinaryOp::GreaterThan => ordering.map(|o| o == Ordering::Greater),
                    BinaryOp::GreaterOrEqual => ordering.map(|o| o != Ordering::Less),
                    _ => None,
                };
                outcome.map(Value::Bool).unwrap_or(Value::Null)
            }
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            BinaryOp::Equals => "=",
            BinaryOp::NotEquals => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterOrEqual => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Implies => "implies",
        };
        write!(f, "{}", token)
    }
}

fn truth(value: &Value) -> Option<bool> {
    value.as_bool()
}

fn kleene(
    left: Option<bool>,
    right: Option<bool>,
    table: impl Fn(Option<bool>, Option<bool>) -> Option<bool>,
) -> Value {
    table(left, right).map(Value::Bool).unwrap_or(Value::Null)
}

/// Orders two scalar values of the same kind. Returns `None` for values that
/// have no natural ordering between them (mixed kinds, objects, arrays, booleans).
fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            if let (Some(l), Some(r)) = (l.as_i64(), r.as_i64()) {
                Some(l.cmp(&r))
            } else {
                l.as_f64()?.partial_cmp(&r.as_f64()?)
            }
        }
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) if l == r => Some(Ordering::Equal),
        _ => None,
    }
}

/// A column expression evaluated against a single row.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// Reads a column by name. Missing columns read as null.
    Named(String),
    Literal(Value),
    /// Extracts a field from an object. Applied to an array, extracts the field
    /// from every element.
    GetField(Box<Column>, String),
    IsNull(Box<Column>),
    When {
        condition: Box<Column>,
        then: Box<Column>,
        otherwise: Box<Column>,
    },
    /// Wraps a non-null value into a one-element array. Null stays null.
    Array(Box<Column>),
    /// Appends a positional index to an element id.
    ///
    /// A null index yields null. A missing or null base yields `[index]`.
    AppendIndex {
        base: Option<Box<Column>>,
        index: Box<Column>,
    },
    Binary(BinaryOp, Box<Column>, Box<Column>),
    Not(Box<Column>),
}

/// Shorthand for [`Column::Named`].
pub fn col(name: impl Into<String>) -> Column {
    Column::Named(name.into())
}

/// Shorthand for [`Column::Literal`].
pub fn lit(value: Value) -> Column {
    Column::Literal(value)
}

impl Column {
    pub fn field(self, name: impl Into<String>) -> Column {
        Column::GetField(Box::new(self), name.into())
    }

    pub fn is_null(self) -> Column {
        Column::IsNull(Box::new(self))
    }

    pub fn when(condition: Column, then: Column, otherwise: Column) -> Column {
        Column::When {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    pub fn array(self) -> Column {
        Column::Array(Box::new(self))
    }

    pub fn append_index(base: Option<Column>, index: Column) -> Column {
        Column::AppendIndex {
            base: base.map(Box::new),
            index: Box::new(index),
        }
    }

    pub fn binary(self, op: BinaryOp, right: Column) -> Column {
        Column::Binary(op, Box::new(self), Box::new(right))
    }

    pub fn negate(self) -> Column {
        Column::Not(Box::new(self))
    }

    /// Evaluates the expression against `row`.
    pub fn evaluate(&self, row: &Row) -> Value {
        match self {
            Column::Named(name) => row.get(name).cloned().unwrap_or(Value::Null),
            Column::Literal(value) => value.clone(),
            Column::GetField(parent, name) => get_field(parent.evaluate(row), name),
            Column::IsNull(inner) => Value::Bool(inner.evaluate(row).is_null()),
            Column::When {
                condition,
                then,
                otherwise,
            } => {
                if condition.evaluate(row) == Value::Bool(true) {
                    then.evaluate(row)
                } else {
                    otherwise.evaluate(row)
                }
            }
            Column::Array(inner) => match inner.evaluate(row) {
                Value::Null => Value::Null,
                value => Value::Array(vec![value]),
            },
            Column::AppendIndex { base, index } => {
                let index = index.evaluate(row);
                if index.is_null() {
                    return Value::Null;
                }
                let base = base.as_ref().map(|b| b.evaluate(row));
                match base {
                    Some(Value::Array(mut path)) => {
                        path.push(index);
                        Value::Array(path)
                    }
                    _ => Value::Array(vec![index]),
                }
            }
            Column::Binary(op, left, right) => op.apply(left.evaluate(row), right.evaluate(row)),
            Column::Not(inner) => match inner.evaluate(row) {
                Value::Bool(b) => Value::Bool(!b),
                _ => Value::Null,
            },
        }
    }
}

fn get_field(parent: Value, name: &str) -> Value {
    match parent {
        Value::Object(mut object) => object.remove(name).unwrap_or(Value::Null),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| get_field(item, name))
                .collect(),
        ),
        _ => Value::Null,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

/// A node of the logical plan. Every node except `Scan` reads from its inputs.
#[derive(Debug)]
pub enum LogicalPlan {
    Scan {
        partitions: Arc<Vec<Partition>>,
    },
    WithColumn {
        input: Dataset,
        alias: String,
        column: Column,
    },
    Select {
        input: Dataset,
        columns: Vec<(String, Column)>,
    },
    Filter {
        input: Dataset,
        predicate: Column,
    },
    /// Outer explode with position: every input row produces at least one output row.
    ExplodeOuter {
        input: Dataset,
        column: Column,
        index_alias: String,
        value_alias: String,
    },
    /// Equi-join on `left_on = right_on`. The right side is broadcast.
    Join {
        left: Dataset,
        right: Dataset,
        left_on: String,
        right_on: String,
        join_type: JoinType,
    },
    /// Counts the non-null values of `count_of` per distinct `group_by` value.
    Aggregate {
        input: Dataset,
        group_by: String,
        count_alias: String,
        count_of: Column,
    },
    /// Runs a full-dataset preview before mapping each row through `stage`.
    MapWithPreview {
        input: Dataset,
        column: Column,
        alias: String,
        stage: Arc<dyn PreviewStage>,
    },
}

/// An immutable, cheaply clonable handle to a logical plan.
#[derive(Debug, Clone)]
pub struct Dataset {
    plan: Arc<LogicalPlan>,
}

impl Dataset {
    fn from_plan(plan: LogicalPlan) -> Self {
        Self {
            plan: Arc::new(plan),
        }
    }

    /// Wraps already partitioned rows.
    pub fn from_partitions(partitions: Vec<Partition>) -> Self {
        Self::from_plan(LogicalPlan::Scan {
            partitions: Arc::new(partitions),
        })
    }

    pub fn plan(&self) -> &LogicalPlan {
        &self.plan
    }

    pub fn with_column(&self, alias: impl Into<String>, column: Column) -> Dataset {
        Self::from_plan(LogicalPlan::WithColumn {
            input: self.clone(),
            alias: alias.into(),
            column,
        })
    }

    pub fn select(&self, columns: Vec<(String, Column)>) -> Dataset {
        Self::from_plan(LogicalPlan::Select {
            input: self.clone(),
            columns,
        })
    }

    pub fn filter(&self, predicate: Column) -> Dataset {
        Self::from_plan(LogicalPlan::Filter {
            input: self.clone(),
            predicate,
        })
    }

    pub fn explode_outer(
        &self,
        column: Column,
        index_alias: impl Into<String>,
        value_alias: impl Into<String>,
    ) -> Dataset {
        Self::from_plan(LogicalPlan::ExplodeOuter {
            input: self.clone(),
            column,
            index_alias: index_alias.into(),
            value_alias: value_alias.into(),
        })
    }

    pub fn join(
        &self,
        right: &Dataset,
        left_on: impl Into<String>,
        right_on: impl Into<String>,
        join_type: JoinType,
    ) -> Dataset {
        Self::from_plan(LogicalPlan::Join {
            left: self.clone(),
            right: right.clone(),
            left_on: left_on.into(),
            right_on: right_on.into(),
            join_type,
        })
    }

    pub fn aggregate_count(
        &self,
        group_by: impl Into<String>,
        count_alias: impl Into<String>,
        count_of: Column,
    ) -> Dataset {
        Self::from_plan(LogicalPlan::Aggregate {
            input: self.clone(),
            group_by: group_by.into(),
            count_alias: count_alias.into(),
            count_of,
        })
    }

    pub fn map_with_preview(
        &self,
        column: Column,
        alias: impl Into<String>,
        stage: Arc<dyn PreviewStage>,
    ) -> Dataset {
        Self::from_plan(LogicalPlan::MapWithPreview {
            input: self.clone(),
            column,
            alias: alias.into(),
            stage,
        })
    }

    /// True when both handles point at the same plan node.
    pub fn same_plan(&self, other: &Dataset) -> bool {
        Arc::ptr_eq(&self.plan, &other.plan)
    }
}
