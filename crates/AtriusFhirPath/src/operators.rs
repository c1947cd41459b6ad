//! Binary operators, keyed by their FHIRPath token.
//!
//! Both operands must be singular. Two dataset-backed operands are aligned on
//! their record id with a left join; literal operands are inlined into the
//! column expression, and two literals are folded at compile time.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::context::ParserContext;
use crate::dataset::{BinaryOp, Column, JoinType, Row, col, lit};
use crate::fhir_path::{ElementPath, FhirPath, LiteralPath};
use atrius_fhirpath_support::evaluation_error::{EvaluationError, EvaluationResult};

/// Implementation of one binary operator.
pub type OperatorFn = fn(&ParserContext, FhirPath, FhirPath) -> EvaluationResult<FhirPath>;

static OPERATORS: Lazy<HashMap<&'static str, OperatorFn>> = Lazy::new(|| {
    let mut operators: HashMap<&'static str, OperatorFn> = HashMap::new();
    operators.insert("=", |c, l, r| apply(BinaryOp::Equals, c, l, r));
    operators.insert("!=", |c, l, r| apply(BinaryOp::NotEquals, c, l, r));
    operators.insert("<", |c, l, r| apply(BinaryOp::LessThan, c, l, r));
    operators.insert("<=", |c, l, r| apply(BinaryOp::LessOrEqual, c, l, r));
    operators.insert(">", |c, l, r| apply(BinaryOp::GreaterThan, c, l, r));
    operators.insert(">=", |c, l, r| apply(BinaryOp::GreaterOrEqual, c, l, r));
    operators.insert("and", |c, l, r| apply(BinaryOp::And, c, l, r));
    operators.insert("or", |c, l, r| apply(BinaryOp::Or, c, l, r));
    operators.insert("xor", |c, l, r| apply(BinaryOp::Xor, c, l, r));
    operators.insert("implies", |c, l, r| apply(BinaryOp::Implies, c, l, r));
    operators
});

/// Returns the operator registered for `token`.
pub fn lookup(token: &str) -> Option<OperatorFn> {
    OPERATORS.get(token).copied()
}

fn check_operand(op: BinaryOp, side: &str, operand: &FhirPath) -> EvaluationResult<()> {
    if operand.is_resource() {
        return Err(EvaluationError::InvalidOperation(format!(
            "{} operand to {} operator cannot be a resource: {}",
            side,
            op,
            operand.expression()
        )));
    }
    if !operand.is_singular() {
        return Err(EvaluationError::InvalidOperation(format!(
            "{} operand to {} operator must be singular: {}",
            side,
            op,
            operand.expression()
        )));
    }
    if op.is_logical() {
        if let Some(fhir_type) = operand.fhir_type() {
            if fhir_type != "boolean" {
                return Err(EvaluationError::InvalidOperation(format!(
                    "{} operand to {} operator must be Boolean: {}",
                    side,
                    op,
                    operand.expression()
                )));
            }
        }
    }
    Ok(())
}

fn apply(op: BinaryOp, context: &ParserContext, left: FhirPath, right: FhirPath) -> EvaluationResult<FhirPath> {
    check_operand(op, "Left", &left)?;
    check_operand(op, "Right", &right)?;
    let expression = format!("{} {} {}", left.expression(), op, right.expression());

    match (&left, &right) {
        (FhirPath::Literal(l), FhirPath::Literal(r)) => {
            let value = lit(l.value.clone())
                .binary(op, lit(r.value.clone()))
                .evaluate(&Row::new());
            Ok(FhirPath::Literal(LiteralPath::boolean(expression, value)))
        }
        (FhirPath::Element(element), FhirPath::Literal(literal)) => Ok(boolean_element(
            expression,
            element,
            element.value_column.clone().binary(op, lit(literal.value.clone())),
        )),
        (FhirPath::Literal(literal), FhirPath::Element(element)) => Ok(boolean_element(
            expression,
            element,
            lit(literal.value.clone()).binary(op, element.value_column.clone()),
        )),
        (FhirPath::Element(l), FhirPath::Element(r)) => {
            if l.dataset.same_plan(&r.dataset) {
                let value = l.value_column.clone().binary(op, r.value_column.clone());
                return Ok(boolean_element(expression, l, value));
            }
            let right_id = context.fresh_alias("id");
            let right_value = context.fresh_alias("value");
            let right_dataset = r.dataset.select(vec![
                (right_id.clone(), col(r.id_column.clone())),
                (right_value.clone(), r.value_column.clone()),
            ]);
            let joined = l.dataset.join(&right_dataset, l.id_column.clone(), right_id, JoinType::Left);
            Ok(FhirPath::Element(ElementPath {
                expression,
                dataset: joined,
                id_column: l.id_column.clone(),
                eid_column: None,
                value_column: l.value_column.clone().binary(op, col(right_value)),
                singular: true,
                definition: None,
                fhir_type: Some("boolean".to_string()),
            }))
        }
        // Resource operands are rejected by `check_operand`.
        _ => Err(EvaluationError::Invariant(format!(
            "unexpected operands to {} operator",
            op
        ))),
    }
}

fn boolean_element(expression: String, input: &ElementPath, value: Column) -> FhirPath {
    FhirPath::Element(ElementPath {
        expression,
        dataset: input.dataset.clone(),
        id_column: input.id_column.clone(),
        eid_column: None,
        value_column: value,
        singular: true,
        definition: None,
        fhir_type: Some("boolean".to_string()),
    })
}
