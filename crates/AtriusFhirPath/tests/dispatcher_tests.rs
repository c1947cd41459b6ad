mod common;

use atrius_fhir_path::evaluator::compile_expression;
use atrius_fhir_path::fhir_path::FhirPath;
use atrius_fhirpath_support::evaluation_error::EvaluationError;
use common::*;
use serde_json::{Value, json};

fn patients() -> Vec<Value> {
    vec![
        json!({
            "resourceType": "Patient",
            "id": "p1",
            "gender": "female",
            "active": true,
            "birthDate": "1980-02-01",
            "name": [
                { "family": "Doe", "given": ["Jane", "J"] },
                { "family": "Roe", "given": ["Janet"] }
            ]
        }),
        json!({ "resourceType": "Patient", "id": "p2", "gender": "male", "active": false }),
        json!({ "resourceType": "Patient", "id": "p3", "name": [{ "family": "Poe" }] }),
    ]
}

fn values(path: &FhirPath, input: &atrius_fhir_path::fhir_path::ResourcePath) -> Vec<(String, Value)> {
    rows(path, input).into_iter().map(|r| (r.id, r.value)).collect()
}

#[test]
fn test_root_references_resolve_to_the_input_context() {
    let input = resources(patients(), "Patient", 2);
    let context = context(&input);
    for expression in ["Patient", "%resource", "%context", "$this", "(Patient)"] {
        let path = compile_expression(expression, &context).unwrap();
        assert!(path.is_resource(), "{}", expression);
        assert_eq!(path.expression(), "Patient", "{}", expression);
    }
    let gender = compile_expression("%resource.gender", &context).unwrap();
    assert_eq!(gender.expression(), "gender");
}

#[test]
fn test_this_after_a_path_is_that_path() {
    let input = resources(patients(), "Patient", 2);
    let context = context(&input);
    let path = compile_expression("name.$this", &context).unwrap();
    assert!(!path.is_resource());
    assert!(!path.is_singular());
    assert_eq!(path.expression(), "name");

    let given = compile_expression("name.$this.given", &context).unwrap();
    assert_eq!(given.expression(), "name.given");
    assert_eq!(values(&given, &input).len(), 5);

    let err = compile_expression("name.$index", &context).unwrap_err();
    assert!(matches!(err, EvaluationError::UnsupportedConstruct(_)));
}

#[test]
fn test_unsupported_constructs_fail_eagerly() {
    let input = resources(patients(), "Patient", 1);
    let context = context(&input);
    for expression in [
        "name[0]",
        "-birthDate",
        "name | name",
        "gender is code",
        "$index",
        "$total",
        "%ucum",
    ] {
        let err = compile_expression(expression, &context).unwrap_err();
        assert!(
            matches!(err, EvaluationError::UnsupportedConstruct(_)),
            "{} gave {:?}",
            expression,
            err
        );
        assert!(err.is_user_error());
    }
}

#[test]
fn test_unregistered_operators_and_functions() {
    let input = resources(patients(), "Patient", 1);
    let context = context(&input);

    assert_eq!(
        compile_expression("gender + 'x'", &context).unwrap_err(),
        EvaluationError::UnsupportedOperator("+".to_string())
    );
    assert_eq!(
        compile_expression("gender in 'x'", &context).unwrap_err(),
        EvaluationError::UnsupportedOperator("in".to_string())
    );
    assert_eq!(
        compile_expression("name.where(family = 'Doe')", &context).unwrap_err(),
        EvaluationError::UnknownFunction("where".to_string())
    );
}

#[test]
fn test_operands_are_evaluated_before_the_operator_lookup() {
    let input = resources(patients(), "Patient", 1);
    let context = context(&input);
    let err = compile_expression("nickname + 1", &context).unwrap_err();
    assert!(matches!(err, EvaluationError::UnknownElement(_)));
}

#[test]
fn test_parse_errors_are_user_errors() {
    let input = resources(patients(), "Patient", 1);
    let context = context(&input);
    let err = compile_expression("name.given(", &context).unwrap_err();
    assert!(matches!(err, EvaluationError::Parse(_)));
    assert!(err.is_user_error());
}

#[test]
fn test_comparison_with_literal() {
    let input = resources(patients(), "Patient", 3);
    let context = context(&input);
    let path = compile_expression("gender = 'female'", &context).unwrap();
    assert!(path.is_singular());
    assert_eq!(path.fhir_type(), Some("boolean"));
    assert_eq!(path.expression(), "gender = 'female'");
    assert_eq!(
        values(&path, &input),
        vec![
            ("p1".to_string(), json!(true)),
            ("p2".to_string(), json!(false)),
            ("p3".to_string(), Value::Null),
        ]
    );

    let born = compile_expression("birthDate < @1990-01-01", &context).unwrap();
    assert_eq!(values(&born, &input)[0], ("p1".to_string(), json!(true)));
}

#[test]
fn test_boolean_logic_is_three_valued() {
    let input = resources(patients(), "Patient", 2);
    let context = context(&input);
    let path = compile_expression("active or gender = 'female'", &context).unwrap();
    assert_eq!(
        values(&path, &input),
        vec![
            ("p1".to_string(), json!(true)),
            ("p2".to_string(), json!(false)),
            ("p3".to_string(), Value::Null),
        ]
    );

    let path = compile_expression("active and gender = 'female'", &context).unwrap();
    assert_eq!(
        values(&path, &input),
        vec![
            ("p1".to_string(), json!(true)),
            ("p2".to_string(), json!(false)),
            ("p3".to_string(), Value::Null),
        ]
    );
}

#[test]
fn test_literal_operands_fold() {
    let input = resources(patients(), "Patient", 1);
    let context = context(&input);
    let path = compile_expression("1 < 2 and 'a' = 'b'", &context).unwrap();
    let literal = path.as_literal().expect("two literals fold to a literal");
    assert_eq!(literal.value, json!(false));
    assert_eq!(path.expression(), "1 < 2 and 'a' = 'b'");

    // Literals are evaluated once per record of the input context.
    assert_eq!(values(&path, &input).len(), 3);
}

#[test]
fn test_decimal_literals_compare_numerically() {
    let input = resources(patients(), "Patient", 1);
    let context = context(&input);
    for (expression, expected) in [
        ("10.5 > 9.5", json!(true)),
        ("2.5 = 2.50", json!(true)),
        ("1.5 < 2", json!(true)),
        ("2 >= 2.0", json!(true)),
        ("0.1 != 0.1", json!(false)),
    ] {
        let path = compile_expression(expression, &context).unwrap();
        let literal = path.as_literal().expect("literal operands fold");
        assert_eq!(literal.value, expected, "{}", expression);
    }
}

#[test]
fn test_decimal_elements_compare_with_literals() {
    let input = resources(
        vec![
            json!({ "resourceType": "Observation", "id": "o1", "valueDecimal": 7.25 }),
            json!({ "resourceType": "Observation", "id": "o2", "valueDecimal": 10 }),
            json!({ "resourceType": "Observation", "id": "o3" }),
        ],
        "Observation",
        2,
    );
    let context = context(&input);
    let path = compile_expression("valueDecimal > 7.5", &context).unwrap();
    assert_eq!(
        values(&path, &input),
        vec![
            ("o1".to_string(), json!(false)),
            ("o2".to_string(), json!(true)),
            ("o3".to_string(), Value::Null),
        ]
    );

    let path = compile_expression("valueDecimal = 7.25", &context).unwrap();
    assert_eq!(values(&path, &input)[0], ("o1".to_string(), json!(true)));
}

#[test]
fn test_operator_operand_checks() {
    let input = resources(patients(), "Patient", 1);
    let context = context(&input);

    let err = compile_expression("name.family = 'Doe'", &context).unwrap_err();
    assert!(matches!(err, EvaluationError::InvalidOperation(ref m) if m.contains("singular")));

    let err = compile_expression("Patient = 'p1'", &context).unwrap_err();
    assert!(matches!(err, EvaluationError::InvalidOperation(ref m) if m.contains("resource")));

    let err = compile_expression("gender and active", &context).unwrap_err();
    assert!(matches!(err, EvaluationError::InvalidOperation(ref m) if m.contains("Boolean")));
}

#[test]
fn test_aggregations_restore_singularity() {
    let input = resources(patients(), "Patient", 3);
    let context = context(&input);

    let count = compile_expression("name.given.count()", &context).unwrap();
    assert!(count.is_singular());
    assert!(count.eid_column().is_none());
    assert_eq!(count.fhir_type(), Some("integer"));
    assert_eq!(
        values(&count, &input),
        vec![
            ("p1".to_string(), json!(3)),
            ("p2".to_string(), json!(0)),
            ("p3".to_string(), json!(0)),
        ]
    );

    let exists = compile_expression("name.exists()", &context).unwrap();
    assert_eq!(
        values(&exists, &input),
        vec![
            ("p1".to_string(), json!(true)),
            ("p2".to_string(), json!(false)),
            ("p3".to_string(), json!(true)),
        ]
    );

    let empty = compile_expression("name.given.empty()", &context).unwrap();
    assert_eq!(
        values(&empty, &input),
        vec![
            ("p1".to_string(), json!(false)),
            ("p2".to_string(), json!(true)),
            ("p3".to_string(), json!(true)),
        ]
    );
}

#[test]
fn test_aggregates_join_with_other_operands() {
    let input = resources(patients(), "Patient", 2);
    let context = context(&input);
    let path = compile_expression("name.count() > 1 or gender = 'male'", &context).unwrap();
    assert!(path.is_singular());
    assert_eq!(
        values(&path, &input),
        vec![
            ("p1".to_string(), json!(true)),
            ("p2".to_string(), json!(true)),
            ("p3".to_string(), Value::Null),
        ]
    );
}

#[test]
fn test_aggregation_arguments_are_rejected() {
    let input = resources(patients(), "Patient", 1);
    let context = context(&input);
    let err = compile_expression("name.count(1)", &context).unwrap_err();
    assert!(matches!(err, EvaluationError::InvalidArgument(_)));

    let folded = compile_expression("{}.empty()", &context).unwrap();
    assert_eq!(folded.as_literal().map(|l| l.value.clone()), Some(json!(true)));
}
