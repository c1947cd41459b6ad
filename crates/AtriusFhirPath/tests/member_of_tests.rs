mod common;

use std::sync::Arc;

use atrius_fhir_path::evaluator::compile_expression;
use atrius_fhirpath_support::coding::Coding;
use atrius_fhirpath_support::evaluation_error::EvaluationError;
use common::*;
use serde_json::{Value, json};

const VALUE_SET: &str = "http://example.org/ValueSet/vitals";
const SYS1: &str = "http://sys1";
const SYS2: &str = "http://sys2";

fn observation(id: &str, code: Value) -> Value {
    json!({ "resourceType": "Observation", "id": id, "status": "final", "code": code })
}

fn concept(codings: &[(&str, &str)]) -> Value {
    let codings: Vec<Value> = codings
        .iter()
        .map(|(system, code)| json!({ "system": system, "code": code }))
        .collect();
    json!({ "coding": codings })
}

fn observations() -> Vec<Value> {
    vec![
        observation("o1", concept(&[(SYS1, "A")])),
        observation("o2", concept(&[(SYS1, "B"), (SYS2, "X")])),
        observation("o3", concept(&[(SYS2, "A")])),
        json!({ "resourceType": "Observation", "id": "o4", "status": "final" }),
        observation("o5", json!({ "text": "free text only" })),
    ]
}

fn member_of(code: &str) -> String {
    format!("{}.memberOf('{}')", code, VALUE_SET)
}

fn values(rows: Vec<ResultRow>) -> Vec<(String, Value)> {
    rows.into_iter().map(|r| (r.id, r.value)).collect()
}

#[test]
fn test_member_without_version_matches_versioned_member() {
    let service = MockTerminology::new(&[SYS1], vec![Coding::versioned(SYS1, "A", "2")]);
    let input = resources(vec![observation("o1", concept(&[(SYS1, "A")]))], "Observation", 1);
    let context = context_with_terminology(&input, service.clone());

    let path = compile_expression(&member_of("code"), &context).unwrap();
    assert!(path.is_singular());
    assert_eq!(path.fhir_type(), Some("boolean"));
    assert_eq!(rows(&path, &input), vec![row("o1", None, json!(true))]);
}

#[test]
fn test_undefined_coding_lists_yield_null() {
    let service = MockTerminology::new(&[SYS1], vec![Coding::new(SYS1, "A")]);
    let input = resources(observations(), "Observation", 2);
    let context = context_with_terminology(&input, service.clone());

    let path = compile_expression(&member_of("code"), &context).unwrap();
    assert_eq!(
        values(rows(&path, &input)),
        vec![
            ("o1".to_string(), json!(true)),
            ("o2".to_string(), json!(false)),
            ("o3".to_string(), json!(false)),
            ("o4".to_string(), Value::Null),
            ("o5".to_string(), Value::Null),
        ]
    );
}

#[test]
fn test_unknown_systems_are_left_out_of_the_composite() {
    let service = MockTerminology::new(&[SYS1], vec![Coding::new(SYS1, "B")]);
    let input = resources(observations(), "Observation", 3);
    let context = context_with_terminology(&input, service.clone());

    let path = compile_expression(&member_of("code"), &context).unwrap();
    let results = values(rows(&path, &input));
    assert_eq!(results[1], ("o2".to_string(), json!(true)));

    assert_eq!(service.searches(), vec![SYS1.to_string(), SYS2.to_string()]);
    let expansions = service.expansions();
    assert_eq!(expansions.len(), 1);
    let (value_set, count) = &expansions[0];
    assert_eq!(value_set.value_set_uri, VALUE_SET);
    assert_eq!(value_set.includes.len(), 1);
    assert_eq!(value_set.includes[0].system, SYS1);
    assert_eq!(
        value_set.includes[0].codes.iter().cloned().collect::<Vec<_>>(),
        vec!["A".to_string(), "B".to_string()]
    );
    // Distinct defined codings across the whole dataset.
    assert_eq!(*count, 4);
}

#[test]
fn test_no_known_systems_skips_the_expansion() {
    let service = MockTerminology::new(&[], vec![Coding::new(SYS1, "A")]);
    let input = resources(observations(), "Observation", 2);
    let context = context_with_terminology(&input, service.clone());

    let path = compile_expression(&member_of("code"), &context).unwrap();
    let results = values(rows(&path, &input));
    assert!(results[..3].iter().all(|(_, value)| value == &json!(false)));
    assert_eq!(service.searches().len(), 2);
    assert!(service.expansions().is_empty());
}

#[test]
fn test_results_do_not_depend_on_partitioning() {
    let members = vec![Coding::new(SYS1, "A"), Coding::new(SYS2, "X")];
    let mut previous: Option<Vec<ResultRow>> = None;
    for partitions in [1, 3, 7] {
        let service = MockTerminology::new(&[SYS1, SYS2], members.clone());
        let input = resources(observations(), "Observation", partitions);
        let context = context_with_terminology(&input, service.clone());
        let path = compile_expression(&member_of("code"), &context).unwrap();
        let results = rows(&path, &input);

        assert_eq!(service.expansions().len(), 1, "partitions = {}", partitions);
        if let Some(previous) = &previous {
            assert_eq!(previous, &results, "partitions = {}", partitions);
        }
        previous = Some(results);
    }
}

#[test]
fn test_server_failures_fail_the_query() {
    let service = MockTerminology::failing();
    let input = resources(observations(), "Observation", 2);
    let context = context_with_terminology(&input, service.clone());

    let path = compile_expression(&member_of("code"), &context).unwrap();
    let err = execute(&path, &input).unwrap_err();
    assert!(matches!(err, EvaluationError::Terminology(_)));
    assert!(!err.is_user_error());
}

#[test]
fn test_coding_input() {
    let service = MockTerminology::new(&[SYS1], vec![Coding::versioned(SYS1, "A", "1")]);
    let input = resources(
        vec![
            json!({ "resourceType": "Observation", "id": "o1",
                    "valueCoding": { "system": SYS1, "code": "A", "version": "1" } }),
            json!({ "resourceType": "Observation", "id": "o2",
                    "valueCoding": { "system": SYS1, "code": "A", "version": "3" } }),
            json!({ "resourceType": "Observation", "id": "o3" }),
        ],
        "Observation",
        2,
    );
    let context = context_with_terminology(&input, service.clone());

    let path = compile_expression(&member_of("valueCoding"), &context).unwrap();
    assert_eq!(
        values(rows(&path, &input)),
        vec![
            ("o1".to_string(), json!(true)),
            ("o2".to_string(), json!(false)),
            ("o3".to_string(), Value::Null),
        ]
    );
    let expansions = service.expansions();
    assert_eq!(expansions.len(), 1);
    assert_eq!(expansions[0].0.includes.len(), 2);
}

#[test]
fn test_exploded_codings_keep_their_element_ids() {
    let service = MockTerminology::new(&[SYS1, SYS2], vec![Coding::new(SYS2, "X")]);
    let input = resources(observations(), "Observation", 2);
    let context = context_with_terminology(&input, service.clone());

    let path = compile_expression(&member_of("code.coding"), &context).unwrap();
    assert!(!path.is_singular());
    let results = rows(&path, &input);
    assert_eq!(
        &results[..4],
        &[
            row("o1", Some(&[0][..]), json!(false)),
            row("o2", Some(&[0][..]), json!(false)),
            row("o2", Some(&[1][..]), json!(true)),
            row("o3", Some(&[0][..]), json!(false)),
        ]
    );
    assert_eq!(results[4], row("o4", None, Value::Null));
}

#[test]
fn test_repeated_checks_share_one_expansion() {
    let service = MockTerminology::new(&[SYS1], vec![Coding::new(SYS1, "A")]);
    let input = resources(observations(), "Observation", 3);
    let context = context_with_terminology(&input, service.clone());

    let expression = format!("{} or {}", member_of("code"), member_of("code"));
    let path = compile_expression(&expression, &context).unwrap();
    let results = values(rows(&path, &input));
    assert_eq!(results[0], ("o1".to_string(), json!(true)));
    assert_eq!(service.expansions().len(), 1);
    assert_eq!(service.searches(), vec![SYS1.to_string(), SYS2.to_string()]);
}

#[test]
fn test_member_of_argument_and_input_checks() {
    let input = resources(observations(), "Observation", 1);

    let err = compile_expression(&member_of("code"), &context(&input)).unwrap_err();
    assert!(matches!(err, EvaluationError::InvalidOperation(ref m) if m.contains("terminology service")));

    let service: Arc<MockTerminology> = MockTerminology::new(&[SYS1], Vec::new());
    let context = context_with_terminology(&input, service);

    let err = compile_expression("code.memberOf(status)", &context).unwrap_err();
    assert!(matches!(err, EvaluationError::InvalidArgument(_)));

    let err = compile_expression("code.memberOf()", &context).unwrap_err();
    assert!(matches!(err, EvaluationError::InvalidArgument(_)));

    let err = compile_expression(&member_of("status"), &context).unwrap_err();
    assert!(matches!(err, EvaluationError::InvalidOperation(ref m) if m.contains("Coding or CodeableConcept")));

    let err = compile_expression(&format!("'A'.memberOf('{}')", VALUE_SET), &context).unwrap_err();
    assert!(matches!(err, EvaluationError::InvalidOperation(_)));
}

#[test]
fn test_member_of_composes_with_operators() {
    let service = MockTerminology::new(&[SYS1], vec![Coding::new(SYS1, "A")]);
    let input = resources(observations(), "Observation", 2);
    let context = context_with_terminology(&input, service.clone());

    let expression = format!("{} and status = 'final'", member_of("code"));
    let path = compile_expression(&expression, &context).unwrap();
    assert_eq!(
        values(rows(&path, &input))[..2],
        [("o1".to_string(), json!(true)), ("o2".to_string(), json!(false))]
    );
}
