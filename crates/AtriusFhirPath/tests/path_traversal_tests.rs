mod common;

use atrius_fhir_path::dataset::col;
use atrius_fhir_path::evaluator::compile_expression;
use atrius_fhir_path::fhir_path::{FhirPath, Presence};
use atrius_fhir_path::path_traversal::traverse;
use atrius_fhirpath_support::evaluation_error::EvaluationError;
use common::*;
use serde_json::{Value, json};

fn patients() -> Vec<Value> {
    vec![
        json!({
            "resourceType": "Patient",
            "id": "p1",
            "gender": "female",
            "name": [
                { "family": "Doe", "given": ["Jane", "J"] },
                { "family": "Roe", "given": ["Janet", "R"] }
            ]
        }),
        json!({ "resourceType": "Patient", "id": "p2", "gender": "male", "name": [] }),
        json!({ "resourceType": "Patient", "id": "p3" }),
    ]
}

#[test]
fn test_nested_repeating_fields_produce_positional_element_ids() {
    let input = resources(vec![patients().remove(0)], "Patient", 2);
    let context = context(&input);
    let given = compile_expression("Patient.name.given", &context).unwrap();

    assert!(!given.is_singular());
    assert_eq!(given.expression(), "name.given");
    assert_eq!(
        rows(&given, &input),
        vec![
            row("p1", Some(&[0, 0]), json!("Jane")),
            row("p1", Some(&[0, 1]), json!("J")),
            row("p1", Some(&[1, 0]), json!("Janet")),
            row("p1", Some(&[1, 1]), json!("R")),
        ]
    );
}

#[test]
fn test_outer_explode_keeps_empty_and_absent_fields() {
    let input = resources(patients(), "Patient", 3);
    let context = context(&input);
    let names = compile_expression("name", &context).unwrap();

    assert_eq!(
        rows(&names, &input)
            .into_iter()
            .map(|r| (r.id, r.eid))
            .collect::<Vec<_>>(),
        vec![
            ("p1".to_string(), Some(vec![0])),
            ("p1".to_string(), Some(vec![1])),
            ("p2".to_string(), None),
            ("p3".to_string(), None),
        ]
    );

    let given = compile_expression("name.given", &context).unwrap();
    let given_rows = rows(&given, &input);
    assert_eq!(given_rows.len(), 6);
    assert_eq!(given_rows[4], row("p2", None, Value::Null));
    assert_eq!(given_rows[5], row("p3", None, Value::Null));
}

#[test]
fn test_singular_children_pass_rows_through() {
    let input = resources(patients(), "Patient", 2);
    let context = context(&input);

    let gender = compile_expression("gender", &context).unwrap();
    assert!(gender.is_singular());
    assert!(gender.eid_column().is_none());
    assert!(gender.dataset().unwrap().same_plan(&input.dataset));
    assert_eq!(
        rows(&gender, &input),
        vec![
            row("p1", None, json!("female")),
            row("p2", None, json!("male")),
            row("p3", None, Value::Null),
        ]
    );

    // A singular child of a repeating element keeps the element id.
    let family = compile_expression("name.family", &context).unwrap();
    assert!(!family.is_singular());
    assert!(family.eid_column().is_some());
    assert_eq!(
        &rows(&family, &input)[..2],
        &[
            row("p1", Some(&[0]), json!("Doe")),
            row("p1", Some(&[1]), json!("Roe")),
        ]
    );
}

#[test]
fn test_singular_is_false_iff_a_segment_repeats() {
    let input = resources(Vec::new(), "Patient", 1);
    let context = context(&input);
    let cases = [
        ("maritalStatus", true),
        ("maritalStatus.text", true),
        ("maritalStatus.coding", false),
        ("maritalStatus.coding.code", false),
        ("contact.name.family", false),
        ("deceasedBoolean", true),
    ];
    for (expression, singular) in cases {
        let path = compile_expression(expression, &context).unwrap();
        assert_eq!(path.is_singular(), singular, "{}", expression);
    }
}

#[test]
fn test_backbone_elements_resolve_under_their_own_path() {
    let input = resources(
        vec![json!({
            "resourceType": "Patient",
            "id": "p1",
            "contact": [
                { "telecom": [{ "value": "555-1" }, { "value": "555-2" }] },
                { "telecom": [{ "value": "555-3" }] }
            ]
        })],
        "Patient",
        1,
    );
    let context = context(&input);
    let values = compile_expression("contact.telecom.value", &context).unwrap();
    assert_eq!(
        rows(&values, &input),
        vec![
            row("p1", Some(&[0, 0]), json!("555-1")),
            row("p1", Some(&[0, 1]), json!("555-2")),
            row("p1", Some(&[1, 0]), json!("555-3")),
        ]
    );
}

#[test]
fn test_expression_strings_drop_the_input_context() {
    let input = resources(Vec::new(), "Patient", 1);
    let context = context(&input);
    let name = traverse(context.input_context(), "name", &context).unwrap();
    assert_eq!(name.expression(), "name");
    let given = traverse(&name, "given", &context).unwrap();
    assert_eq!(given.expression(), "name.given");
}

#[test]
fn test_traversal_errors() {
    let input = resources(Vec::new(), "Patient", 1);
    let context = context(&input);

    let err = compile_expression("name.nickname", &context).unwrap_err();
    assert_eq!(
        err,
        EvaluationError::UnknownElement("No such child: name.nickname".to_string())
    );
    assert!(err.is_user_error());

    let err = compile_expression("'text'.length", &context).unwrap_err();
    assert!(matches!(err, EvaluationError::InvalidOperation(ref msg) if msg.contains("literal")));
}

#[test]
fn test_absent_resource_reads_as_null() {
    let input = resources(
        vec![
            json!({ "resourceType": "Patient", "id": "p1", "gender": "female", "present": true }),
            json!({ "resourceType": "Patient", "id": "p2", "gender": "male" }),
        ],
        "Patient",
        1,
    );
    let gated = input
        .clone()
        .with_presence(Presence::Indicated(col("present")));
    let context = common::context(&gated);
    let gender = traverse(&FhirPath::Resource(gated.clone()), "gender", &context).unwrap();
    assert_eq!(
        rows(&gender, &gated),
        vec![row("p1", None, json!("female")), row("p2", None, Value::Null)]
    );
}
