#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use atrius_fhir_path::catalog::StructureDefinitionCatalog;
use atrius_fhir_path::context::ParserContext;
use atrius_fhir_path::engine::LocalEngine;
use atrius_fhir_path::fhir_path::{FhirPath, ResourcePath};
use atrius_fhir_path::resource_reader::ResourceReader;
use atrius_fhir_path::terminology_client::{CompositeValueSet, TerminologyService};
use atrius_fhirpath_support::coding::Coding;
use atrius_fhirpath_support::evaluation_error::{EvaluationError, EvaluationResult};
use atrius_fhirpath_support::type_info::MaxCardinality::{Bounded, Unbounded};

/// Element definitions for the handful of Patient and Observation elements the
/// tests navigate.
pub fn catalog() -> StructureDefinitionCatalog {
    StructureDefinitionCatalog::new()
        .with_element("Patient", "name", Unbounded, "HumanName")
        .with_element("Patient", "gender", Bounded(1), "code")
        .with_element("Patient", "active", Bounded(1), "boolean")
        .with_element("Patient", "birthDate", Bounded(1), "date")
        .with_element("Patient", "maritalStatus", Bounded(1), "CodeableConcept")
        .with_element("Patient", "contact", Unbounded, "BackboneElement")
        .with_element("Patient.contact", "name", Bounded(1), "HumanName")
        .with_element("Patient.contact", "telecom", Unbounded, "ContactPoint")
        .with_element("Patient", "deceasedBoolean", Bounded(0), "boolean")
        .with_element("HumanName", "given", Unbounded, "string")
        .with_element("HumanName", "family", Bounded(1), "string")
        .with_element("ContactPoint", "value", Bounded(1), "string")
        .with_element("CodeableConcept", "coding", Unbounded, "Coding")
        .with_element("CodeableConcept", "text", Bounded(1), "string")
        .with_element("Coding", "system", Bounded(1), "uri")
        .with_element("Coding", "code", Bounded(1), "code")
        .with_element("Coding", "version", Bounded(1), "string")
        .with_element("Observation", "status", Bounded(1), "code")
        .with_element("Observation", "code", Bounded(1), "CodeableConcept")
        .with_element("Observation", "valueCodeableConcept", Bounded(1), "CodeableConcept")
        .with_element("Observation", "valueCoding", Bounded(1), "Coding")
        .with_element("Observation", "valueDecimal", Bounded(1), "decimal")
        .with_element("Observation", "component", Unbounded, "BackboneElement")
        .with_element("Observation.component", "code", Bounded(1), "CodeableConcept")
}

/// Reads `resources` of `resource_type` into `partitions` partitions.
pub fn resources(resources: Vec<Value>, resource_type: &str, partitions: usize) -> ResourcePath {
    ResourceReader::new(partitions)
        .read_resource_path(resources, resource_type)
        .expect("resources should load")
}

pub fn context(input: &ResourcePath) -> ParserContext {
    ParserContext::new(input.clone(), Arc::new(catalog())).with_request_id("test")
}

pub fn context_with_terminology(input: &ResourcePath, service: Arc<MockTerminology>) -> ParserContext {
    context(input).with_terminology_service(service)
}

/// One result row: record id, element id and value.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub id: String,
    pub eid: Option<Vec<u64>>,
    pub value: Value,
}

/// Executes `path` and returns its rows sorted by record id and element id.
pub fn execute(path: &FhirPath, input: &ResourcePath) -> EvaluationResult<Vec<ResultRow>> {
    let rows = LocalEngine::new().collect(&path.result_dataset(input))?;
    let mut rows: Vec<ResultRow> = rows
        .into_iter()
        .map(|row| ResultRow {
            id: row.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            eid: row
                .get("eid")
                .and_then(Value::as_array)
                .map(|indices| indices.iter().filter_map(Value::as_u64).collect()),
            value: row.get("value").cloned().unwrap_or(Value::Null),
        })
        .collect();
    rows.sort_by(|a, b| (&a.id, &a.eid).cmp(&(&b.id, &b.eid)));
    Ok(rows)
}

pub fn rows(path: &FhirPath, input: &ResourcePath) -> Vec<ResultRow> {
    execute(path, input).expect("plan should execute")
}

pub fn row(id: &str, eid: Option<&[u64]>, value: Value) -> ResultRow {
    ResultRow {
        id: id.to_string(),
        eid: eid.map(<[u64]>::to_vec),
        value,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminologyCall {
    Search(String),
    Expand { value_set: CompositeValueSet, count: usize },
}

/// In-memory terminology service.
///
/// `members` is the content of every value set. Expansion returns the members
/// matched by an include of the composite, like a server computing the
/// intersection would.
#[derive(Debug, Default)]
pub struct MockTerminology {
    known_systems: HashSet<String>,
    members: Vec<Coding>,
    failing: bool,
    calls: Mutex<Vec<TerminologyCall>>,
}

impl MockTerminology {
    pub fn new(known_systems: &[&str], members: Vec<Coding>) -> Arc<Self> {
        Arc::new(Self {
            known_systems: known_systems.iter().map(|s| s.to_string()).collect(),
            members,
            failing: false,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// A service whose every request fails.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            failing: true,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<TerminologyCall> {
        self.calls.lock().clone()
    }

    pub fn searches(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TerminologyCall::Search(system) => Some(system),
                _ => None,
            })
            .collect()
    }

    pub fn expansions(&self) -> Vec<(CompositeValueSet, usize)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TerminologyCall::Expand { value_set, count } => Some((value_set, count)),
                _ => None,
            })
            .collect()
    }
}

impl TerminologyService for MockTerminology {
    fn search_code_systems(&self, system_uri: &str) -> EvaluationResult<Vec<Value>> {
        self.calls
            .lock()
            .push(TerminologyCall::Search(system_uri.to_string()));
        if self.failing {
            return Err(EvaluationError::Terminology("connection refused".to_string()));
        }
        if self.known_systems.contains(system_uri) {
            Ok(vec![serde_json::json!({ "resource": { "resourceType": "CodeSystem", "id": "cs" } })])
        } else {
            Ok(Vec::new())
        }
    }

    fn expand(&self, value_set: &CompositeValueSet, count: usize) -> EvaluationResult<Vec<Coding>> {
        self.calls.lock().push(TerminologyCall::Expand {
            value_set: value_set.clone(),
            count,
        });
        if self.failing {
            return Err(EvaluationError::Terminology("connection refused".to_string()));
        }
        Ok(self
            .members
            .iter()
            .filter(|member| {
                value_set.includes.iter().any(|include| {
                    member.system.as_deref() == Some(include.system.as_str())
                        && member.code.as_ref().is_some_and(|code| include.codes.contains(code))
                        && match (&include.version, &member.version) {
                            (Some(wanted), Some(actual)) => wanted == actual,
                            _ => true,
                        }
                })
            })
            .take(count)
            .cloned()
            .collect())
    }
}
