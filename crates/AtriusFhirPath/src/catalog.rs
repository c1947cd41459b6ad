//! StructureDefinition-backed element catalog.
//!
//! [`StructureDefinitionCatalog`] indexes the elements of FHIR StructureDefinitions
//! by parent type and child name so that path traversal can resolve a segment to
//! its cardinality and type. It accepts a single StructureDefinition, a Bundle of
//! them, or a JSON array. Primitive types and constraint profiles are skipped.
//!
//! Children are keyed by the *type path* of their parent: the type code for data
//! types (`HumanName`), and the full element path for inline backbone elements
//! (`Patient.contact`). Choice elements such as `Observation.value[x]` are
//! registered once per allowed type under the type-suffixed name
//! (`valueQuantity`, `valueCodeableConcept`, ...), matching their JSON names.

use std::collections::HashMap;
use std::io::Read;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{FhirPathError, FhirPathResult};
use atrius_fhirpath_support::traits::ElementCatalog;
use atrius_fhirpath_support::type_info::{ElementDefinition, MaxCardinality};

const SYSTEM_TYPE_PREFIX: &str = "http://hl7.org/fhirpath/System.";

#[derive(Debug, Deserialize)]
struct StructureDefinitionDocument {
    name: String,
    #[serde(rename = "type")]
    type_name: Option<String>,
    kind: Option<String>,
    derivation: Option<String>,
    snapshot: Option<ElementList>,
    differential: Option<ElementList>,
}

#[derive(Debug, Deserialize)]
struct ElementList {
    #[serde(default)]
    element: Vec<ElementEntry>,
}

#[derive(Debug, Deserialize)]
struct ElementEntry {
    path: String,
    max: Option<String>,
    #[serde(rename = "contentReference")]
    content_reference: Option<String>,
    #[serde(rename = "type", default)]
    types: Vec<ElementType>,
}

#[derive(Debug, Deserialize)]
struct ElementType {
    code: String,
}

/// An [`ElementCatalog`] built from FHIR StructureDefinitions.
#[derive(Debug, Clone, Default)]
pub struct StructureDefinitionCatalog {
    elements: HashMap<String, HashMap<String, ElementDefinition>>,
}

impl StructureDefinitionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every StructureDefinition found in `value`.
    pub fn from_json(value: &Value) -> FhirPathResult<Self> {
        let mut catalog = Self::new();
        catalog.load(value)?;
        Ok(catalog)
    }

    /// Reads StructureDefinition JSON from `reader`.
    pub fn from_reader<R: Read>(reader: R) -> FhirPathResult<Self> {
        let value: Value = serde_json::from_reader(reader)?;
        Self::from_json(&value)
    }

    /// Adds every StructureDefinition found in `value` to this catalog.
    pub fn load(&mut self, value: &Value) -> FhirPathResult<()> {
        match value {
            Value::Array(items) => items.iter().try_for_each(|item| self.load(item)),
            Value::Object(object) => match object.get("resourceType").and_then(Value::as_str) {
                Some("StructureDefinition") => self.load_structure_definition(value),
                Some("Bundle") => object
                    .get("entry")
                    .and_then(Value::as_array)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|entry| entry.get("resource"))
                            .try_for_each(|resource| self.load(resource))
                    })
                    .unwrap_or(Ok(())),
                other => {
                    warn!("Ignoring non-StructureDefinition resource: {:?}", other);
                    Ok(())
                }
            },
            _ => Err(FhirPathError::InvalidInput(
                "Expected a StructureDefinition, Bundle or array".to_string(),
            )),
        }
    }

    fn load_structure_definition(&mut self, value: &Value) -> FhirPathResult<()> {
        let document: StructureDefinitionDocument = serde_json::from_value(value.clone())?;
        if document.kind.as_deref() == Some("primitive-type") {
            debug!("Skipping primitive type {}", document.name);
            return Ok(());
        }
        if document.derivation.as_deref() == Some("constraint") {
            debug!("Skipping profile {}", document.name);
            return Ok(());
        }
        let root = document
            .type_name
            .clone()
            .unwrap_or_else(|| document.name.clone());
        let elements = document
            .snapshot
            .or(document.differential)
            .map(|list| list.element)
            .unwrap_or_default();

        let mut loaded = 0usize;
        for entry in elements {
            let Some((parent, name)) = entry.path.rsplit_once('.') else {
                continue;
            };
            if !parent.starts_with(root.as_str()) {
                continue;
            }
            let max = match entry.max.as_deref() {
                None => MaxCardinality::Bounded(1),
                Some(max) => MaxCardinality::parse(max).ok_or_else(|| {
                    FhirPathError::InvalidInput(format!(
                        "Invalid max cardinality '{}' on {}",
                        max, entry.path
                    ))
                })?,
            };
            for (child_name, definition) in element_definitions(&entry, parent, name, max) {
                self.insert(parent, child_name, definition);
                loaded += 1;
            }
        }
        debug!("Loaded {} elements from {}", loaded, root);
        Ok(())
    }

    fn insert(&mut self, parent: &str, name: String, definition: ElementDefinition) {
        self.elements
            .entry(parent.to_string())
            .or_default()
            .insert(name, definition);
    }

    /// Registers a child element programmatically.
    ///
    /// `BackboneElement` and `Element` children are catalogued under their own
    /// path, every other type under its type code.
    pub fn with_element(
        mut self,
        parent: &str,
        name: &str,
        max: MaxCardinality,
        fhir_type: &str,
    ) -> Self {
        let path = format!("{}.{}", parent, name);
        let mut definition = ElementDefinition::new(path.clone(), max, fhir_type);
        if is_inline_type(fhir_type) {
            definition = definition.with_type_path(path);
        }
        self.insert(parent, name.to_string(), definition);
        self
    }

    /// Number of registered child elements.
    pub fn len(&self) -> usize {
        self.elements.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl ElementCatalog for StructureDefinitionCatalog {
    fn lookup(&self, parent_type: &str, segment: &str) -> Option<ElementDefinition> {
        self.elements.get(parent_type)?.get(segment).cloned()
    }
}

fn is_inline_type(code: &str) -> bool {
    code == "BackboneElement" || code == "Element"
}

fn normalise_type_code(code: &str) -> String {
    match code.strip_prefix(SYSTEM_TYPE_PREFIX) {
        Some(system) => {
            let mut chars = system.chars();
            match chars.next() {
                Some(first) => first.to_lowercase().chain(chars).collect(),
                None => system.to_string(),
            }
        }
        None => code.to_string(),
    }
}

fn capitalise(code: &str) -> String {
    let mut chars = code.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn element_definitions(
    entry: &ElementEntry,
    parent: &str,
    name: &str,
    max: MaxCardinality,
) -> Vec<(String, ElementDefinition)> {
    if let Some(reference) = &entry.content_reference {
        let target = reference.rsplit('#').next().unwrap_or(reference);
        let definition = ElementDefinition::new(entry.path.clone(), max, "BackboneElement")
            .with_type_path(target);
        return vec![(name.to_string(), definition)];
    }

    if let Some(stem) = name.strip_suffix("[x]") {
        return entry
            .types
            .iter()
            .map(|t| {
                let code = normalise_type_code(&t.code);
                let child = format!("{}{}", stem, capitalise(&code));
                let path = format!("{}.{}", parent, child);
                (child, ElementDefinition::new(path, max, code))
            })
            .collect();
    }

    let code = entry
        .types
        .first()
        .map(|t| normalise_type_code(&t.code))
        .unwrap_or_else(|| "Element".to_string());
    let mut definition = ElementDefinition::new(entry.path.clone(), max, code.clone());
    if is_inline_type(&code) {
        definition = definition.with_type_path(entry.path.clone());
    }
    vec![(name.to_string(), definition)]
}
