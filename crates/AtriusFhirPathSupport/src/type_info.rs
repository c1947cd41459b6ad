//! # Element Type Information
//!
//! Cardinality and type metadata for a single element of a FHIR structure, as
//! returned by an [`ElementCatalog`](crate::traits::ElementCatalog) lookup.

use std::fmt;

/// Upper bound on how many times an element may occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaxCardinality {
    /// At most `n` occurrences.
    Bounded(u32),
    /// Any number of occurrences (`*`).
    Unbounded,
}

impl MaxCardinality {
    /// Parses the `max` string of an ElementDefinition (`"1"`, `"*"`, ...).
    pub fn parse(max: &str) -> Option<Self> {
        match max.trim() {
            "*" => Some(MaxCardinality::Unbounded),
            digits => digits.parse::<u32>().ok().map(MaxCardinality::Bounded),
        }
    }

    /// True when the element may occur more than once.
    pub fn is_repeating(&self) -> bool {
        match self {
            MaxCardinality::Bounded(n) => *n > 1,
            MaxCardinality::Unbounded => true,
        }
    }
}

impl fmt::Display for MaxCardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxCardinality::Bounded(n) => write!(f, "{}", n),
            MaxCardinality::Unbounded => write!(f, "*"),
        }
    }
}

/// Definition of one child element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementDefinition {
    /// Full element path, e.g. `Patient.name.given`.
    pub path: String,
    pub max_cardinality: MaxCardinality,
    /// FHIR type code, e.g. `HumanName`, `string`, `BackboneElement`.
    pub fhir_type: String,
    /// Name under which this element's own children are catalogued. This is the
    /// type code for data types, and the element path for backbone elements.
    pub type_path: String,
}

impl ElementDefinition {
    /// Creates a definition whose children are catalogued under its type code.
    pub fn new(path: impl Into<String>, max_cardinality: MaxCardinality, fhir_type: impl Into<String>) -> Self {
        let fhir_type = fhir_type.into();
        Self {
            path: path.into(),
            max_cardinality,
            type_path: fhir_type.clone(),
            fhir_type,
        }
    }

    /// Overrides the name used for child lookups.
    pub fn with_type_path(mut self, type_path: impl Into<String>) -> Self {
        self.type_path = type_path.into();
        self
    }

    pub fn is_repeating(&self) -> bool {
        self.max_cardinality.is_repeating()
    }

    /// The element's own name (last path segment).
    pub fn name(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or(&self.path)
    }
}
