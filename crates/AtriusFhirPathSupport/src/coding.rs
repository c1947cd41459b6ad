//! # Codings and Code System References
//!
//! A [`Coding`] is the minimal `(system, code, version)` triple that identifies one
//! coded value. Codings are hashed structurally so that sets of them deduplicate
//! exactly, while [`Coding::matches`] implements the looser FHIR matching rule in
//! which a missing version on either side makes the comparison version-agnostic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A coded value drawn from a code system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Coding {
    /// Creates a coding without a version.
    pub fn new(system: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            code: Some(code.into()),
            version: None,
        }
    }

    /// Creates a coding pinned to a code system version.
    pub fn versioned(
        system: impl Into<String>,
        code: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            system: Some(system.into()),
            code: Some(code.into()),
            version: Some(version.into()),
        }
    }

    /// A coding is defined when both its system and code are present.
    pub fn is_defined(&self) -> bool {
        self.system.is_some() && self.code.is_some()
    }

    /// Tests whether two codings denote the same concept.
    ///
    /// Systems and codes must be equal. Versions are compared only when both
    /// sides carry one.
    pub fn matches(&self, other: &Coding) -> bool {
        if self.system != other.system || self.code != other.code {
            return false;
        }
        match (&self.version, &other.version) {
            (Some(left), Some(right)) => left == right,
            _ => true,
        }
    }

    /// Reads a coding from a FHIR `Coding` JSON object.
    ///
    /// Returns `None` for anything that is not an object. Non-string members are
    /// treated as absent.
    pub fn from_json(value: &Value) -> Option<Coding> {
        let object = value.as_object()?;
        let text = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);
        Some(Coding {
            system: text("system"),
            code: text("code"),
            version: text("version"),
        })
    }

    /// Renders the coding as a FHIR `Coding` JSON object.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        if let Some(system) = &self.system {
            object.insert("system".to_string(), Value::String(system.clone()));
        }
        if let Some(version) = &self.version {
            object.insert("version".to_string(), Value::String(version.clone()));
        }
        if let Some(code) = &self.code {
            object.insert("code".to_string(), Value::String(code.clone()));
        }
        Value::Object(object)
    }

    /// The code system reference this coding belongs to.
    pub fn code_system(&self) -> CodeSystemReference {
        CodeSystemReference {
            system: self.system.clone(),
            version: self.version.clone(),
        }
    }
}

/// A `(system, version)` pair used to group codings by code system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeSystemReference {
    pub system: Option<String>,
    pub version: Option<String>,
}

impl CodeSystemReference {
    /// Tests whether `coding` belongs to this code system.
    ///
    /// Both sides need a system. The version is only compared when both sides
    /// specify one.
    pub fn matches_coding(&self, coding: &Coding) -> bool {
        let (Some(system), Some(coding_system)) = (&self.system, &coding.system) else {
            return false;
        };
        if system != coding_system {
            return false;
        }
        match (&self.version, &coding.version) {
            (Some(version), Some(coding_version)) => version == coding_version,
            _ => true,
        }
    }
}
