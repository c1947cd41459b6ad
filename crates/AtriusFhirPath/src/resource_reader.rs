//! Loading FHIR resources into partitioned datasets.

use std::io::BufRead;

use serde_json::Value;
use tracing::{debug, warn};

use crate::dataset::{Dataset, Partition, Row};
use crate::error::{FhirPathError, FhirPathResult};
use crate::fhir_path::ResourcePath;

/// Column holding the record id in datasets built by [`ResourceReader`].
pub const ID_COLUMN: &str = "id";

/// Builds a resource dataset from JSON resources of a single type.
///
/// Each top-level element of a resource becomes a column. Resources without an
/// `id` receive a synthesised one of the form `<type>/<ordinal>`, where the
/// ordinal counts resources of that type in input order. Rows are dealt
/// round-robin into the configured number of partitions.
#[derive(Debug, Clone)]
pub struct ResourceReader {
    partitions: usize,
}

impl Default for ResourceReader {
    fn default() -> Self {
        Self { partitions: 1 }
    }
}

impl ResourceReader {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Builds the dataset for `resource_type` from already parsed resources.
    /// Resources of other types are skipped.
    pub fn read<I>(&self, resources: I, resource_type: &str) -> FhirPathResult<Dataset>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut partitions: Vec<Partition> = vec![Vec::new(); self.partitions];
        let mut ordinal = 0usize;
        let mut skipped = 0usize;
        for resource in resources {
            let Value::Object(object) = resource else {
                return Err(FhirPathError::InvalidInput(
                    "Resources must be JSON objects".to_string(),
                ));
            };
            if object.get("resourceType").and_then(Value::as_str) != Some(resource_type) {
                skipped += 1;
                continue;
            }
            let mut row: Row = object;
            row.remove("resourceType");
            let has_id = row.get(ID_COLUMN).is_some_and(|id| !id.is_null());
            if !has_id {
                row.insert(
                    ID_COLUMN.to_string(),
                    Value::String(format!("{}/{}", resource_type, ordinal)),
                );
            }
            partitions[ordinal % self.partitions].push(row);
            ordinal += 1;
        }
        if skipped > 0 {
            debug!("Skipped {} resources that are not {}", skipped, resource_type);
        }
        debug!(
            "Read {} {} resources into {} partitions",
            ordinal, resource_type, self.partitions
        );
        Ok(Dataset::from_partitions(partitions))
    }

    /// Reads newline-delimited JSON. Blank lines are ignored.
    pub fn read_ndjson<R: BufRead>(&self, reader: R, resource_type: &str) -> FhirPathResult<Dataset> {
        let mut resources = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(trimmed).map_err(|e| {
                warn!("Malformed NDJSON on line {}: {}", number + 1, e);
                FhirPathError::InvalidInput(format!("line {}: {}", number + 1, e))
            })?;
            resources.push(value);
        }
        self.read(resources, resource_type)
    }

    /// Reads resources and wraps them in a root [`ResourcePath`].
    pub fn read_resource_path<I>(&self, resources: I, resource_type: &str) -> FhirPathResult<ResourcePath>
    where
        I: IntoIterator<Item = Value>,
    {
        let dataset = self.read(resources, resource_type)?;
        Ok(ResourcePath::build(dataset, resource_type, ID_COLUMN))
    }
}
