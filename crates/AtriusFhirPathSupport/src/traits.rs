use crate::type_info::ElementDefinition;

/// Resolves path segments against structure definitions.
///
/// `parent_type` is either a resource or data type name (`Patient`, `HumanName`)
/// or, for backbone elements, the full element path (`Patient.contact`). See
/// [`ElementDefinition::type_path`].
pub trait ElementCatalog: Send + Sync {
    /// Looks up the child `segment` of `parent_type`.
    fn lookup(&self, parent_type: &str, segment: &str) -> Option<ElementDefinition>;
}
