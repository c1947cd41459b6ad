//! Compilation context shared by every node of one expression.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::engine::PreviewStage;
use crate::fhir_path::FhirPath;
use crate::terminology_client::TerminologyService;
use atrius_fhirpath_support::traits::ElementCatalog;

/// Produces column aliases that are unique within one compilation.
///
/// Aliases contain a `#`, which never appears in FHIR element names, so they
/// cannot collide with resource columns.
#[derive(Debug, Default)]
pub struct AliasGenerator {
    next: AtomicUsize,
}

impl AliasGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&self, prefix: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}#{}", prefix, n)
    }
}

/// Everything an expression needs while it is being compiled into a plan.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use atrius_fhir_path::catalog::StructureDefinitionCatalog;
/// use atrius_fhir_path::context::ParserContext;
/// use atrius_fhir_path::resource_reader::ResourceReader;
///
/// let patients = ResourceReader::new(4).read_resource_path(Vec::new(), "Patient").unwrap();
/// let context = ParserContext::new(patients, Arc::new(StructureDefinitionCatalog::new()))
///     .with_request_id("req-42");
/// assert_eq!(context.request_id(), "req-42");
/// ```
pub struct ParserContext {
    input_context: FhirPath,
    catalog: Arc<dyn ElementCatalog>,
    terminology_service: Option<Arc<dyn TerminologyService>>,
    request_id: String,
    aliases: AliasGenerator,
    membership_stages: Mutex<HashMap<(String, String), Arc<dyn PreviewStage>>>,
}

impl ParserContext {
    pub fn new(input_context: impl Into<FhirPath>, catalog: Arc<dyn ElementCatalog>) -> Self {
        Self {
            input_context: input_context.into(),
            catalog,
            terminology_service: None,
            request_id: format!("req-{}", chrono::Utc::now().timestamp_millis()),
            aliases: AliasGenerator::new(),
            membership_stages: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_terminology_service(mut self, service: Arc<dyn TerminologyService>) -> Self {
        self.terminology_service = Some(service);
        self
    }

    /// Sets the correlation id attached to log events.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// The context that bare identifiers are resolved against.
    pub fn input_context(&self) -> &FhirPath {
        &self.input_context
    }

    pub fn catalog(&self) -> &dyn ElementCatalog {
        self.catalog.as_ref()
    }

    pub fn terminology_service(&self) -> Option<&Arc<dyn TerminologyService>> {
        self.terminology_service.as_ref()
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn fresh_alias(&self, prefix: &str) -> String {
        self.aliases.fresh(prefix)
    }

    /// Returns the membership stage for `(input_expression, value_set)`, building
    /// it with `build` on first use. Repeated checks of the same input against the
    /// same value set therefore share a single preview.
    pub fn membership_stage<F>(
        &self,
        input_expression: &str,
        value_set: &str,
        build: F,
    ) -> Arc<dyn PreviewStage>
    where
        F: FnOnce() -> Arc<dyn PreviewStage>,
    {
        self.membership_stages
            .lock()
            .entry((input_expression.to_string(), value_set.to_string()))
            .or_insert_with(build)
            .clone()
    }
}

impl fmt::Debug for ParserContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserContext")
            .field("input_context", &self.input_context.expression())
            .field("request_id", &self.request_id)
            .field("terminology", &self.terminology_service.is_some())
            .finish()
    }
}
