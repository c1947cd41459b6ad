//! # `memberOf`
//!
//! Tests coded values for membership in a value set defined by a terminology
//! server, with a fixed number of server round trips per query rather than one
//! per row.
//!
//! The check runs as a preview-then-map stage (see [`crate::engine`]):
//!
//! 1. **Preview.** Every partition collects its distinct, defined codings. The
//!    partial sets are merged into one set for the whole dataset.
//! 2. **Discovery.** Each distinct code system in that set is looked up on the
//!    server once. Systems the server does not know are dropped.
//! 3. **Composite.** One `include` per surviving `(system, version)` lists the
//!    observed codes and is scoped to the target value set.
//! 4. **Expansion.** The composite is expanded in a single request. The result is
//!    the [`MembershipSet`]. With no includes the request is skipped and the set
//!    is empty.
//! 5. **Per row.** A row is a member when any of its codings matches a coding of
//!    the set. A row without codings yields null.
//!
//! Steps 2 to 4 run exactly once per stage. A server failure in any of them fails
//! the whole query.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, info_span};

use crate::context::ParserContext;
use crate::dataset::col;
use crate::engine::{MemoizedStage, PreviewMapper, PreviewStage};
use crate::fhir_path::{ElementPath, FhirPath, LiteralPath};
use crate::terminology_client::{ComposeInclude, CompositeValueSet, TerminologyService};
use atrius_fhirpath_support::coding::{CodeSystemReference, Coding};
use atrius_fhirpath_support::evaluation_error::{EvaluationError, EvaluationResult};

/// The codings of a value set that were found among the input codings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSet {
    // (system, code) -> members, distinct by version
    codings: HashMap<(String, String), Vec<Coding>>,
}

impl MembershipSet {
    pub fn from_codings<I: IntoIterator<Item = Coding>>(codings: I) -> Self {
        let mut set = Self::default();
        for coding in codings {
            let (Some(system), Some(code)) = (&coding.system, &coding.code) else {
                continue;
            };
            let members = set.codings.entry((system.clone(), code.clone())).or_default();
            if !members.contains(&coding) {
                members.push(coding);
            }
        }
        set
    }

    /// Tests whether `coding` matches any member. See [`Coding::matches`].
    pub fn contains(&self, coding: &Coding) -> bool {
        let (Some(system), Some(code)) = (&coding.system, &coding.code) else {
            return false;
        };
        self.codings
            .get(&(system.clone(), code.clone()))
            .is_some_and(|members| members.iter().any(|member| member.matches(coding)))
    }

    pub fn len(&self) -> usize {
        self.codings.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.codings.is_empty()
    }
}

/// Resolves which of `codings` are members of `value_set_uri`.
///
/// Performs one code system search per distinct system and at most one
/// expansion.
pub fn derive_membership_set(
    codings: &HashSet<Coding>,
    service: &dyn TerminologyService,
    value_set_uri: &str,
) -> EvaluationResult<MembershipSet> {
    let defined: Vec<&Coding> = codings.iter().filter(|coding| coding.is_defined()).collect();
    let references: BTreeSet<CodeSystemReference> = defined
        .iter()
        .map(|coding| coding.code_system())
        .filter(|reference| reference.system.is_some())
        .collect();
    let systems: BTreeSet<&str> = references
        .iter()
        .filter_map(|reference| reference.system.as_deref())
        .collect();

    let mut known = HashSet::new();
    for system in systems {
        if service.search_code_systems(system)?.is_empty() {
            debug!("Code system {} is not known to the terminology service", system);
        } else {
            known.insert(system);
        }
    }

    let mut includes = Vec::new();
    for reference in &references {
        let Some(system) = reference.system.as_deref().filter(|s| known.contains(s)) else {
            continue;
        };
        let codes: BTreeSet<String> = defined
            .iter()
            .filter(|coding| reference.matches_coding(coding))
            .filter_map(|coding| coding.code.clone())
            .collect();
        if !codes.is_empty() {
            includes.push(ComposeInclude {
                system: system.to_string(),
                version: reference.version.clone(),
                codes,
            });
        }
    }

    if includes.is_empty() {
        debug!("No codings to intersect with {}", value_set_uri);
        return Ok(MembershipSet::default());
    }

    info!(
        "Intersecting {} concepts with {} using terminology service",
        defined.len(),
        value_set_uri
    );
    let composite = CompositeValueSet::new(value_set_uri, includes);
    let expansion = service.expand(&composite, defined.len())?;
    Ok(MembershipSet::from_codings(expansion))
}

/// Row-level membership. `None` when the row has no coding list.
pub fn is_member(codings: Option<&[Coding]>, set: &MembershipSet) -> Option<bool> {
    codings.map(|codings| codings.iter().any(|coding| set.contains(coding)))
}

/// Reads the coding list of one row. Null means the list is undefined.
fn codings_from_value(value: &Value) -> Option<Vec<Coding>> {
    match value {
        Value::Null => None,
        Value::Array(items) => Some(items.iter().filter_map(Coding::from_json).collect()),
        other => Some(Coding::from_json(other).into_iter().collect()),
    }
}

/// Wires [`derive_membership_set`] and [`is_member`] into a preview stage.
pub struct MemberOfMapper {
    request_id: String,
    value_set_uri: String,
    service: Arc<dyn TerminologyService>,
}

impl MemberOfMapper {
    pub fn new(
        request_id: impl Into<String>,
        value_set_uri: impl Into<String>,
        service: Arc<dyn TerminologyService>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            value_set_uri: value_set_uri.into(),
            service,
        }
    }
}

impl fmt::Debug for MemberOfMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberOfMapper")
            .field("request_id", &self.request_id)
            .field("value_set_uri", &self.value_set_uri)
            .finish()
    }
}

impl PreviewMapper for MemberOfMapper {
    type Partial = HashSet<Coding>;
    type State = MembershipSet;

    fn preview_partition(&self, values: &[Value]) -> HashSet<Coding> {
        values
            .iter()
            .filter_map(codings_from_value)
            .flatten()
            .filter(Coding::is_defined)
            .collect()
    }

    fn merge(&self, left: HashSet<Coding>, right: HashSet<Coding>) -> HashSet<Coding> {
        let (mut larger, smaller) = if left.len() >= right.len() {
            (left, right)
        } else {
            (right, left)
        };
        larger.extend(smaller);
        larger
    }

    fn finish(&self, codings: HashSet<Coding>) -> EvaluationResult<MembershipSet> {
        let span = info_span!(
            "member_of",
            request_id = %self.request_id,
            value_set = %self.value_set_uri
        );
        let _guard = span.enter();
        derive_membership_set(&codings, self.service.as_ref(), &self.value_set_uri)
    }

    fn call(&self, state: &MembershipSet, value: &Value) -> Value {
        match is_member(codings_from_value(value).as_deref(), state) {
            Some(member) => Value::Bool(member),
            None => Value::Null,
        }
    }
}

/// `memberOf(url)` over a `Coding` or `CodeableConcept` input.
pub fn member_of(
    context: &ParserContext,
    input: FhirPath,
    arguments: Vec<FhirPath>,
) -> EvaluationResult<FhirPath> {
    let service = context.terminology_service().cloned().ok_or_else(|| {
        EvaluationError::InvalidOperation(
            "memberOf function requires a terminology service".to_string(),
        )
    })?;
    let [argument] = arguments.as_slice() else {
        return Err(EvaluationError::InvalidArgument(format!(
            "memberOf function accepts one argument, got {}",
            arguments.len()
        )));
    };
    let value_set_uri = argument
        .as_literal()
        .and_then(LiteralPath::as_str)
        .ok_or_else(|| {
            EvaluationError::InvalidArgument(format!(
                "memberOf function accepts a string literal argument: {}",
                argument.expression()
            ))
        })?;

    let element = match &input {
        FhirPath::Element(element) => element,
        _ => return Err(invalid_input(&input)),
    };
    let codings = match element.fhir_type.as_deref() {
        Some("Coding") => element.value_column.clone().array(),
        Some("CodeableConcept") => element.value_column.clone().field("coding"),
        _ => return Err(invalid_input(&input)),
    };

    let stage = context.membership_stage(&element.expression, value_set_uri, || -> Arc<dyn PreviewStage> {
        Arc::new(MemoizedStage::new(MemberOfMapper::new(
            context.request_id(),
            value_set_uri,
            service,
        )))
    });
    let alias = context.fresh_alias("memberOf");
    Ok(FhirPath::Element(ElementPath {
        expression: format!("{}.memberOf({})", element.expression, argument.expression()),
        dataset: element.dataset.map_with_preview(codings, alias.clone(), stage),
        id_column: element.id_column.clone(),
        eid_column: element.eid_column.clone(),
        value_column: col(alias),
        singular: element.singular,
        definition: None,
        fhir_type: Some("boolean".to_string()),
    }))
}

fn invalid_input(input: &FhirPath) -> EvaluationError {
    EvaluationError::InvalidOperation(format!(
        "Input to memberOf function must be Coding or CodeableConcept: {}",
        input.expression()
    ))
}
