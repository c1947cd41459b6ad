//! Terminology client for FHIR terminology server operations.
//!
//! The membership check talks to a terminology server through the
//! [`TerminologyService`] trait. It needs exactly two operations:
//!
//! 1. **Code system discovery**: `GET /CodeSystem?url=...` tells whether the server
//!    knows a code system at all. Systems the server does not know are left out of
//!    the expansion request.
//! 2. **Expansion**: `POST /ValueSet/$expand` with an inline, composite ValueSet
//!    that intersects the target value set with the codes observed in the data.
//!
//! ## Sync vs async
//!
//! [`TerminologyClient`] is built on async `reqwest`. Plan execution is synchronous
//! and runs on rayon threads, so the [`TerminologyService`] implementation drives
//! the async client to completion:
//! - outside a Tokio runtime it uses a process-wide runtime
//! - inside a multi-threaded runtime it uses `tokio::task::block_in_place` +
//!   `Handle::block_on` to avoid blocking reactor threads
//! - inside a current-thread runtime, where `block_in_place` is not allowed, it
//!   hands the future to the process-wide runtime on a scoped thread
//!
//! ## Retries
//!
//! Network failures and 5xx responses are retried up to the configured number of
//! times with exponential backoff. Everything else fails immediately.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde_json::{Value, json};
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tracing::{debug, warn};

use crate::error::{FhirPathError, FhirPathResult};
use atrius_fhirpath_support::coding::Coding;
use atrius_fhirpath_support::evaluation_error::EvaluationResult;

lazy_static::lazy_static! {
    /// Runtime used to drive the async client from synchronous code
    static ref RUNTIME: Runtime = Runtime::new().expect("Failed to create tokio runtime");
}

/// Runs `future` to completion from synchronous code.
fn block_on<F>(future: F) -> F::Output
where
    F: Future + Send,
    F::Output: Send,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(move || handle.block_on(future))
        }
        Ok(_) => std::thread::scope(|scope| {
            scope
                .spawn(|| RUNTIME.block_on(future))
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
        }),
        Err(_) => RUNTIME.block_on(future),
    }
}

/// The terminology operations the membership check depends on.
///
/// Implementations must be callable from several threads; calls are synchronous.
pub trait TerminologyService: Send + Sync {
    /// Searches for code systems with the given canonical URL. An empty result
    /// means the server does not know the system.
    fn search_code_systems(&self, system_uri: &str) -> EvaluationResult<Vec<Value>>;

    /// Expands `value_set`, returning at most `count` codings.
    fn expand(&self, value_set: &CompositeValueSet, count: usize) -> EvaluationResult<Vec<Coding>>;
}

/// One `compose.include` block of a [`CompositeValueSet`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ComposeInclude {
    pub system: String,
    pub version: Option<String>,
    pub codes: BTreeSet<String>,
}

/// An inline ValueSet that restricts a target value set to explicit codes.
///
/// Each include is scoped to the target value set, so the expansion contains only
/// those listed codes that are also members of the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeValueSet {
    pub value_set_uri: String,
    pub includes: Vec<ComposeInclude>,
}

impl CompositeValueSet {
    /// Creates the composite. Includes are ordered by system and version.
    pub fn new(value_set_uri: impl Into<String>, mut includes: Vec<ComposeInclude>) -> Self {
        includes.sort();
        Self {
            value_set_uri: value_set_uri.into(),
            includes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty()
    }

    /// Total number of codes across all includes.
    pub fn concept_count(&self) -> usize {
        self.includes.iter().map(|include| include.codes.len()).sum()
    }

    /// Renders the composite as a FHIR `ValueSet` resource.
    pub fn to_resource(&self) -> Value {
        let includes: Vec<Value> = self
            .includes
            .iter()
            .map(|include| {
                let mut block = json!({
                    "valueSet": [self.value_set_uri],
                    "system": include.system,
                    "concept": include
                        .codes
                        .iter()
                        .map(|code| json!({ "code": code }))
                        .collect::<Vec<_>>(),
                });
                if let Some(version) = &include.version {
                    block["version"] = json!(version);
                }
                block
            })
            .collect();
        json!({
            "resourceType": "ValueSet",
            "status": "active",
            "compose": { "include": includes },
        })
    }
}

/// Collects the codings of an expanded ValueSet, descending into nested `contains`.
///
/// Entries without both a system and a code (abstract groupers) are skipped.
pub fn parse_expansion(value_set: &Value) -> FhirPathResult<Vec<Coding>> {
    let expansion = value_set.get("expansion").ok_or_else(|| {
        FhirPathError::ParseError("ValueSet expansion missing from response".to_string())
    })?;
    let mut codings = Vec::new();
    collect_contains(expansion, &mut codings);
    Ok(codings)
}

fn collect_contains(node: &Value, codings: &mut Vec<Coding>) {
    let Some(contains) = node.get("contains").and_then(Value::as_array) else {
        return;
    };
    for entry in contains {
        if let Some(coding) = Coding::from_json(entry).filter(Coding::is_defined) {
            codings.push(coding);
        }
        collect_contains(entry, codings);
    }
}

/// HTTP client for interacting with a FHIR terminology server.
///
/// - uses `reqwest::Client` for connection pooling
/// - keeps only a normalized `base_url` (no trailing slash)
#[derive(Debug, Clone)]
pub struct TerminologyClient {
    client: Client,
    base_url: String,
    timeout: Option<Duration>,
    retries: u32,
}

impl TerminologyClient {
    /// Create a new `TerminologyClient`.
    ///
    /// `base_url` is normalized by trimming any trailing `/`.
    ///
    /// Example base URLs:
    /// - `http://localhost:8080/fhir`
    /// - `https://tx.fhir.org/r4`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    /// Creates a new terminology client with custom HTTP client
    ///
    /// # Arguments
    ///
    /// * `client` - Custom reqwest client (for authentication, proxies, etc.)
    /// * `base_url` - The base URL of the terminology server
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: None,
            retries: 0,
        }
    }

    /// Per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of times a transient failure is retried.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Search code systems by canonical URL using `GET /CodeSystem?url=...`.
    ///
    /// Returns the entries of the search Bundle.
    pub async fn search_code_systems(&self, system_uri: &str) -> FhirPathResult<Vec<Value>> {
        let url = format!("{}/CodeSystem", self.base_url);
        let bundle = self
            .send("CodeSystem search", || {
                self.client
                    .get(&url)
                    .query(&[("url", system_uri), ("_elements", "id")])
            })
            .await?;
        Ok(bundle
            .get("entry")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Expand an inline ValueSet using `POST /ValueSet/$expand`.
    pub async fn expand_value_set(
        &self,
        value_set: &CompositeValueSet,
        count: usize,
    ) -> FhirPathResult<Vec<Coding>> {
        let url = format!("{}/ValueSet/$expand", self.base_url);
        let body = json!({
            "resourceType": "Parameters",
            "parameter": [
                { "name": "valueSet", "resource": value_set.to_resource() },
                { "name": "count", "valueInteger": count },
            ]
        });
        let expanded = self
            .send("ValueSet expansion", || {
                self.client
                    .post(&url)
                    .json(&body)
                    .header("Content-Type", "application/fhir+json")
            })
            .await?;
        parse_expansion(&expanded)
    }

    async fn send<F>(&self, operation: &str, request: F) -> FhirPathResult<Value>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            match self.send_once(operation, request()).await {
                Err(err) if err.is_transient() && attempt < self.retries => {
                    let delay = Duration::from_millis(100u64 << attempt.min(10));
                    warn!(
                        "{} failed (attempt {} of {}), retrying in {:?}: {}",
                        operation,
                        attempt + 1,
                        self.retries + 1,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn send_once(&self, operation: &str, request: RequestBuilder) -> FhirPathResult<Value> {
        let request = match self.timeout {
            Some(timeout) => request.timeout(timeout),
            None => request,
        };
        let response = request
            .header("Accept", "application/fhir+json")
            .send()
            .await
            .map_err(|e| FhirPathError::NetworkError(e.to_string()))?;

        let status = response.status();
        debug!("{} returned {}", operation, status);
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| FhirPathError::ParseError(e.to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(FhirPathError::HttpError(
                status.as_u16(),
                format!("{} failed: {}", operation, body),
            ))
        }
    }
}

impl TerminologyService for TerminologyClient {
    fn search_code_systems(&self, system_uri: &str) -> EvaluationResult<Vec<Value>> {
        Ok(block_on(TerminologyClient::search_code_systems(self, system_uri))?)
    }

    fn expand(&self, value_set: &CompositeValueSet, count: usize) -> EvaluationResult<Vec<Coding>> {
        Ok(block_on(self.expand_value_set(value_set, count))?)
    }
}
