//! # FHIRPath Query CLI
//!
//! Compiles a FHIRPath expression into a columnar plan, runs it over a file of
//! resources and prints one JSON object per result row.
//!
//! ## Command Line Options
//!
//! ```text
//! -e, --expression <EXPRESSION>            FHIRPath expression to evaluate
//! -t, --resource-type <TYPE>               Resource type of the input context
//! -r, --resources <FILE>                   NDJSON resources ('-' for stdin)
//! -d, --definitions <FILE>                 StructureDefinition JSON (repeatable)
//!     --terminology-server <URL>           Terminology server base URL
//!     --terminology-timeout <SECONDS>      Per-request timeout
//!     --terminology-retries <N>            Retries for transient failures [default: 0]
//!     --partitions <N>                     Number of dataset partitions [default: 4]
//!     --request-id <ID>                    Correlation id for log events
//!     --log-level <LEVEL>                  Log filter when RUST_LOG is unset [default: info]
//! -o, --output <FILE>                      Output file (defaults to stdout)
//! ```
//!
//! Every option that configures the environment can also be set through an
//! `ATRIUS_*` environment variable.
//!
//! ## Output
//!
//! Each line is `{"eid": ..., "id": ..., "value": ...}`. Rows are sorted by record
//! id and then element id. `eid` is null for singular results.
//!
//! ## Usage Examples
//!
//! ```bash
//! fhirpath-query -t Patient -r patients.ndjson -d profiles-resources.json \
//!     -e "name.given"
//!
//! fhirpath-query -t Observation -r observations.ndjson -d profiles.json \
//!     --terminology-server https://tx.fhir.org/r4 \
//!     -e "code.memberOf('http://hl7.org/fhir/ValueSet/observation-vitalsignresult')"
//! ```

use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::catalog::StructureDefinitionCatalog;
use crate::context::ParserContext;
use crate::dataset::Row;
use crate::engine::LocalEngine;
use crate::error::{FhirPathError, FhirPathResult};
use crate::evaluator::compile_expression;
use crate::fhir_path::ResourcePath;
use crate::resource_reader::{ID_COLUMN, ResourceReader};
use crate::terminology_client::TerminologyClient;

#[derive(Parser, Debug)]
#[command(name = "fhirpath-query")]
#[command(about = "Evaluate a FHIRPath expression over a file of FHIR resources")]
#[command(
    long_about = "Compile a FHIRPath expression into a columnar plan and execute it over NDJSON resources, with terminology-backed memberOf support"
)]
pub struct Args {
    /// FHIRPath expression to evaluate
    #[arg(short, long)]
    pub expression: String,

    /// Resource type of the input context (e.g. Patient)
    #[arg(short = 't', long)]
    pub resource_type: String,

    /// NDJSON file of resources (use '-' for stdin)
    #[arg(short, long)]
    pub resources: PathBuf,

    /// StructureDefinition JSON file (resource, Bundle or array)
    #[arg(short, long, required = true)]
    pub definitions: Vec<PathBuf>,

    /// Terminology server base URL
    #[arg(long, env = "ATRIUS_TERMINOLOGY_SERVER")]
    pub terminology_server: Option<String>,

    /// Terminology request timeout in seconds
    #[arg(long, env = "ATRIUS_TERMINOLOGY_TIMEOUT")]
    pub terminology_timeout: Option<u64>,

    /// Number of retries for transient terminology failures
    #[arg(long, env = "ATRIUS_TERMINOLOGY_RETRIES", default_value_t = 0)]
    pub terminology_retries: u32,

    /// Number of partitions the resources are spread over
    #[arg(long, env = "ATRIUS_PARTITIONS", default_value_t = 4)]
    pub partitions: usize,

    /// Correlation id attached to log events
    #[arg(long)]
    pub request_id: Option<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "ATRIUS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output file path (defaults to stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Installs the stderr log subscriber. `RUST_LOG` takes precedence over `log_level`.
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    // A subscriber may already be installed (tests, embedding applications).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Main CLI execution function
pub fn run_cli(args: Args) -> FhirPathResult<()> {
    let rows = execute(&args)?;
    let mut output = String::new();
    for row in rows {
        output.push_str(&serde_json::to_string(&Value::Object(row))?);
        output.push('\n');
    }
    write_output(&args.output, &output)
}

/// Compiles and runs the query described by `args`, returning sorted result rows.
pub fn execute(args: &Args) -> FhirPathResult<Vec<Row>> {
    if args.partitions == 0 {
        return Err(FhirPathError::ConfigError(
            "--partitions must be at least 1".to_string(),
        ));
    }

    let mut catalog = StructureDefinitionCatalog::new();
    for path in &args.definitions {
        let definitions: Value = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        catalog.load(&definitions)?;
    }
    info!("Loaded {} element definitions", catalog.len());

    let reader = ResourceReader::new(args.partitions);
    let dataset = if args.resources.to_str() == Some("-") {
        reader.read_ndjson(io::stdin().lock(), &args.resource_type)?
    } else {
        reader.read_ndjson(open_input(&args.resources)?, &args.resource_type)?
    };
    let input_context = ResourcePath::build(dataset, &args.resource_type, ID_COLUMN);

    let mut context = ParserContext::new(input_context.clone(), Arc::new(catalog));
    if let Some(request_id) = &args.request_id {
        context = context.with_request_id(request_id.clone());
    }
    if let Some(server) = &args.terminology_server {
        let mut client = TerminologyClient::new(server.clone()).with_retries(args.terminology_retries);
        if let Some(seconds) = args.terminology_timeout {
            client = client.with_timeout(Duration::from_secs(seconds));
        }
        context = context.with_terminology_service(Arc::new(client));
    }

    let compiled = compile_expression(&args.expression, &context)?;
    info!(
        request_id = context.request_id(),
        "Compiled {} (singular: {})",
        compiled.expression(),
        compiled.is_singular()
    );

    let mut rows = LocalEngine::new().collect(&compiled.result_dataset(&input_context))?;
    rows.sort_by(compare_rows);
    Ok(rows)
}

fn open_input(path: &Path) -> FhirPathResult<impl BufRead> {
    Ok(BufReader::new(File::open(path)?))
}

fn compare_rows(left: &Row, right: &Row) -> Ordering {
    let id = |row: &Row| row.get("id").map(value_key).unwrap_or_default();
    id(left)
        .cmp(&id(right))
        .then_with(|| eid_key(left.get("eid")).cmp(&eid_key(right.get("eid"))))
}

fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn eid_key(eid: Option<&Value>) -> Option<Vec<u64>> {
    eid.and_then(Value::as_array)
        .map(|indices| indices.iter().filter_map(Value::as_u64).collect())
}

/// Write output to file or stdout
fn write_output(path: &Option<PathBuf>, content: &str) -> FhirPathResult<()> {
    match path {
        Some(p) => {
            fs::write(p, content)?;
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle.write_all(content.as_bytes())?;
        }
    }
    Ok(())
}
