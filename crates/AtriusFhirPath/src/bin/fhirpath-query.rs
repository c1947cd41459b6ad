//! FHIRPath query executable
//!
//! Compiles a FHIRPath expression into a columnar plan and runs it over a file
//! of FHIR resources, writing one NDJSON row per result.
//!
//! See the cli module documentation for detailed usage information.

use clap::Parser;
use atrius_fhir_path::cli::{Args, init_tracing, run_cli};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(&args.log_level);
    run_cli(args)?;
    Ok(())
}
