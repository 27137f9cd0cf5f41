use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cohort_prep::pipeline::{self, PipelineConfig};

/// Match, resample and normalize a per-patient imaging cohort.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the JSON run configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Resolve the cohort and write metadata without processing any images
    #[arg(long)]
    match_only: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = PipelineConfig::from_json_file(&args.config)
        .with_context(|| format!("loading configuration {}", args.config.display()))?;

    let registry = if args.match_only {
        let registry = pipeline::resolve_cohort(&config)?;
        pipeline::write_metadata(&registry, &config.out_metadata)?;
        registry
    } else {
        pipeline::run(&config)?
    };

    println!(
        "{} subjects written to {}",
        registry.len(),
        config.out_metadata.display()
    );
    Ok(())
}
