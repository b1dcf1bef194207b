//! Command-line entrypoint for building and resetting an overlay.
//!
//! Connection settings always come from `LOWER_*` / `UPPER_*` environment
//! variables; flags only shape what a run does.

use anyhow::Result;
use clap::{Parser, Subcommand};
use pg_overlay::config::OVERLAY_ENV_PREFIX;
use pg_overlay::{reset_overlay, setup_overlay, ConnectionOptions, OverlayConfig};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pg-overlay", about = "Copy-on-write overlay over a PostgreSQL database")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or refresh the overlay (default).
    Setup(SetupArgs),
    /// Discard every change made through the overlay.
    Reset,
}

#[derive(clap::Args, Debug, Default)]
struct SetupArgs {
    /// Source schema to skip, in addition to the system schemas.
    #[arg(long = "exclude-schema", value_name = "SCHEMA")]
    exclude_schemas: Vec<String>,
    /// Print the table manifest as JSON on stdout.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pg_overlay=info,warn")),
        )
        .init();

    let args = Args::parse();
    match args.command.unwrap_or(Command::Setup(SetupArgs::default())) {
        Command::Setup(setup) => run_setup(setup).await,
        Command::Reset => reset_overlay(ConnectionOptions::from_env(OVERLAY_ENV_PREFIX)?).await,
    }
}

async fn run_setup(args: SetupArgs) -> Result<()> {
    let config = OverlayConfig::from_env()?.with_excluded_schemas(args.exclude_schemas);
    let report = setup_overlay(config).await?;
    for entry in report.read_only_tables() {
        warn!(
            schema = %entry.schema_name,
            table = %entry.table_name,
            "table has no primary key; overlay view is read-only"
        );
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
