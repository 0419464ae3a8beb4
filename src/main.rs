use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use runledger::config::{EnvResolver, LoggingConfig, RecorderConfig, Settings};

#[derive(Parser)]
#[command(
    name = "runledger",
    about = "Records end-to-end test runs into PostgreSQL and uploads failure artifacts to S3",
    version,
    long_about = None
)]
struct Cli {
    /// TOML config file (defaults to $RUNLEDGER_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record hook events (one JSON object per line) for this shard
    Record {
        /// Read events from this file instead of stdin
        #[arg(long)]
        events: Option<PathBuf>,

        /// Record into memory and print what would have been written
        #[arg(long)]
        dry_run: bool,
    },

    /// Create the bookkeeping tables if they do not exist
    Migrate,

    /// Verify that every required environment variable is set
    CheckEnv,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (cfg, config_source) = RecorderConfig::load_or_default(cli.config.as_deref())?;
    init_tracing(&cfg.logging);
    match &config_source {
        Some(path) => tracing::info!(path = %path.display(), "loaded recorder configuration"),
        None => tracing::debug!("no config file given, using compiled-in defaults"),
    }

    let env = EnvResolver::from_process();

    match cli.command {
        Commands::Record { events, dry_run } => {
            if dry_run {
                tracing::info!(?events, "Starting dry run");
                let report = runledger::record_dry_run(&env, &cfg, events.as_deref()).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                tracing::info!(?events, "Starting run recorder");
                runledger::record(&env, &cfg, events.as_deref()).await?;
            }
        }
        Commands::Migrate => {
            tracing::info!("Applying run database schema");
            runledger::migrate(&env, &cfg).await?;
            println!("Schema is up to date.");
        }
        Commands::CheckEnv => {
            let settings = Settings::resolve(&env, &cfg)?;
            let id = &settings.identity;
            println!("\n=== runledger environment ===");
            println!("{:<12} : {}", "Workflow", id.workflow_id);
            println!("{:<12} : {}", "Attempt", id.attempt);
            println!("{:<12} : {}", "Shard", id.matrix_id);
            println!("{:<12} : {}", "Repository", id.repo);
            println!("{:<12} : {}", "Branch", id.branch);
            println!("{:<12} : {}", "Database", settings.database.host);
            println!("{:<12} : {}", "Bucket", cfg.artifacts.bucket);
            println!("All required variables are set.\n");
        }
    }

    Ok(())
}

/// Logs go to stderr so stdout stays free for reports.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
