use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use modmail_lib::config::Config;
use modmail_lib::legacy::MigrationSummary;
use modmail_lib::startup;

#[derive(Debug, Parser)]
#[command(name = "modmail", about = "Modmail legacy data migration", version)]
struct Cli {
    /// JSON config file; overrides defaults, overridden by MODMAIL_* env vars.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Report whether legacy data still has to be migrated.
    Status,
    /// Migrate legacy data if it has not been migrated yet.
    Migrate {
        /// Emit the migration summary as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    modmail_lib::init_logging();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Config::load(cli.config.as_deref()).context("load configuration")?;
    match cli.command.unwrap_or(Commands::Migrate { json: false }) {
        Commands::Status => status(&config).await,
        Commands::Migrate { json } => migrate(&config, json).await,
    }
}

async fn status(config: &Config) -> Result<i32> {
    let pending = startup::legacy_pending(config)
        .await
        .context("check migration gate")?;
    if pending {
        println!("Legacy migration pending.");
    } else {
        println!("Legacy migration not needed.");
    }
    Ok(0)
}

async fn migrate(config: &Config, emit_json: bool) -> Result<i32> {
    let summary = startup::run_startup_migration(config)
        .await
        .context("migrate legacy data")?;

    match summary {
        None => println!("Legacy migration not needed."),
        Some(summary) if emit_json => {
            let serialized =
                serde_json::to_string_pretty(&summary).context("serialize migration summary")?;
            println!("{serialized}");
        }
        Some(summary) => print_summary(&summary),
    }
    Ok(0)
}

fn print_summary(summary: &MigrationSummary) {
    println!(
        "{:<14} {:>9} {:>9} {:>9}",
        "category", "processed", "inserted", "skipped"
    );
    for report in &summary.categories {
        println!(
            "{:<14} {:>9} {:>9} {:>9}",
            report.category.as_str(),
            report.processed,
            report.inserted,
            report.skipped
        );
    }
    println!("Marker written to {}", summary.marker_path.display());
}
