//! credtech CLI: one command per pipeline stage, a full run, and status.
//!
//! Commands:
//! - `extract`: discover and read raw files, record fingerprints
//! - `bronze-to-silver`: canonicalize raw units into the Silver layer
//! - `silver-to-gold`: aggregate per month / indicator and consolidate
//! - `gold-to-db`: upsert Gold rollups into the relational store
//! - `run`: all four stages in order
//! - `status`: ledger state per unit and stored row counts

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use credtech_core::domain::{Family, ReferenceMonth};
use credtech_runner::{logging, Orchestrator, PipelineConfig, RunSummary, UnitFilter, UnitState};

#[derive(Parser)]
#[command(
    name = "credtech",
    about = "credtech: SCR credit and SGS indicator pipeline (bronze → silver → gold → db)"
)]
struct Cli {
    /// Path to a TOML config file. Defaults to ./credtech.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging (RUST_LOG still takes precedence).
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover raw files and record their content fingerprints.
    Extract(Scope),
    /// Canonicalize raw units into the Silver layer.
    BronzeToSilver(Scope),
    /// Aggregate Silver into Gold and consolidate indicators.
    SilverToGold(Scope),
    /// Load Gold rollups into the relational store.
    GoldToDb(Scope),
    /// Run every stage in order.
    Run(Scope),
    /// Report unit states and stored row counts.
    Status(Scope),
}

#[derive(Args)]
struct Scope {
    /// Restrict to one family: credit (scr) or indicator (sgs).
    family: Option<Family>,

    /// Reference month for credit units (YYYYMM or YYYY-MM).
    #[arg(long)]
    period: Option<ReferenceMonth>,

    /// Source prefix, e.g. scr, planilha, sgs.
    #[arg(long)]
    source: Option<String>,
}

impl Scope {
    fn filter(&self) -> UnitFilter {
        UnitFilter {
            family: self.family,
            period: self.period,
            source: self.source.clone(),
        }
    }
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Extract(_) => "extract",
            Commands::BronzeToSilver(_) => "bronze-to-silver",
            Commands::SilverToGold(_) => "silver-to-gold",
            Commands::GoldToDb(_) => "gold-to-db",
            Commands::Run(_) => "run",
            Commands::Status(_) => "status",
        }
    }

    fn scope(&self) -> &Scope {
        match self {
            Commands::Extract(s)
            | Commands::BronzeToSilver(s)
            | Commands::SilverToGold(s)
            | Commands::GoldToDb(s)
            | Commands::Run(s)
            | Commands::Status(s) => s,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let guard = logging::init(&config.paths.log_dir, cli.command.name(), cli.verbose)
        .context("initializing logging")?;

    let succeeded = execute(&cli.command, config)?;

    // flush the file log before exiting
    drop(guard);
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

/// Run one command; false when any unit in scope ended failed.
fn execute(command: &Commands, config: PipelineConfig) -> Result<bool> {
    let orchestrator = Orchestrator::new(config)?;
    let filter = command.scope().filter();

    let summary = match command {
        Commands::Extract(_) => orchestrator.extract(&filter)?,
        Commands::BronzeToSilver(_) => orchestrator.bronze_to_silver(&filter)?,
        Commands::SilverToGold(_) => orchestrator.silver_to_gold(&filter)?,
        Commands::GoldToDb(_) => orchestrator.gold_to_db(&filter)?,
        Commands::Run(_) => orchestrator.run(&filter)?,
        Commands::Status(_) => return run_status(&orchestrator, &filter),
    };

    print_summary(command.name(), &summary);
    Ok(summary.all_succeeded())
}

fn run_status(orchestrator: &Orchestrator, filter: &UnitFilter) -> Result<bool> {
    let report = orchestrator.status(filter)?;

    if report.units.is_empty() {
        println!("No units recorded in {}", orchestrator.config().paths.ledger.display());
    } else {
        println!(
            "{:<28} {:<10} {:<14} {:>8}  {:<20}",
            "Unit", "Family", "State", "Rejected", "Recorded"
        );
        println!("{}", "-".repeat(86));
        for record in &report.units {
            println!(
                "{:<28} {:<10} {:<14} {:>8}  {:<20}",
                record.unit.to_string(),
                record.family.as_str(),
                record.state.label(),
                record.rejected,
                record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            );
            if let UnitState::Failed { stage, reason } = &record.state {
                println!("    {stage}: {reason}");
            }
        }
    }

    println!();
    let database = &orchestrator.config().database;
    println!("Store: {}", database.describe());
    for family in Family::ALL {
        if let Some(rows) = report.stored_rows.get(&family) {
            println!("  {:<28} {rows} rows", database.table_for(family));
        }
    }
    if let Some(err) = &report.store_error {
        eprintln!("Store error: {err}");
        return Ok(false);
    }

    Ok(!report.units.iter().any(|r| r.state.is_failed()))
}

fn print_summary(command: &str, summary: &RunSummary) {
    println!();
    println!("=== {command} ===");
    println!("Units:          {}", summary.total());
    println!("Succeeded:      {}", summary.succeeded());
    println!("Unchanged:      {}", summary.unchanged);
    println!("Rejected rows:  {}", summary.rejected_rows);
    println!(
        "Artifacts:      {} written, {} unchanged",
        summary.artifacts_written, summary.artifacts_unchanged
    );
    println!(
        "Rows:           {} inserted, {} updated, {} unchanged, {} deleted",
        summary.loads.inserted,
        summary.loads.updated,
        summary.loads.unchanged,
        summary.loads.deleted
    );

    let failed: Vec<_> = summary.failed().collect();
    if !failed.is_empty() {
        println!();
        println!("--- Failed units ---");
        for (unit, state) in failed {
            println!("{unit}: {state}");
        }
    }
    if let Some(err) = &summary.consolidation_error {
        println!();
        println!("Consolidation failed: {err}");
    }
    if summary.cancelled {
        println!();
        println!("WARNING: run cancelled before all units were processed");
    }
    println!();
}
