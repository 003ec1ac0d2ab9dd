//! Items check
//!
//! Reconciles wearable circulation for one item or the whole catalog and
//! writes every discrepancy to the error report.
//!
//! Usage:
//!   cargo run --release --bin items_check
//!   cargo run --release --bin items_check -- 12
//!   cargo run --release --bin items_check -- --config audit.toml --output errors.json

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use items_audit::catalog::ItemCatalog;
use items_audit::config::AuditConfig;
use items_audit::logging::init_tracing;
use items_audit::reconcile::ReconciliationEngine;
use items_audit::scheduler::BatchScheduler;
use items_audit::shutdown::Shutdown;
use items_audit::snapshot::FileSnapshot;
use items_audit::sources::LiveLedger;

#[derive(Parser, Debug)]
#[command(name = "items_check")]
#[command(about = "Check wearable supply against custody, equipped and pocketed counts")]
struct Args {
    /// Item id to check. Omit to check the entire catalog
    item_id: Option<String>,

    /// TOML config file (defaults, then file, then environment)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Report path, overrides REPORT_PATH
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing("items_audit=info,items_check=info");

    let mut config = AuditConfig::load(args.config.as_deref())?;
    if let Some(output) = args.output {
        config.paths.report = output;
    }

    let ledger = LiveLedger::from_config(&config)?;
    let catalog = Arc::new(ItemCatalog::load(&config.paths.catalog)?);

    let item_id = match args.item_id.as_deref() {
        None => None,
        Some(raw) => match raw.trim().parse::<u32>() {
            Ok(id) if catalog.get(id).is_some() => Some(id),
            _ => {
                error!("Invalid item ID: {}", raw);
                std::process::exit(1);
            }
        },
    };

    let snapshot = FileSnapshot::new(config.paths.snapshots.clone(), config.paths.snapshot_max_age());
    let engine = ReconciliationEngine::new(ledger, snapshot, catalog, &config.endpoints.custody_address);
    let scheduler = BatchScheduler::new(
        engine,
        config.pacing.clone(),
        config.paths.report.clone(),
        Shutdown::on_ctrl_c(),
    );

    let (summary, report) = match item_id {
        Some(id) => scheduler.run_single(id).await?,
        None => scheduler.run_catalog().await?,
    };

    info!(
        checked = summary.checked,
        consistent = summary.consistent,
        not_applicable = summary.not_applicable,
        discrepancies = summary.discrepancies,
        failures = summary.failures.len(),
        interrupted = summary.interrupted,
        "Run finished"
    );
    for failure in &summary.failures {
        error!(
            item_id = failure.item_id,
            stage = %failure.error_type,
            "Item {} ({}) could not be checked: {}",
            failure.item_id,
            failure.item_name,
            failure.message
        );
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    if !report.is_empty() {
        info!(path = %report.path().display(), "Error report written to {}", report.path().display());
    }

    // a single explicit item has no wider run to absorb its failure
    if item_id.is_some() && !summary.failures.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
