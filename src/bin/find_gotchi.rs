//! Single-item investigation
//!
//! Runs the reconciliation checks for one item, then lists every gotchi in the
//! metadata snapshot that holds the item without wearing it. Writes nothing.
//!
//! Usage:
//!   cargo run --release --bin find_gotchi -- --item-id 12

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use items_audit::catalog::ItemCatalog;
use items_audit::config::AuditConfig;
use items_audit::logging::init_tracing;
use items_audit::reconcile::{ItemOutcome, Observations, ReconciliationEngine};
use items_audit::snapshot::{FileSnapshot, SnapshotSource};
use items_audit::sources::LiveLedger;

#[derive(Parser, Debug)]
#[command(name = "find_gotchi")]
#[command(about = "Investigate one item: checks plus gotchis holding it unequipped")]
struct Args {
    /// Item id to investigate
    #[arg(short, long, default_value_t = 12)]
    item_id: u32,

    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn print_sums(seen: &Observations) {
    let (Some(custody), Some(equipped)) = (seen.custody_balance, seen.equipped_count) else {
        return;
    };
    println!();
    println!("Custody balance:          {}", custody);
    println!("Check 1 sum (equipped):   {}", equipped);
    if let Some(sum) = seen.direct_sum() {
        println!("Check 2 sum (+ direct):   {}", sum);
    }
    if let Some(sum) = seen.inventory_sum() {
        println!("Check 3 sum (+ pocketed): {}", sum);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing("items_audit=info,find_gotchi=info");

    let config = AuditConfig::load(args.config.as_deref())?;
    let ledger = LiveLedger::from_config(&config)?;
    let catalog = Arc::new(ItemCatalog::load(&config.paths.catalog)?);
    let snapshot = FileSnapshot::new(config.paths.snapshots.clone(), config.paths.snapshot_max_age());
    let engine = ReconciliationEngine::new(ledger, snapshot, catalog, &config.endpoints.custody_address);

    let name = engine
        .catalog()
        .get(args.item_id)
        .map(|item| item.name.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    info!(item_id = args.item_id, "Starting check for item ID: {} ({})", args.item_id, name);

    let (outcome, seen) = engine.inspect_item(args.item_id).await;
    match &outcome {
        ItemOutcome::Consistent { stage, .. } => println!("Result: consistent at {}", stage),
        ItemOutcome::Discrepancy(record) => {
            println!("Result: discrepancy at {}", record.error_type);
            println!("{}", serde_json::to_string_pretty(record)?);
        }
        ItemOutcome::NotApplicable { reason, .. } => println!("Result: not applicable ({:?})", reason),
        ItemOutcome::Failed(failure) => {
            println!("{}", serde_json::to_string_pretty(&failure.to_record())?);
            std::process::exit(1);
        }
    }

    let snapshot = match engine.snapshot().load() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!("Error reading snapshot: {:#}", e);
            std::process::exit(1);
        }
    };

    let holders = snapshot.unequipped_holders(args.item_id);
    println!();
    println!("Gotchis with item {} in inventory but not equipped:", args.item_id);
    println!("{:<8} {:<32} {}", "ID", "NAME", "EQUIPPED");
    for (id, gotchi) in &holders {
        let equipped = gotchi
            .equipped_wearables
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|w| w.to_string())
            .collect::<Vec<_>>()
            .join(",");
        println!("{:<8} {:<32} [{}]", id, gotchi.name, equipped);
    }
    println!("Total: {}", holders.len());

    print_sums(&seen);
    Ok(())
}
