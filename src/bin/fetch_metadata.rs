//! Metadata export
//!
//! Fetches every gotchi record from the diamond in batches, resuming from
//! `fetch_progress.json` when present. Takes no positional arguments.
//!
//! Usage:
//!   cargo run --release --bin fetch_metadata

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use items_audit::config::AuditConfig;
use items_audit::fetcher::MetadataFetcher;
use items_audit::logging::init_tracing;
use items_audit::shutdown::Shutdown;
use items_audit::sources::DiamondRpcClient;

#[derive(Parser, Debug)]
#[command(name = "fetch_metadata")]
#[command(about = "Export on-chain gotchi metadata with resumable progress")]
struct Args {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing("items_audit=info,fetch_metadata=info");

    let config = AuditConfig::load(args.config.as_deref())?;
    // RPC_URL is only demanded once the first batch is requested
    let rpc = DiamondRpcClient::new(
        config.endpoints.rpc_url.clone(),
        &config.endpoints.custody_address,
        config.http_timeout(),
    )?;

    info!(
        total = config.fetch.total_gotchis,
        batch_size = config.fetch.batch_size,
        output = %config.fetch.output_dir.display(),
        "Starting metadata export"
    );
    let fetcher = MetadataFetcher::new(rpc, config.fetch.clone(), Shutdown::on_ctrl_c());
    let summary = fetcher.run().await?;

    info!(
        batches = summary.batches_completed,
        fetched = summary.ids_fetched,
        stored = summary.total_stored,
        remaining = summary.remaining,
        calls = summary.contract_calls,
        interrupted = summary.interrupted,
        "Total Aavegotchis fetched: {}",
        summary.total_stored
    );
    Ok(())
}
