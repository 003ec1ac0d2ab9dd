//! Resumable metadata export.
//!
//! Walks gotchi ids `1..=total` in fixed-size batches, persisting the merged
//! metadata map and then the checkpoint after every batch. A restart only asks
//! the contract for ids missing from the checkpoint.

pub mod progress;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use crate::config::FetchConfig;
use crate::models::GotchiInfo;
use crate::persist::{read_json_if_exists, write_json_atomic};
use crate::shutdown::Shutdown;
use crate::sources::DiamondRpcClient;

pub use progress::FetchProgress;

/// On-disk export, keyed by gotchi id.
pub type MetadataMap = BTreeMap<u32, GotchiInfo>;

/// Batch contract read. Records come back in request order.
#[async_trait]
pub trait GotchiBatchSource: Send + Sync {
    async fn fetch_batch(&self, ids: &[u32]) -> Result<Vec<GotchiInfo>>;
}

#[async_trait]
impl GotchiBatchSource for DiamondRpcClient {
    async fn fetch_batch(&self, ids: &[u32]) -> Result<Vec<GotchiInfo>> {
        self.batch_get_bridged_aavegotchi(ids).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchSummary {
    pub batches_completed: usize,
    pub ids_fetched: usize,
    pub total_stored: usize,
    pub remaining: usize,
    pub contract_calls: usize,
    pub interrupted: bool,
}

pub struct MetadataFetcher<B> {
    source: B,
    config: FetchConfig,
    shutdown: Shutdown,
}

impl<B: GotchiBatchSource> MetadataFetcher<B> {
    pub fn new(source: B, config: FetchConfig, shutdown: Shutdown) -> Self {
        Self {
            source,
            config,
            shutdown,
        }
    }

    pub async fn run(&self) -> Result<FetchSummary> {
        let metadata_path = self.config.metadata_path();
        let progress_path = self.config.progress_path();

        let mut data: MetadataMap = read_json_if_exists(&metadata_path)
            .with_context(|| format!("Failed to load {}", metadata_path.display()))?
            .unwrap_or_default();
        let mut progress = FetchProgress::load(&progress_path)
            .with_context(|| format!("Failed to load {}", progress_path.display()))?;
        if progress.last_completed_batch >= 0 {
            info!(
                batch = progress.last_completed_batch + 1,
                fetched = progress.fetched_ids.len(),
                "Resuming from batch {}",
                progress.last_completed_batch + 1
            );
        }

        let remaining = progress.remaining(self.config.total_gotchis);
        let batches: Vec<&[u32]> = remaining.chunks(self.config.batch_size.max(1)).collect();
        info!(
            remaining = remaining.len(),
            batches = batches.len(),
            "Total batches to process: {}",
            batches.len()
        );

        let mut summary = FetchSummary {
            total_stored: data.len(),
            remaining: remaining.len(),
            ..Default::default()
        };

        for (i, batch) in batches.iter().enumerate() {
            if self.shutdown.is_triggered() {
                summary.interrupted = true;
                break;
            }

            info!(batch = i + 1, total = batches.len(), "Fetching batch {}/{}", i + 1, batches.len());
            let Some(records) = self.fetch_with_retry(batch, &mut summary).await? else {
                summary.interrupted = true;
                break;
            };

            data = merge_batch(data, batch, records);
            write_json_atomic(&metadata_path, &data)?;
            progress.record_batch(batch);
            progress.save(&progress_path)?;

            summary.batches_completed += 1;
            summary.ids_fetched += batch.len();
            summary.remaining -= batch.len();
            summary.total_stored = data.len();
            info!(
                batch = i + 1,
                checkpoint = progress.last_completed_batch,
                "Successfully processed and saved batch {}",
                i + 1
            );
        }

        if summary.interrupted {
            warn!(remaining = summary.remaining, "Fetch interrupted, progress saved");
        } else {
            info!(total = summary.total_stored, "Finished fetching all Aavegotchi data!");
        }
        Ok(summary)
    }

    /// `Ok(None)` when shutdown cut a call or a retry wait short.
    async fn fetch_with_retry(
        &self,
        batch: &[u32],
        summary: &mut FetchSummary,
    ) -> Result<Option<Vec<GotchiInfo>>> {
        let max_retries = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=max_retries {
            if attempt > 1 && !self.shutdown.pause(self.config.retry_delay()).await {
                return Ok(None);
            }

            summary.contract_calls += 1;
            let fetched = tokio::select! {
                biased;
                fetched = self.source.fetch_batch(batch) => fetched,
                _ = self.shutdown.cancelled() => {
                    warn!(
                        first_id = batch.first().copied().unwrap_or_default(),
                        "Interrupted during contract call, batch not saved"
                    );
                    return Ok(None);
                }
            };
            let result = fetched.and_then(|records| {
                if records.len() == batch.len() {
                    Ok(records)
                } else {
                    Err(anyhow!(
                        "expected {} records, got {}",
                        batch.len(),
                        records.len()
                    ))
                }
            });

            match result {
                Ok(records) => return Ok(Some(records)),
                Err(e) => {
                    error!(
                        attempt,
                        max_retries,
                        first_id = batch.first().copied().unwrap_or_default(),
                        error = %e,
                        "Error processing batch. Attempt {}/{}",
                        attempt,
                        max_retries
                    );
                    last_error = Some(e);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| anyhow!("no attempts made"));
        Err(err.context(format!(
            "Failed to process batch starting at id {} after {} attempts",
            batch.first().copied().unwrap_or_default(),
            max_retries
        )))
    }
}

/// Pair records with the ids they were requested for.
fn merge_batch(mut data: MetadataMap, ids: &[u32], records: Vec<GotchiInfo>) -> MetadataMap {
    for (id, record) in ids.iter().copied().zip(records) {
        data.insert(id, record);
    }
    data
}
