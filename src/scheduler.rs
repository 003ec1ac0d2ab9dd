//! Paced reconciliation over one item or the whole catalog.
//!
//! Items run strictly one at a time. The discrepancy report is threaded through
//! each group step and rewritten on disk after every new record.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::config::PacingConfig;
use crate::reconcile::{DiscrepancyRecord, DiscrepancyReport, ItemOutcome, ReconciliationEngine};
use crate::shutdown::Shutdown;
use crate::snapshot::SnapshotSource;
use crate::sources::ItemLedger;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub checked: usize,
    pub consistent: usize,
    pub not_applicable: usize,
    pub discrepancies: usize,
    /// Items whose checks could not complete; never written to the report.
    pub failures: Vec<DiscrepancyRecord>,
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    fn start() -> Self {
        Self {
            checked: 0,
            consistent: 0,
            not_applicable: 0,
            discrepancies: 0,
            failures: Vec::new(),
            interrupted: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn tally(&mut self, outcome: &ItemOutcome) {
        self.checked += 1;
        match outcome {
            ItemOutcome::Consistent { .. } => self.consistent += 1,
            ItemOutcome::Discrepancy(_) => self.discrepancies += 1,
            ItemOutcome::NotApplicable { .. } => self.not_applicable += 1,
            ItemOutcome::Failed(failure) => self.failures.push(failure.to_record()),
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }
}

pub struct BatchScheduler<L, S> {
    engine: ReconciliationEngine<L, S>,
    pacing: PacingConfig,
    report_path: PathBuf,
    shutdown: Shutdown,
}

impl<L: ItemLedger, S: SnapshotSource> BatchScheduler<L, S> {
    pub fn new(
        engine: ReconciliationEngine<L, S>,
        pacing: PacingConfig,
        report_path: PathBuf,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            engine,
            pacing,
            report_path,
            shutdown,
        }
    }

    pub fn engine(&self) -> &ReconciliationEngine<L, S> {
        &self.engine
    }

    /// Check one item with no pacing. A discrepancy is still written to the report.
    pub async fn run_single(&self, item_id: u32) -> Result<(RunSummary, DiscrepancyReport)> {
        let mut summary = RunSummary::start();
        let mut report = DiscrepancyReport::new(self.report_path.clone());

        info!(item_id, "Checking specific item ID: {}", item_id);
        let Some(outcome) = self.check_unless_stopped(item_id).await else {
            summary.interrupted = true;
            return Ok((summary.finish(), report));
        };
        summary.tally(&outcome);
        if let ItemOutcome::Discrepancy(record) = outcome {
            report.push(record)?;
        }

        Ok((summary.finish(), report))
    }

    /// Check every checkable catalog item in paced groups.
    pub async fn run_catalog(&self) -> Result<(RunSummary, DiscrepancyReport)> {
        let mut summary = RunSummary::start();
        let report = DiscrepancyReport::new(self.report_path.clone());
        report.flush()?;

        let ids = self.engine.catalog().checkable_ids();
        let groups: Vec<&[u32]> = ids.chunks(self.pacing.batch_size.max(1)).collect();
        info!(items = ids.len(), "Starting check for {} items...", ids.len());
        info!(
            groups = groups.len(),
            batch_size = self.pacing.batch_size,
            "Processing {} batches of up to {} items each",
            groups.len(),
            self.pacing.batch_size
        );

        let mut report = report;
        for (i, group) in groups.iter().enumerate() {
            if i > 0 {
                info!(
                    "Batch complete. Pausing for {} seconds before next batch...",
                    self.pacing.batch_delay().as_secs_f64()
                );
                if !self.shutdown.pause(self.pacing.batch_delay()).await {
                    summary.interrupted = true;
                    break;
                }
            }

            info!(batch = i + 1, total = groups.len(), "Processing batch {}/{}", i + 1, groups.len());
            report = self.process_group(group, report, &mut summary).await?;
            if summary.interrupted {
                break;
            }
        }

        report.flush()?;
        let summary = summary.finish();
        if summary.interrupted {
            warn!(checked = summary.checked, "Run interrupted before all items were checked");
        }
        if report.is_empty() {
            info!("✅ Check completed. No errors found!");
        } else {
            error!(
                discrepancies = report.len(),
                "Check completed with {} errors found.",
                report.len()
            );
        }
        info!(path = %report.path().display(), "Error report written");
        Ok((summary, report))
    }

    async fn process_group(
        &self,
        ids: &[u32],
        mut report: DiscrepancyReport,
        summary: &mut RunSummary,
    ) -> Result<DiscrepancyReport> {
        for (i, &item_id) in ids.iter().enumerate() {
            if i > 0 && !self.shutdown.pause(self.pacing.item_delay()).await {
                summary.interrupted = true;
                break;
            }
            if self.shutdown.is_triggered() {
                summary.interrupted = true;
                break;
            }

            let Some(outcome) = self.check_unless_stopped(item_id).await else {
                summary.interrupted = true;
                break;
            };
            summary.tally(&outcome);
            match outcome {
                ItemOutcome::Discrepancy(record) => report.push(record)?,
                ItemOutcome::Failed(failure) => {
                    warn!(item_id, stage = %failure.stage, "Item excluded from report: {}", failure.message);
                }
                ItemOutcome::Consistent { .. } | ItemOutcome::NotApplicable { .. } => {}
            }
        }
        Ok(report)
    }

    /// `None` when shutdown fired before the check finished. Nothing is
    /// persisted mid-item, so the partial check is simply dropped.
    async fn check_unless_stopped(&self, item_id: u32) -> Option<ItemOutcome> {
        tokio::select! {
            biased;
            outcome = self.engine.check_item(item_id) => Some(outcome),
            _ = self.shutdown.cancelled() => {
                warn!(item_id, "Interrupted while checking item {}, not recorded", item_id);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::tests::{catalog, snapshot_with_pocketed, FakeLedger, CUSTODY};
    use crate::reconcile::CheckStage;
    use crate::sources::OwnerBalance;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn pacing(batch_size: usize) -> PacingConfig {
        PacingConfig {
            batch_size,
            item_delay_ms: 0,
            batch_delay_ms: 0,
        }
    }

    fn scheduler(
        ledger: FakeLedger,
        dir: &TempDir,
        shutdown: Shutdown,
    ) -> BatchScheduler<FakeLedger, Arc<crate::snapshot::GotchiSnapshot>> {
        let engine = ReconciliationEngine::new(ledger, snapshot_with_pocketed(1), catalog(), CUSTODY);
        BatchScheduler::new(engine, pacing(1), dir.path().join("item-errors.json"), shutdown)
    }

    fn report_on_disk(dir: &TempDir) -> Vec<DiscrepancyRecord> {
        let raw = std::fs::read_to_string(dir.path().join("item-errors.json")).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_catalog_run_reports_in_item_order() {
        let dir = TempDir::new().unwrap();
        // item 1 passes supply (100) and ends at check3, item 12 fails supply (50)
        let sched = scheduler(FakeLedger::new(10, &[90], 5, 3), &dir, Shutdown::new());

        let (summary, report) = sched.run_catalog().await.unwrap();

        assert_eq!(summary.checked, 2);
        assert_eq!(summary.discrepancies, 2);
        assert!(!summary.interrupted);
        assert!(summary.finished_at.is_some());

        let ids: Vec<u32> = report.records().iter().map(|r| r.item_id).collect();
        assert_eq!(ids, vec![1, 12]);
        assert_eq!(report.records()[0].error_type, CheckStage::Inventory);
        assert_eq!(report.records()[0].error_data.discrepancy, Some(2));
        assert_eq!(report.records()[1].error_type, CheckStage::Supply);

        assert_eq!(report_on_disk(&dir), report.records());
    }

    #[tokio::test]
    async fn test_failures_excluded_from_report() {
        let dir = TempDir::new().unwrap();
        let mut ledger = FakeLedger::new(10, &[90], 5, 3);
        ledger.fail_equipped = true;
        let sched = scheduler(ledger, &dir, Shutdown::new());

        let (summary, report) = sched.run_catalog().await.unwrap();

        // item 12 still fails supply before the broken query runs
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].item_id, 1);
        assert_eq!(summary.failures[0].error_type, CheckStage::CustodyDisplay);
        assert_eq!(report.len(), 1);
        assert_eq!(report_on_disk(&dir)[0].item_id, 12);
    }

    #[tokio::test]
    async fn test_clean_catalog_leaves_empty_report() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("item-errors.json"), "[{\"stale\": true}]").unwrap();
        let ledger = FakeLedger::new(10, &[90], 10, 0);
        let sched = BatchScheduler::new(
            ReconciliationEngine::new(
                ledger,
                snapshot_with_pocketed(0),
                Arc::new(crate::catalog::ItemCatalog::from_items(vec![catalog().get(1).unwrap().clone()]).unwrap()),
                CUSTODY,
            ),
            pacing(5),
            dir.path().join("item-errors.json"),
            Shutdown::new(),
        );

        let (summary, report) = sched.run_catalog().await.unwrap();
        assert_eq!(summary.consistent, 1);
        assert!(report.is_empty());
        assert!(report_on_disk(&dir).is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_before_start() {
        let dir = TempDir::new().unwrap();
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let sched = scheduler(FakeLedger::new(10, &[90], 5, 3), &dir, shutdown);

        let (summary, report) = sched.run_catalog().await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.checked, 0);
        assert!(report.is_empty());
        assert!(report_on_disk(&dir).is_empty());
    }

    /// Trips shutdown as soon as the first item is queried.
    struct InterruptingLedger {
        inner: FakeLedger,
        shutdown: Shutdown,
    }

    #[async_trait::async_trait]
    impl ItemLedger for InterruptingLedger {
        async fn owners_of(&self, item_id: u32) -> Result<Vec<OwnerBalance>> {
            self.shutdown.trigger();
            self.inner.owners_of(item_id).await
        }

        async fn equipped_holder_count(&self, item_id: u32) -> Result<u64> {
            self.inner.equipped_holder_count(item_id).await
        }

        async fn custody_balance_direct(&self, item_id: u32) -> Result<u64> {
            self.inner.custody_balance_direct(item_id).await
        }
    }

    #[tokio::test]
    async fn test_interrupt_stops_before_next_item() {
        let dir = TempDir::new().unwrap();
        let shutdown = Shutdown::new();
        let ledger = InterruptingLedger {
            inner: FakeLedger::new(10, &[90], 5, 3),
            shutdown: shutdown.clone(),
        };
        let engine = ReconciliationEngine::new(ledger, snapshot_with_pocketed(1), catalog(), CUSTODY);
        let sched = BatchScheduler::new(engine, pacing(5), dir.path().join("item-errors.json"), shutdown);

        let (summary, report) = sched.run_catalog().await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.checked, 1);
        assert_eq!(report.len(), 1);
        assert_eq!(report_on_disk(&dir).len(), 1);
    }

    /// Stalls on the owner query, like a subgraph request waiting on its timeout.
    struct StalledLedger;

    #[async_trait::async_trait]
    impl ItemLedger for StalledLedger {
        async fn owners_of(&self, _item_id: u32) -> Result<Vec<OwnerBalance>> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(Vec::new())
        }

        async fn equipped_holder_count(&self, _item_id: u32) -> Result<u64> {
            Ok(0)
        }

        async fn custody_balance_direct(&self, _item_id: u32) -> Result<u64> {
            Ok(0)
        }
    }

    fn trigger_after(shutdown: &Shutdown, ms: u64) {
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            trigger.trigger();
        });
    }

    #[tokio::test]
    async fn test_interrupt_abandons_item_in_flight() {
        let dir = TempDir::new().unwrap();
        let shutdown = Shutdown::new();
        let engine = ReconciliationEngine::new(StalledLedger, snapshot_with_pocketed(0), catalog(), CUSTODY);
        let sched = BatchScheduler::new(engine, pacing(5), dir.path().join("item-errors.json"), shutdown.clone());
        trigger_after(&shutdown, 20);

        let started = std::time::Instant::now();
        let (summary, report) = sched.run_catalog().await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        // the stalled item was the last one to start
        assert!(summary.interrupted);
        assert_eq!(summary.checked, 0);
        assert!(report.is_empty());
        assert!(report_on_disk(&dir).is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_abandons_single_item() {
        let dir = TempDir::new().unwrap();
        let shutdown = Shutdown::new();
        let engine = ReconciliationEngine::new(StalledLedger, snapshot_with_pocketed(0), catalog(), CUSTODY);
        let sched = BatchScheduler::new(engine, pacing(1), dir.path().join("item-errors.json"), shutdown.clone());
        trigger_after(&shutdown, 20);

        let (summary, _) = sched.run_single(12).await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.checked, 0);
        assert!(!dir.path().join("item-errors.json").exists());
    }

    /// Records the virtual time at which each item's first query ran.
    struct TimedLedger {
        inner: FakeLedger,
        stamps: Arc<parking_lot::Mutex<Vec<(u32, tokio::time::Instant)>>>,
    }

    #[async_trait::async_trait]
    impl ItemLedger for TimedLedger {
        async fn owners_of(&self, item_id: u32) -> Result<Vec<OwnerBalance>> {
            self.stamps.lock().push((item_id, tokio::time::Instant::now()));
            self.inner.owners_of(item_id).await
        }

        async fn equipped_holder_count(&self, item_id: u32) -> Result<u64> {
            self.inner.equipped_holder_count(item_id).await
        }

        async fn custody_balance_direct(&self, item_id: u32) -> Result<u64> {
            self.inner.custody_balance_direct(item_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_between_items_and_groups() {
        use std::time::Duration;

        let dir = TempDir::new().unwrap();
        let items = (1..=5).map(|id| crate::catalog::ItemType {
            id,
            name: format!("Item {}", id),
            max_quantity: 100,
        });
        let catalog = Arc::new(crate::catalog::ItemCatalog::from_items(items).unwrap());
        let stamps = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let ledger = TimedLedger {
            // every item reconciles at check1
            inner: FakeLedger::new(10, &[90], 10, 0),
            stamps: Arc::clone(&stamps),
        };
        let engine = ReconciliationEngine::new(ledger, snapshot_with_pocketed(0), catalog, CUSTODY);
        let pacing = PacingConfig {
            batch_size: 2,
            item_delay_ms: 1_000,
            batch_delay_ms: 5_000,
        };
        let sched = BatchScheduler::new(engine, pacing, dir.path().join("item-errors.json"), Shutdown::new());

        let started = tokio::time::Instant::now();
        let (summary, _) = sched.run_catalog().await.unwrap();
        let finished = tokio::time::Instant::now();
        assert_eq!(summary.consistent, 5);

        let stamps = stamps.lock().clone();
        let ids: Vec<u32> = stamps.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        // no wait before the first item or after the last
        assert!(stamps[0].1 - started < Duration::from_millis(5));
        assert!(finished - stamps[4].1 < Duration::from_millis(5));

        // groups [1, 2] [3, 4] [5]: item delay inside a group, the longer delay
        // between groups and never an item delay stacked on top of it
        let expected = [1_000, 5_000, 1_000, 5_000];
        for (pair, want) in stamps.windows(2).zip(expected) {
            let gap = pair[1].1 - pair[0].1;
            assert!(
                gap >= Duration::from_millis(want) && gap < Duration::from_millis(want + 5),
                "gap between items {} and {} was {:?}, want {}ms",
                pair[0].0,
                pair[1].0,
                gap,
                want
            );
        }
    }

    #[tokio::test]
    async fn test_single_item_run() {
        let dir = TempDir::new().unwrap();
        let sched = scheduler(FakeLedger::new(10, &[90], 5, 3), &dir, Shutdown::new());

        let (summary, report) = sched.run_single(12).await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.discrepancies, 1);
        assert_eq!(report.records()[0].error_type, CheckStage::Supply);
        assert_eq!(report_on_disk(&dir).len(), 1);
    }

    #[tokio::test]
    async fn test_single_item_failure_in_summary() {
        let dir = TempDir::new().unwrap();
        let mut ledger = FakeLedger::new(10, &[90], 5, 3);
        ledger.fail_owners = true;
        let sched = scheduler(ledger, &dir, Shutdown::new());

        let (summary, report) = sched.run_single(1).await.unwrap();
        assert_eq!(summary.failures.len(), 1);
        assert!(report.is_empty());
        assert!(!dir.path().join("item-errors.json").exists());
    }
}
