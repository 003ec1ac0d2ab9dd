//! Item reconciliation engine.
//!
//! Four ordered checks, each gating the next:
//!
//! - **check0** owner balances from the index sum to the item's max quantity
//! - **check1** custody balance equals the number of gotchis wearing the item
//! - **check2** equipped count plus the custody balance read from the contract
//!   explains the custody balance (isolates index lag)
//! - **check3** adding gotchis from the local snapshot that hold the item
//!   unequipped explains the custody balance
//!
//! The first passing terminal check ends the item as consistent. Stage 1 never
//! reports on its own; a mismatch there only escalates to stage 2.

pub mod report;

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::catalog::{Inapplicable, ItemCatalog, ItemType};
use crate::logging::log_check;
use crate::snapshot::SnapshotSource;
use crate::sources::{parse_balance, ItemLedger, OwnerBalance};

pub use report::{CheckStage, DiscrepancyRecord, DiscrepancyReport, ErrorData};

/// Result of checking one item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// Accounting explained; `stage` is where it was settled.
    Consistent { item_id: u32, stage: CheckStage },
    Discrepancy(DiscrepancyRecord),
    NotApplicable { item_id: u32, reason: Inapplicable },
    /// A data source failed before the item could be settled.
    Failed(ItemFailure),
}

impl ItemOutcome {
    pub fn item_id(&self) -> u32 {
        match self {
            ItemOutcome::Consistent { item_id, .. } => *item_id,
            ItemOutcome::Discrepancy(record) => record.item_id,
            ItemOutcome::NotApplicable { item_id, .. } => *item_id,
            ItemOutcome::Failed(failure) => failure.item.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub item: ItemType,
    /// Stage being evaluated when the query failed
    pub stage: CheckStage,
    pub message: String,
}

impl ItemFailure {
    /// Structured form for user-facing output.
    pub fn to_record(&self) -> DiscrepancyRecord {
        DiscrepancyRecord::new(
            &self.item,
            self.stage,
            ErrorData::default(),
            self.message.clone(),
        )
    }
}

/// Every number gathered while checking an item, for investigation output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observations {
    pub owners: usize,
    pub owners_total: Option<u64>,
    pub custody_balance: Option<u64>,
    pub equipped_count: Option<u64>,
    pub direct_balance: Option<u64>,
    pub unequipped_owned_count: Option<u64>,
}

impl Observations {
    /// Equipped plus direct custody balance, once both were read.
    pub fn direct_sum(&self) -> Option<u128> {
        Some(u128::from(self.equipped_count?) + u128::from(self.direct_balance?))
    }

    /// Stage 2 sum plus the pocketed count from the snapshot.
    pub fn inventory_sum(&self) -> Option<u128> {
        Some(self.direct_sum()? + u128::from(self.unequipped_owned_count?))
    }
}

struct StageError {
    stage: CheckStage,
    error: anyhow::Error,
}

fn at(stage: CheckStage) -> impl FnOnce(anyhow::Error) -> StageError {
    move |error| StageError { stage, error }
}

/// custody minus explained, clamped into i64
fn signed_gap(custody: u64, explained: u128) -> i64 {
    let explained = i128::try_from(explained).unwrap_or(i128::MAX);
    let gap = i128::from(custody).saturating_sub(explained);
    gap.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

pub struct ReconciliationEngine<L, S> {
    ledger: L,
    snapshot: S,
    catalog: Arc<ItemCatalog>,
    custody_address: String,
}

impl<L: ItemLedger, S: SnapshotSource> ReconciliationEngine<L, S> {
    pub fn new(ledger: L, snapshot: S, catalog: Arc<ItemCatalog>, custody_address: &str) -> Self {
        Self {
            ledger,
            snapshot,
            catalog,
            custody_address: custody_address.to_string(),
        }
    }

    pub fn catalog(&self) -> &ItemCatalog {
        &self.catalog
    }

    pub fn snapshot(&self) -> &S {
        &self.snapshot
    }

    pub async fn check_item(&self, item_id: u32) -> ItemOutcome {
        self.inspect_item(item_id).await.0
    }

    /// Check an item and also return the raw numbers observed along the way.
    pub async fn inspect_item(&self, item_id: u32) -> (ItemOutcome, Observations) {
        let mut seen = Observations::default();

        let item = match self.catalog.resolve(item_id) {
            Ok(item) => item.clone(),
            Err(reason) => {
                warn!(item_id, ?reason, "⚠️ Skipping item ID {} (not a valid item)", item_id);
                return (ItemOutcome::NotApplicable { item_id, reason }, seen);
            }
        };

        info!(item_id, name = %item.name, "Checking item ID: {} ({})", item_id, item.name);

        let outcome = match self.run_stages(&item, &mut seen).await {
            Ok(outcome) => outcome,
            Err(StageError { stage, error }) => {
                let message = format!("{:#}", error);
                error!(item_id, stage = %stage, error = %message, "❌ Error checking item ID {}", item_id);
                ItemOutcome::Failed(ItemFailure {
                    item,
                    stage,
                    message,
                })
            }
        };
        (outcome, seen)
    }

    fn custody_balance(&self, owners: &[OwnerBalance]) -> anyhow::Result<u64> {
        owners
            .iter()
            .filter(|o| o.owner.eq_ignore_ascii_case(&self.custody_address))
            .try_fold(0u64, |acc, o| {
                let balance = parse_balance(&o.balance)?;
                acc.checked_add(balance)
                    .ok_or_else(|| anyhow::anyhow!("custody balance overflow"))
            })
    }

    async fn run_stages(
        &self,
        item: &ItemType,
        seen: &mut Observations,
    ) -> Result<ItemOutcome, StageError> {
        let item_id = item.id;

        // check0: the index agrees with the known total supply
        let owners = self
            .ledger
            .owners_of(item_id)
            .await
            .map_err(at(CheckStage::Supply))?;
        seen.owners = owners.len();

        let owners_total = owners
            .iter()
            .try_fold(0u64, |acc, o| {
                let balance = parse_balance(&o.balance)?;
                acc.checked_add(balance)
                    .ok_or_else(|| anyhow::anyhow!("owner balance sum overflow"))
            })
            .map_err(at(CheckStage::Supply))?;
        seen.owners_total = Some(owners_total);

        let custody = self
            .custody_balance(&owners)
            .map_err(at(CheckStage::Supply))?;
        seen.custody_balance = Some(custody);
        info!(item_id, custody, max_quantity = item.max_quantity, "Custody balance: {}", custody);

        let supply_ok = owners_total == item.max_quantity;
        let detail = format!(
            "Owners total balance ({}) {} item max quantity ({})",
            owners_total,
            if supply_ok { "===" } else { "!==" },
            item.max_quantity
        );
        log_check(item_id, CheckStage::Supply.label(), supply_ok, &detail);
        if !supply_ok {
            return Ok(ItemOutcome::Discrepancy(DiscrepancyRecord::new(
                item,
                CheckStage::Supply,
                ErrorData {
                    owners_total: Some(owners_total),
                    ..Default::default()
                },
                detail,
            )));
        }

        // check1: every custodied copy is worn by some gotchi
        let equipped = self
            .ledger
            .equipped_holder_count(item_id)
            .await
            .map_err(at(CheckStage::CustodyDisplay))?;
        seen.equipped_count = Some(equipped);

        let display_ok = custody == equipped;
        log_check(
            item_id,
            CheckStage::CustodyDisplay.label(),
            display_ok,
            &format!(
                "Custody balance ({}) {} gotchis with item equipped ({})",
                custody,
                if display_ok { "===" } else { "!==" },
                equipped
            ),
        );
        if display_ok {
            info!(item_id, "✅ All checks passed for item {} ({})", item_id, item.name);
            return Ok(ItemOutcome::Consistent {
                item_id,
                stage: CheckStage::CustodyDisplay,
            });
        }

        // check2: contract state explains the gap the index cannot
        let direct = self
            .ledger
            .custody_balance_direct(item_id)
            .await
            .map_err(at(CheckStage::DirectBalance))?;
        seen.direct_balance = Some(direct);
        info!(item_id, direct, "Balance really owned by custody: {}", direct);

        let explained_direct = u128::from(equipped) + u128::from(direct);
        let direct_ok = u128::from(custody) == explained_direct;
        let direct_detail = format!(
            "Custody balance ({}) {} gotchis with item equipped ({}) + direct custody balance ({})",
            custody,
            if direct_ok { "===" } else { "!==" },
            equipped,
            direct
        );
        log_check(item_id, CheckStage::DirectBalance.label(), direct_ok, &direct_detail);
        if direct_ok {
            info!(item_id, "✅ Checks passed for item {} ({}) at check 2", item_id, item.name);
            return Ok(ItemOutcome::Consistent {
                item_id,
                stage: CheckStage::DirectBalance,
            });
        }

        // check3: pocketed copies from the local snapshot
        let snapshot = match self.snapshot.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let reason = format!("{:#}", e);
                error!(item_id, error = %reason, "❌ Error during Check 3, reporting check 2 result");
                return Ok(ItemOutcome::Discrepancy(
                    DiscrepancyRecord::new(
                        item,
                        CheckStage::DirectBalance,
                        ErrorData {
                            custody_balance: Some(custody),
                            equipped_count: Some(equipped),
                            direct_balance: Some(direct),
                            discrepancy: Some(signed_gap(custody, explained_direct)),
                            ..Default::default()
                        },
                        direct_detail,
                    )
                    .degraded(reason),
                ));
            }
        };

        let unequipped = snapshot.unequipped_owned_count(item_id);
        seen.unequipped_owned_count = Some(unequipped);
        info!(
            item_id,
            unequipped,
            "Found {} gotchis with item {} in inventory but not equipped",
            unequipped,
            item_id
        );

        let explained = explained_direct + u128::from(unequipped);
        let inventory_ok = u128::from(custody) == explained;
        let detail = format!(
            "Custody balance ({}) {} gotchis with item equipped ({}) + direct custody balance ({}) + gotchis with item in pocket ({})",
            custody,
            if inventory_ok { "===" } else { "!==" },
            equipped,
            direct,
            unequipped
        );
        log_check(item_id, CheckStage::Inventory.label(), inventory_ok, &detail);
        if inventory_ok {
            info!(item_id, "✅ Checks passed for item {} ({}) at check 3", item_id, item.name);
            return Ok(ItemOutcome::Consistent {
                item_id,
                stage: CheckStage::Inventory,
            });
        }

        Ok(ItemOutcome::Discrepancy(DiscrepancyRecord::new(
            item,
            CheckStage::Inventory,
            ErrorData {
                custody_balance: Some(custody),
                equipped_count: Some(equipped),
                direct_balance: Some(direct),
                unequipped_owned_count: Some(unequipped),
                discrepancy: Some(signed_gap(custody, explained)),
                ..Default::default()
            },
            detail,
        )))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::ItemType;
    use crate::snapshot::{GotchiSnapshot, SnapshotGotchi};
    use anyhow::{anyhow, Result};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    pub(crate) const CUSTODY: &str = "0x86935f11c86623dec8a25696e1c19a8659cbf95d";

    /// Scripted ledger that records which queries ran.
    #[derive(Default)]
    pub(crate) struct FakeLedger {
        pub owners: Vec<OwnerBalance>,
        pub equipped: u64,
        pub direct: u64,
        pub fail_owners: bool,
        pub fail_equipped: bool,
        pub fail_direct: bool,
        pub calls: Mutex<Vec<&'static str>>,
    }

    impl FakeLedger {
        pub(crate) fn new(custody: u64, others: &[u64], equipped: u64, direct: u64) -> Self {
            let mut owners = vec![OwnerBalance {
                owner: CUSTODY.to_string(),
                balance: custody.to_string(),
            }];
            for (i, b) in others.iter().enumerate() {
                owners.push(OwnerBalance {
                    owner: format!("0x{:040x}", i + 1),
                    balance: b.to_string(),
                });
            }
            Self {
                owners,
                equipped,
                direct,
                ..Default::default()
            }
        }

        pub(crate) fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl ItemLedger for FakeLedger {
        async fn owners_of(&self, _item_id: u32) -> Result<Vec<OwnerBalance>> {
            self.calls.lock().push("owners");
            if self.fail_owners {
                return Err(anyhow!("subgraph unavailable"));
            }
            Ok(self.owners.clone())
        }

        async fn equipped_holder_count(&self, _item_id: u32) -> Result<u64> {
            self.calls.lock().push("equipped");
            if self.fail_equipped {
                return Err(anyhow!("indexing error"));
            }
            Ok(self.equipped)
        }

        async fn custody_balance_direct(&self, _item_id: u32) -> Result<u64> {
            self.calls.lock().push("direct");
            if self.fail_direct {
                return Err(anyhow!("rpc timeout"));
            }
            Ok(self.direct)
        }
    }

    pub(crate) struct BrokenSnapshot;

    impl SnapshotSource for BrokenSnapshot {
        fn load(&self) -> Result<Arc<GotchiSnapshot>> {
            Err(anyhow!("could not find gotchi metadata snapshot"))
        }
    }

    pub(crate) fn catalog() -> Arc<ItemCatalog> {
        Arc::new(
            ItemCatalog::from_items(vec![
                ItemType {
                    id: 0,
                    name: "The Void".into(),
                    max_quantity: 0,
                },
                ItemType {
                    id: 1,
                    name: "Camo Hat".into(),
                    max_quantity: 100,
                },
                ItemType {
                    id: 12,
                    name: "Link Bubbly".into(),
                    max_quantity: 50,
                },
            ])
            .unwrap(),
        )
    }

    /// `pocket` gotchis hold item 12 unequipped, plus one wearer.
    pub(crate) fn snapshot_with_pocketed(pocket: usize) -> Arc<GotchiSnapshot> {
        let mut gotchis = BTreeMap::new();
        gotchis.insert(
            1,
            SnapshotGotchi {
                name: "Wearer".into(),
                items: vec![12],
                equipped_wearables: Some(vec![12]),
            },
        );
        for i in 0..pocket {
            gotchis.insert(
                100 + i as u32,
                SnapshotGotchi {
                    name: format!("Pocket {}", i),
                    items: vec![12],
                    equipped_wearables: Some(vec![]),
                },
            );
        }
        Arc::new(GotchiSnapshot { gotchis })
    }

    fn engine<S: SnapshotSource>(ledger: FakeLedger, snapshot: S) -> ReconciliationEngine<FakeLedger, S> {
        ReconciliationEngine::new(ledger, snapshot, catalog(), CUSTODY)
    }

    #[tokio::test]
    async fn test_supply_mismatch_stops_at_check0() {
        let engine = engine(FakeLedger::new(10, &[80], 10, 0), snapshot_with_pocketed(0));
        let outcome = engine.check_item(1).await;

        match outcome {
            ItemOutcome::Discrepancy(record) => {
                assert_eq!(record.error_type, CheckStage::Supply);
                assert_eq!(record.error_data.owners_total, Some(90));
                assert_eq!(record.max_quantity, 100);
                assert!(record.message.contains("!=="));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(engine.ledger.calls(), vec!["owners"]);
    }

    #[tokio::test]
    async fn test_custody_matches_equipped_is_consistent_at_check1() {
        let engine = engine(FakeLedger::new(10, &[90], 10, 0), snapshot_with_pocketed(0));
        let outcome = engine.check_item(1).await;

        assert_eq!(
            outcome,
            ItemOutcome::Consistent {
                item_id: 1,
                stage: CheckStage::CustodyDisplay
            }
        );
        assert_eq!(engine.ledger.calls(), vec!["owners", "equipped"]);
    }

    #[tokio::test]
    async fn test_direct_balance_explains_gap_at_check2() {
        let engine = engine(FakeLedger::new(8, &[42], 5, 3), BrokenSnapshot);
        let outcome = engine.check_item(12).await;

        assert_eq!(
            outcome,
            ItemOutcome::Consistent {
                item_id: 12,
                stage: CheckStage::DirectBalance
            }
        );
        assert_eq!(engine.ledger.calls(), vec!["owners", "equipped", "direct"]);
    }

    #[tokio::test]
    async fn test_snapshot_explains_gap_at_check3() {
        let engine = engine(FakeLedger::new(10, &[40], 5, 3), snapshot_with_pocketed(2));
        let outcome = engine.check_item(12).await;

        assert_eq!(
            outcome,
            ItemOutcome::Consistent {
                item_id: 12,
                stage: CheckStage::Inventory
            }
        );
    }

    #[tokio::test]
    async fn test_unexplained_gap_reports_check3_with_exact_discrepancy() {
        let engine = engine(FakeLedger::new(10, &[40], 5, 3), snapshot_with_pocketed(1));
        let (outcome, seen) = engine.inspect_item(12).await;

        let ItemOutcome::Discrepancy(record) = outcome else {
            panic!("expected discrepancy");
        };
        assert_eq!(record.error_type, CheckStage::Inventory);
        assert_eq!(record.error_data.discrepancy, Some(1));
        assert_eq!(record.error_data.unequipped_owned_count, Some(1));
        assert!(!record.degraded);
        assert_eq!(seen.custody_balance, Some(10));
        assert_eq!(seen.direct_balance, Some(3));
    }

    #[tokio::test]
    async fn test_overexplained_gap_is_negative() {
        let engine = engine(FakeLedger::new(10, &[40], 5, 3), snapshot_with_pocketed(4));
        let ItemOutcome::Discrepancy(record) = engine.check_item(12).await else {
            panic!("expected discrepancy");
        };
        assert_eq!(record.error_data.discrepancy, Some(-2));
    }

    #[tokio::test]
    async fn test_snapshot_failure_degrades_to_check2() {
        let engine = engine(FakeLedger::new(10, &[40], 5, 3), BrokenSnapshot);
        let ItemOutcome::Discrepancy(record) = engine.check_item(12).await else {
            panic!("expected discrepancy");
        };
        assert_eq!(record.error_type, CheckStage::DirectBalance);
        assert!(record.degraded);
        assert!(record
            .degraded_reason
            .as_deref()
            .unwrap()
            .contains("snapshot"));
        assert_eq!(record.error_data.discrepancy, Some(2));
        assert_eq!(record.error_data.unequipped_owned_count, None);
    }

    #[tokio::test]
    async fn test_void_and_unknown_items_not_applicable() {
        let engine = engine(FakeLedger::new(10, &[90], 10, 0), snapshot_with_pocketed(0));

        assert_eq!(
            engine.check_item(0).await,
            ItemOutcome::NotApplicable {
                item_id: 0,
                reason: Inapplicable::VoidItem
            }
        );
        assert_eq!(
            engine.check_item(404).await,
            ItemOutcome::NotApplicable {
                item_id: 404,
                reason: Inapplicable::UnknownItem
            }
        );
        assert!(engine.ledger.calls().is_empty());
    }

    #[tokio::test]
    async fn test_query_failures_tagged_with_stage() {
        let mut ledger = FakeLedger::new(10, &[90], 5, 0);
        ledger.fail_owners = true;
        let ItemOutcome::Failed(failure) = engine(ledger, snapshot_with_pocketed(0)).check_item(1).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.stage, CheckStage::Supply);
        assert!(failure.message.contains("subgraph unavailable"));

        let mut ledger = FakeLedger::new(10, &[90], 5, 0);
        ledger.fail_equipped = true;
        let ItemOutcome::Failed(failure) = engine(ledger, snapshot_with_pocketed(0)).check_item(1).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.stage, CheckStage::CustodyDisplay);

        let mut ledger = FakeLedger::new(10, &[90], 5, 0);
        ledger.fail_direct = true;
        let ItemOutcome::Failed(failure) = engine(ledger, snapshot_with_pocketed(0)).check_item(1).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.stage, CheckStage::DirectBalance);
        let record = failure.to_record();
        assert_eq!(record.error_type, CheckStage::DirectBalance);
        assert_eq!(record.message, "rpc timeout");
    }

    #[tokio::test]
    async fn test_malformed_balance_fails_at_check0() {
        let mut ledger = FakeLedger::new(10, &[90], 10, 0);
        ledger.owners[1].balance = "lots".into();
        let ItemOutcome::Failed(failure) = engine(ledger, snapshot_with_pocketed(0)).check_item(1).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.stage, CheckStage::Supply);
        assert!(failure.message.contains("invalid balance"));
    }

    #[tokio::test]
    async fn test_custody_address_matched_case_insensitively() {
        let mut ledger = FakeLedger::new(10, &[90], 10, 0);
        ledger.owners[0].owner = crate::config::AAVEGOTCHI_DIAMOND.to_string();
        let outcome = engine(ledger, snapshot_with_pocketed(0)).check_item(1).await;
        assert!(matches!(
            outcome,
            ItemOutcome::Consistent {
                stage: CheckStage::CustodyDisplay,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_custody_owner_counts_as_zero() {
        let mut ledger = FakeLedger::new(0, &[100], 0, 0);
        ledger.owners.remove(0);
        let outcome = engine(ledger, snapshot_with_pocketed(0)).check_item(1).await;
        assert!(matches!(
            outcome,
            ItemOutcome::Consistent {
                stage: CheckStage::CustodyDisplay,
                ..
            }
        ));
    }

    #[test]
    fn test_signed_gap() {
        assert_eq!(signed_gap(10, 9), 1);
        assert_eq!(signed_gap(10, 12), -2);
        assert_eq!(signed_gap(0, u128::MAX), i64::MIN);
        assert_eq!(signed_gap(u64::MAX, 0), i64::MAX);
    }

    #[test]
    fn test_observed_sums_do_not_overflow() {
        let seen = Observations {
            equipped_count: Some(u64::MAX),
            direct_balance: Some(u64::MAX),
            unequipped_owned_count: Some(2),
            ..Default::default()
        };
        assert_eq!(seen.direct_sum(), Some(2 * u128::from(u64::MAX)));
        assert_eq!(seen.inventory_sum(), Some(2 * u128::from(u64::MAX) + 2));

        let partial = Observations {
            equipped_count: Some(3),
            ..Default::default()
        };
        assert_eq!(partial.direct_sum(), None);
        assert_eq!(partial.inventory_sum(), None);
    }
}
