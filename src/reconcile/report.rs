//! Discrepancy records and the report file.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::catalog::ItemType;
use crate::persist::write_json_atomic;

/// The four ordered reconciliation stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CheckStage {
    /// Owner balances sum to max quantity
    #[serde(rename = "check0")]
    Supply,
    /// Custody balance equals equipped holder count
    #[serde(rename = "check1")]
    CustodyDisplay,
    /// Equipped count plus direct contract balance explains custody
    #[serde(rename = "check2")]
    DirectBalance,
    /// Three-way sum with unequipped snapshot holders explains custody
    #[serde(rename = "check3")]
    Inventory,
}

impl CheckStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStage::Supply => "check0",
            CheckStage::CustodyDisplay => "check1",
            CheckStage::DirectBalance => "check2",
            CheckStage::Inventory => "check3",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CheckStage::Supply => "Check 0",
            CheckStage::CustodyDisplay => "Check 1",
            CheckStage::DirectBalance => "Check 2",
            CheckStage::Inventory => "Check 3",
        }
    }
}

impl fmt::Display for CheckStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage-specific numbers. Fields not observed at the failing stage are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owners_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custody_balance: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipped_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_balance: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unequipped_owned_count: Option<u64>,
    /// custody balance minus the explained sum; signed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discrepancy: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscrepancyRecord {
    pub item_id: u32,
    pub item_name: String,
    pub max_quantity: u64,
    pub error_type: CheckStage,
    pub error_data: ErrorData,
    pub message: String,
    /// Set when the inventory stage could not run and the direct-balance
    /// result is reported in its place.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

impl DiscrepancyRecord {
    pub fn new(item: &ItemType, stage: CheckStage, error_data: ErrorData, message: String) -> Self {
        Self {
            item_id: item.id,
            item_name: item.name.clone(),
            max_quantity: item.max_quantity,
            error_type: stage,
            error_data,
            message,
            degraded: false,
            degraded_reason: None,
        }
    }

    pub fn degraded(mut self, reason: String) -> Self {
        self.degraded = true;
        self.degraded_reason = Some(reason);
        self
    }
}

/// Append-only discrepancy list mirrored to disk after every push.
///
/// Owned by the scheduler for the duration of a run.
#[derive(Debug)]
pub struct DiscrepancyReport {
    path: PathBuf,
    records: Vec<DiscrepancyRecord>,
}

impl DiscrepancyReport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[DiscrepancyRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record and immediately overwrite the report file.
    pub fn push(&mut self, record: DiscrepancyRecord) -> Result<()> {
        self.records.push(record);
        self.flush()?;
        info!(path = %self.path.display(), records = self.records.len(), "Updated error report");
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.records)
    }
}
