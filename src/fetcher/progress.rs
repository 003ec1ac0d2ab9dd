//! Fetch checkpoint persisted next to the metadata export.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::persist::{read_json_if_exists, write_json_atomic};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchProgress {
    /// -1 until the first batch lands
    pub last_completed_batch: i64,
    pub fetched_ids: Vec<u32>,
}

impl Default for FetchProgress {
    fn default() -> Self {
        Self {
            last_completed_batch: -1,
            fetched_ids: Vec::new(),
        }
    }
}

impl FetchProgress {
    /// Missing file means a fresh start.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(read_json_if_exists(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Ids in `1..=total` not yet fetched, ascending.
    pub fn remaining(&self, total: u32) -> Vec<u32> {
        let fetched: BTreeSet<u32> = self.fetched_ids.iter().copied().collect();
        (1..=total).filter(|id| !fetched.contains(id)).collect()
    }

    /// Mark a batch as persisted and advance the batch index.
    pub fn record_batch(&mut self, ids: &[u32]) {
        self.fetched_ids.extend_from_slice(ids);
        self.last_completed_batch += 1;
    }
}
