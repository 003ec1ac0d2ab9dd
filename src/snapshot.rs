//! Local metadata snapshot.
//!
//! The metadata export written by `fetch_metadata` doubles as the snapshot
//! for inventory cross-checks. Only the fields needed here are read; the rest
//! of each record is ignored.

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotGotchi {
    pub name: String,
    /// Inventory
    pub items: Vec<u32>,
    #[serde(default)]
    pub equipped_wearables: Option<Vec<u32>>,
}

impl SnapshotGotchi {
    pub fn holds(&self, item_id: u32) -> bool {
        self.items.contains(&item_id)
    }

    pub fn has_equipped(&self, item_id: u32) -> bool {
        self.equipped_wearables
            .as_ref()
            .map_or(false, |equipped| equipped.contains(&item_id))
    }

    /// In the pocket, not worn.
    pub fn holds_unequipped(&self, item_id: u32) -> bool {
        self.holds(item_id) && !self.has_equipped(item_id)
    }
}

/// Point-in-time view keyed by gotchi id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GotchiSnapshot {
    pub gotchis: BTreeMap<u32, SnapshotGotchi>,
}

impl GotchiSnapshot {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("snapshot is not a valid gotchi metadata map")
    }

    pub fn len(&self) -> usize {
        self.gotchis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gotchis.is_empty()
    }

    pub fn unequipped_owned_count(&self, item_id: u32) -> u64 {
        self.gotchis
            .values()
            .filter(|g| g.holds_unequipped(item_id))
            .count() as u64
    }

    /// Gotchis holding `item_id` without wearing it, ascending by id.
    pub fn unequipped_holders(&self, item_id: u32) -> Vec<(u32, &SnapshotGotchi)> {
        self.gotchis
            .iter()
            .filter(|(_, g)| g.holds_unequipped(item_id))
            .map(|(id, g)| (*id, g))
            .collect()
    }
}

/// Where the engine gets its snapshot from.
pub trait SnapshotSource: Send + Sync {
    fn load(&self) -> Result<Arc<GotchiSnapshot>>;
}

impl SnapshotSource for Arc<GotchiSnapshot> {
    fn load(&self) -> Result<Arc<GotchiSnapshot>> {
        Ok(Arc::clone(self))
    }
}

/// Reads the first existing candidate file once and caches it for the run.
pub struct FileSnapshot {
    candidates: Vec<PathBuf>,
    max_age: Option<Duration>,
    cached: Mutex<Option<Arc<GotchiSnapshot>>>,
}

impl FileSnapshot {
    pub fn new(candidates: Vec<PathBuf>, max_age: Option<Duration>) -> Self {
        Self {
            candidates,
            max_age,
            cached: Mutex::new(None),
        }
    }

    fn locate(&self) -> Result<&Path> {
        for path in &self.candidates {
            info!(path = %path.display(), "Looking for metadata snapshot");
            if path.exists() {
                return Ok(path);
            }
        }
        let tried = self
            .candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(anyhow!("could not find gotchi metadata snapshot at any of: {}", tried))
    }

    fn check_fresh(&self, path: &Path) -> Result<()> {
        let Some(max_age) = self.max_age else {
            return Ok(());
        };
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .with_context(|| format!("cannot stat {}", path.display()))?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age > max_age {
            bail!(
                "snapshot {} is stale: {}h old, limit {}h",
                path.display(),
                age.as_secs() / 3600,
                max_age.as_secs() / 3600
            );
        }
        Ok(())
    }
}

impl SnapshotSource for FileSnapshot {
    fn load(&self) -> Result<Arc<GotchiSnapshot>> {
        let mut cached = self.cached.lock();
        if let Some(snapshot) = cached.as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let path = self.locate()?;
        self.check_fresh(path)?;
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let snapshot = Arc::new(
            GotchiSnapshot::from_json_str(&raw)
                .with_context(|| format!("Invalid snapshot {}", path.display()))?,
        );
        info!(path = %path.display(), gotchis = snapshot.len(), "Metadata snapshot loaded");

        *cached = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }
}
