//! Item type catalog.
//!
//! Loaded once from JSON and never mutated. Entries missing an id, name or
//! max quantity are dropped at load time, which makes them "not applicable"
//! to the reconciliation engine rather than an error.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Item id 0 is "The Void" and never reconciled.
pub const VOID_ITEM_ID: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemType {
    pub id: u32,
    pub name: String,
    pub max_quantity: u64,
}

/// Catalog entry as it appears on disk, every field optional.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawItemType {
    id: Option<u32>,
    name: Option<String>,
    max_quantity: Option<u64>,
}

/// Why an item id has no catalog-backed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inapplicable {
    VoidItem,
    UnknownItem,
}

#[derive(Debug, Clone, Default)]
pub struct ItemCatalog {
    items: BTreeMap<u32, ItemType>,
}

impl ItemCatalog {
    /// Build from already-validated item types. Duplicate ids are rejected.
    pub fn from_items(items: impl IntoIterator<Item = ItemType>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for item in items {
            let id = item.id;
            if map.insert(id, item).is_some() {
                bail!("duplicate item id {} in catalog", id);
            }
        }
        Ok(Self { items: map })
    }

    /// Parse either a JSON array of item types or an object keyed by id.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(raw).context("catalog is not valid JSON")?;

        let entries: Vec<(Option<u32>, serde_json::Value)> = match value {
            serde_json::Value::Array(values) => values.into_iter().map(|v| (None, v)).collect(),
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| (k.parse::<u32>().ok(), v))
                .collect(),
            _ => bail!("catalog must be a JSON array or object"),
        };

        let mut items = Vec::with_capacity(entries.len());
        let mut dropped = 0usize;
        for (key_id, entry) in entries {
            let raw: RawItemType = match serde_json::from_value(entry) {
                Ok(raw) => raw,
                Err(e) => {
                    dropped += 1;
                    warn!(key = ?key_id, error = %e, "Dropping malformed catalog entry");
                    continue;
                }
            };
            match (raw.id.or(key_id), raw.name, raw.max_quantity) {
                (Some(id), Some(name), Some(max_quantity)) if !name.trim().is_empty() => {
                    items.push(ItemType {
                        id,
                        name,
                        max_quantity,
                    });
                }
                (id, _, _) => {
                    dropped += 1;
                    warn!(id = ?id, "Dropping incomplete catalog entry");
                }
            }
        }

        let catalog = Self::from_items(items)?;
        if dropped > 0 {
            warn!(dropped, kept = catalog.len(), "Catalog loaded with dropped entries");
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read item catalog {}", path.display()))?;
        let catalog = Self::from_json_str(&raw)
            .with_context(|| format!("Invalid item catalog {}", path.display()))?;
        info!(path = %path.display(), items = catalog.len(), "Item catalog loaded");
        Ok(catalog)
    }

    pub fn get(&self, id: u32) -> Option<&ItemType> {
        self.items.get(&id)
    }

    /// Resolve an id to a checkable item type.
    pub fn resolve(&self, id: u32) -> Result<&ItemType, Inapplicable> {
        if id == VOID_ITEM_ID {
            return Err(Inapplicable::VoidItem);
        }
        self.items.get(&id).ok_or(Inapplicable::UnknownItem)
    }

    /// Every reconcilable id in ascending order (id > 0).
    pub fn checkable_ids(&self) -> Vec<u32> {
        self.items
            .keys()
            .copied()
            .filter(|&id| id != VOID_ITEM_ID)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
