//! GraphQL client for the Aavegotchi core subgraph.

use anyhow::{anyhow, bail, Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// The Graph caps `first` at 1000.
pub const PAGE_SIZE: usize = 1000;

/// Hard stop for runaway pagination.
const MAX_PAGES: usize = 500;

const ITEM_OWNERS_QUERY: &str = r#"
query ItemOwners($id: ID!, $first: Int!, $lastId: ID!) {
  itemType(id: $id) {
    owners(first: $first, orderBy: id, orderDirection: asc, where: { id_gt: $lastId }) {
      id
      owner
      balance
    }
  }
}
"#;

const EQUIPPED_HOLDERS_QUERY: &str = r#"
query EquippedHolders($itemId: Int!, $first: Int!, $lastId: ID!) {
  aavegotchis(
    first: $first
    orderBy: id
    orderDirection: asc
    where: { equippedWearables_contains: [$itemId], id_gt: $lastId }
  ) {
    id
  }
}
"#;

/// One holder of an item type as indexed by the subgraph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerBalance {
    pub owner: String,
    /// Decimal string, arbitrary precision
    pub balance: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemOwnersData {
    item_type: Option<ItemTypeOwners>,
}

#[derive(Debug, Deserialize)]
struct ItemTypeOwners {
    #[serde(default)]
    owners: Vec<OwnerRow>,
}

/// Owner entity as paged; `id` is the pagination cursor.
#[derive(Debug, Deserialize)]
struct OwnerRow {
    id: String,
    owner: String,
    balance: String,
}

impl From<OwnerRow> for OwnerBalance {
    fn from(row: OwnerRow) -> Self {
        Self {
            owner: row.owner,
            balance: row.balance,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EquippedHoldersData {
    aavegotchis: Vec<GotchiId>,
}

#[derive(Debug, Deserialize)]
struct GotchiId {
    id: String,
}

#[derive(Clone)]
pub struct SubgraphClient {
    client: Client,
    url: String,
}

impl SubgraphClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build subgraph HTTP client")?;
        Ok(Self { client, url })
    }

    async fn query<T: DeserializeOwned>(
        &self,
        operation: &str,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T> {
        let body = serde_json::json!({
            "query": query,
            "variables": variables,
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("subgraph {} request failed", operation))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("subgraph {} {}: {}", operation, status, text);
        }

        let parsed: GraphQlResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse subgraph {} response", operation))?;

        if let Some(errors) = parsed.errors.filter(|e| !e.is_empty()) {
            let joined = errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            bail!("subgraph {} errors: {}", operation, joined);
        }

        parsed
            .data
            .ok_or_else(|| anyhow!("subgraph {} returned no data", operation))
    }

    /// All owners of `item_id`. An item type unknown to the index has none.
    pub async fn item_owners(&self, item_id: u32) -> Result<Vec<OwnerBalance>> {
        let mut owners = Vec::new();
        let mut last_id = String::new();

        for _ in 0..MAX_PAGES {
            let data: ItemOwnersData = self
                .query(
                    "ItemOwners",
                    ITEM_OWNERS_QUERY,
                    serde_json::json!({
                        "id": item_id.to_string(),
                        "first": PAGE_SIZE,
                        "lastId": last_id,
                    }),
                )
                .await?;

            let Some(item_type) = data.item_type else {
                break;
            };
            let cursor = next_cursor(&item_type.owners);
            owners.extend(item_type.owners.into_iter().map(OwnerBalance::from));
            match cursor {
                Some(cursor) => last_id = cursor,
                None => break,
            }
        }

        debug!(item_id, owners = owners.len(), "Fetched item owners");
        Ok(owners)
    }

    /// Number of gotchis that currently have `item_id` equipped.
    pub async fn equipped_holder_count(&self, item_id: u32) -> Result<u64> {
        let mut count = 0u64;
        let mut last_id = String::new();

        for _ in 0..MAX_PAGES {
            let data: EquippedHoldersData = self
                .query(
                    "EquippedHolders",
                    EQUIPPED_HOLDERS_QUERY,
                    serde_json::json!({
                        "itemId": item_id,
                        "first": PAGE_SIZE,
                        "lastId": last_id,
                    }),
                )
                .await?;

            count += data.aavegotchis.len() as u64;
            match next_cursor(&data.aavegotchis) {
                Some(cursor) => last_id = cursor,
                None => break,
            }
        }

        debug!(item_id, count, "Counted gotchis with item equipped");
        Ok(count)
    }
}

/// Entities paged with an `id_gt` cursor.
trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for OwnerRow {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for GotchiId {
    fn key(&self) -> &str {
        &self.id
    }
}

/// Cursor for the next page, or `None` when this page was the last.
fn next_cursor<T: Keyed>(page: &[T]) -> Option<String> {
    if page.len() < PAGE_SIZE {
        return None;
    }
    page.last().map(|row| row.key().to_string())
}
