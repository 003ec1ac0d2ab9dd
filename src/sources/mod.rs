//! Read-only data source adapters consumed by the reconciliation engine.

pub mod abi;
pub mod rpc;
pub mod subgraph;

use anyhow::{anyhow, Result};
use num_bigint::BigUint;

use crate::config::AuditConfig;

pub use rpc::DiamondRpcClient;
pub use subgraph::{OwnerBalance, SubgraphClient};

/// The three independent views of an item's circulation.
#[async_trait::async_trait]
pub trait ItemLedger: Send + Sync {
    /// Every (owner, balance) pair the index knows for the item.
    async fn owners_of(&self, item_id: u32) -> Result<Vec<OwnerBalance>>;

    /// Gotchis whose equipped set contains the item, per the index.
    async fn equipped_holder_count(&self, item_id: u32) -> Result<u64>;

    /// Custody balance read straight from contract state.
    async fn custody_balance_direct(&self, item_id: u32) -> Result<u64>;
}

/// Subgraph + RPC backed ledger used in production.
pub struct LiveLedger {
    subgraph: SubgraphClient,
    rpc: DiamondRpcClient,
}

impl LiveLedger {
    pub fn new(subgraph: SubgraphClient, rpc: DiamondRpcClient) -> Self {
        Self { subgraph, rpc }
    }

    /// Both endpoints must be configured.
    pub fn from_config(config: &AuditConfig) -> Result<Self> {
        let endpoints = config.reconcile_endpoints()?;
        let subgraph = SubgraphClient::new(endpoints.subgraph_url, config.http_timeout())?;
        let rpc = DiamondRpcClient::new(
            Some(endpoints.rpc_url),
            &config.endpoints.custody_address,
            config.http_timeout(),
        )?;
        Ok(Self::new(subgraph, rpc))
    }
}

#[async_trait::async_trait]
impl ItemLedger for LiveLedger {
    async fn owners_of(&self, item_id: u32) -> Result<Vec<OwnerBalance>> {
        self.subgraph.item_owners(item_id).await
    }

    async fn equipped_holder_count(&self, item_id: u32) -> Result<u64> {
        self.subgraph.equipped_holder_count(item_id).await
    }

    async fn custody_balance_direct(&self, item_id: u32) -> Result<u64> {
        let diamond = self.rpc.diamond().to_string();
        let balance = self.rpc.balance_of(&diamond, u64::from(item_id)).await?;
        biguint_to_u64(&balance)
    }
}

/// Parse a decimal balance string without losing precision.
pub fn parse_balance(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    let value = BigUint::parse_bytes(trimmed.as_bytes(), 10)
        .ok_or_else(|| anyhow!("invalid balance {:?}", raw))?;
    biguint_to_u64(&value)
}

pub fn biguint_to_u64(value: &BigUint) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("balance {} exceeds u64", value))
}
