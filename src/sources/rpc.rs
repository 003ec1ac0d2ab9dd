//! JSON-RPC client for the Aavegotchi diamond.
//!
//! Two read-only calls:
//! - `balanceOf(address,uint256)` (ERC-1155) for direct custody balances
//! - `batchGetBridgedAavegotchi(uint256[])` for the metadata export

use anyhow::{anyhow, bail, Context, Result};
use num_bigint::BigUint;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::abi::{self, AbiDecoder};
use crate::models::GotchiInfo;

const BALANCE_OF_SIG: &str = "balanceOf(address,uint256)";
const BATCH_GET_BRIDGED_SIG: &str = "batchGetBridgedAavegotchi(uint256[])";

/// Head words of one `AavegotchiBridged` tuple: 17 single-word members plus
/// two inline `int16[6]` and one inline `uint16[16]`.
const GOTCHI_HEAD_WORDS: usize = 45;

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: Option<i64>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<String>,
    error: Option<RpcErrorObject>,
}

#[derive(Clone)]
pub struct DiamondRpcClient {
    client: Client,
    /// Resolved lazily so tools that only need RPC later can still start.
    rpc_url: Option<String>,
    diamond: String,
}

impl DiamondRpcClient {
    pub fn new(rpc_url: Option<String>, diamond: &str, timeout: Duration) -> Result<Self> {
        abi::parse_address(diamond).context("invalid custody/diamond address")?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build RPC HTTP client")?;

        Ok(Self {
            client,
            rpc_url,
            diamond: diamond.to_string(),
        })
    }

    pub fn diamond(&self) -> &str {
        &self.diamond
    }

    fn endpoint(&self) -> Result<&str> {
        self.rpc_url
            .as_deref()
            .ok_or_else(|| anyhow!("RPC_URL environment variable is not set"))
    }

    async fn eth_call(&self, data: &str) -> Result<Vec<u8>> {
        let endpoint = self.endpoint()?;
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_call",
            "params": [{
                "to": &self.diamond,
                "data": data
            }, "latest"],
            "id": 1
        });

        let resp = self
            .client
            .post(endpoint)
            .json(&payload)
            .send()
            .await
            .context("RPC request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("RPC HTTP {}: {}", status, text);
        }

        let rpc: JsonRpcResponse = resp.json().await.context("failed to parse RPC response")?;
        if let Some(err) = rpc.error {
            bail!(
                "RPC error {}: {}",
                err.code.unwrap_or_default(),
                err.message.unwrap_or_else(|| "unknown".to_string())
            );
        }
        let result = rpc
            .result
            .ok_or_else(|| anyhow!("no result in RPC response"))?;
        abi::decode_hex_result(&result)
    }

    /// ERC-1155 balance of `owner` for token `id` held on the diamond.
    pub async fn balance_of(&self, owner: &str, id: u64) -> Result<BigUint> {
        let data = abi::encode_address_uint_call(abi::selector(BALANCE_OF_SIG), owner, id)?;
        let bytes = self.eth_call(&data).await?;
        let balance = AbiDecoder::new(&bytes).uint(0)?;
        debug!(owner, id, balance = %balance, "balanceOf");
        Ok(balance)
    }

    /// Fetch full records for `token_ids`, returned in request order.
    pub async fn batch_get_bridged_aavegotchi(&self, token_ids: &[u32]) -> Result<Vec<GotchiInfo>> {
        let ids: Vec<u64> = token_ids.iter().map(|&id| u64::from(id)).collect();
        let data = abi::encode_uint256_array_call(abi::selector(BATCH_GET_BRIDGED_SIG), &ids);
        let bytes = self.eth_call(&data).await?;
        let gotchis = decode_bridged_gotchis(&bytes)?;

        if gotchis.len() != token_ids.len() {
            bail!(
                "contract returned {} records for {} token ids",
                gotchis.len(),
                token_ids.len()
            );
        }
        Ok(gotchis)
    }
}

/// Decode the `AavegotchiBridged[]` return value.
pub fn decode_bridged_gotchis(bytes: &[u8]) -> Result<Vec<GotchiInfo>> {
    let dec = AbiDecoder::new(bytes);
    dec.dynamic_tuple_array()?
        .into_iter()
        .enumerate()
        .map(|(i, pos)| {
            decode_gotchi_tuple(&dec, pos).with_context(|| format!("record {} malformed", i))
        })
        .collect()
}

fn decode_gotchi_tuple(dec: &AbiDecoder<'_>, base: usize) -> Result<GotchiInfo> {
    let head = |i: usize| abi::slot(base, i);
    let tail = |i: usize| -> Result<usize> { abi::offset(base, dec.usize_at(head(i)?)?) };

    dec.word(head(GOTCHI_HEAD_WORDS - 1)?)?;

    Ok(GotchiInfo {
        name: dec.string(tail(0)?)?,
        owner: dec.address(head(1)?)?,
        random_number: dec.uint(head(2)?)?.to_string(),
        status: dec.uint_u64(head(3)?)?,
        numeric_traits: dec.i16_fixed(head(4)?, 6)?,
        temporary_trait_boosts: dec.i16_fixed(head(10)?, 6)?,
        equipped_wearables: dec.u16_fixed(head(16)?, 16)?,
        collateral_type: dec.string(tail(32)?)?,
        escrow: dec.address(head(33)?)?,
        minimum_stake: dec.uint(head(34)?)?.to_string(),
        used_skill_points: dec.uint(head(35)?)?.to_string(),
        experience: dec.uint(head(36)?)?.to_string(),
        interaction_count: dec.uint(head(37)?)?.to_string(),
        claim_time: dec.uint_u64(head(38)?)?,
        last_temporary_boost: dec.uint_u64(head(39)?)?,
        haunt_id: dec.uint_u64(head(40)?)?,
        last_interacted: dec.uint_u64(head(41)?)?,
        locked: dec.bool(head(42)?)?,
        items: dec.u16_array(tail(43)?)?,
        respec_count: dec.uint(head(44)?)?.to_string(),
    })
}
