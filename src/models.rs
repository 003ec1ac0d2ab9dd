use serde::{Deserialize, Serialize};

/// Full on-chain record for one Aavegotchi, as stored in the metadata export.
///
/// Small integer fields (status, timestamps, haunt) are plain numbers. Unbounded
/// counters and the random seed stay decimal strings so nothing is lost in
/// JSON consumers that parse numbers as doubles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GotchiInfo {
    pub name: String,
    pub owner: String,
    pub random_number: String,
    /// 0 portal, 1 VRF pending, 2 open portal, 3 Aavegotchi
    pub status: u64,
    /// Eye color, eye shape, brain size, spookiness, aggressiveness, energy
    pub numeric_traits: Vec<i16>,
    pub temporary_trait_boosts: Vec<i16>,
    /// 16 wearable slots, 0 when empty
    pub equipped_wearables: Vec<u16>,
    pub collateral_type: String,
    pub escrow: String,
    pub minimum_stake: String,
    pub used_skill_points: String,
    pub experience: String,
    pub interaction_count: String,
    pub claim_time: u64,
    pub last_temporary_boost: u64,
    pub haunt_id: u64,
    pub last_interacted: u64,
    pub locked: bool,
    /// Item ids held in the gotchi's pocket
    pub items: Vec<u16>,
    pub respec_count: String,
}
