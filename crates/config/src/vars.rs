use serde::{Deserialize, Serialize};

/// Typed snapshot of the chain variables the challenger consumes.
///
/// Snapshots are immutable for the duration of a derivation or filter
/// rebuild; unset optional variables disable the feature they gate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainVars {
    /// Width in bytes of the address hash kept by the replay filter.
    /// Unset disables the filter.
    pub poc_addr_hash_byte_count: Option<usize>,
    /// Challenge epoch length in blocks. Unset disables the filter.
    pub poc_challenge_interval: Option<u64>,
    /// Hex pool size for v6 targeting; also bounds zone-reselect retries.
    pub poc_target_pool_size: usize,
    /// H3 resolution that targeting hexes are parented to.
    pub poc_target_hex_parent_res: u8,
    /// Identical weight assigned to every surviving target candidate.
    pub poc_v5_target_prob_randomness_wt: f64,
    /// Bound on the candidate set considered per zone. Unset considers all.
    pub poc_witness_consideration_limit: Option<usize>,
    /// A gateway is interactive if it was challenged within this many blocks.
    pub hip17_interactivity_blocks: u64,
    /// Whether inactive gateways are filtered out of target selection.
    pub poc_activity_filter_enabled: bool,
    /// Witness bucket capacity per hop.
    pub poc_per_hop_max_witnesses: usize,
    /// Selects the targeting engine and gates transaction submission.
    pub poc_version: u64,
}

impl Default for ChainVars {
    fn default() -> Self {
        Self {
            poc_addr_hash_byte_count: Some(8),
            poc_challenge_interval: Some(30),
            poc_target_pool_size: 100,
            poc_target_hex_parent_res: 5,
            poc_v5_target_prob_randomness_wt: 1.0,
            poc_witness_consideration_limit: Some(25),
            hip17_interactivity_blocks: 3600,
            poc_activity_filter_enabled: false,
            poc_per_hop_max_witnesses: 5,
            poc_version: 10,
        }
    }
}

impl ChainVars {
    /// The address-hash filter runs only when both of its variables are set.
    pub fn addr_filter_enabled(&self) -> bool {
        self.poc_addr_hash_byte_count.is_some() && self.poc_challenge_interval.is_some()
    }

    /// Receipts transactions are only defined for v10 chains and newer.
    pub fn supports_receipts_txn(&self) -> bool {
        self.poc_version >= 10
    }

    /// v6 targeting samples a bounded random hex pool instead of
    /// enumerating every populated hex.
    pub fn uses_hex_pool_sampling(&self) -> bool {
        self.poc_version >= 6
    }
}
