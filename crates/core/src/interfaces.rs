//! Traits for the external collaborators of the challenge manager: the
//! block event source, the ledger, the path and onion builders and the
//! transaction submitter.

use async_trait::async_trait;
use poc_challenger_config::ChainVars;
use poc_challenger_types::{
    Block, Hash256, Keypair, PocReceiptsTxn, PublicKey, PublicPoc,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Delivered for every block appended to the chain.
#[derive(Clone, Debug)]
pub struct BlockEvent {
    pub block: Block,
    /// Set while the node is catching up; the manager does not drive
    /// challenges from sync blocks.
    pub sync: bool,
}

/// Read access to the chain: the new-block subscription plus block lookup.
#[async_trait]
pub trait ReadChain: Send + Sync {
    /// Subscribe to new-block events. Fails while the chain is still
    /// starting up, in which case the manager retries the bootstrap.
    async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<BlockEvent>>;

    async fn get_block_by_hash(&self, hash: &Hash256) -> Option<Block>;

    async fn get_block_by_height(&self, height: u64) -> Option<Block>;
}

/// H3 cell index identifying a targeting zone.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HexId(pub u64);

impl fmt::Debug for HexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HexId({:#x})", self.0)
    }
}

impl fmt::Display for HexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Operating mode of a gateway, as recorded in the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayMode {
    DataOnly,
    Light,
    Full,
}

impl GatewayMode {
    /// Whether gateways in this mode may be challenged.
    pub fn is_poc_challengee(&self) -> bool {
        matches!(self, GatewayMode::Light | GatewayMode::Full)
    }
}

/// Ledger view of a gateway, restricted to what targeting needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub mode: GatewayMode,
    pub location: Option<HexId>,
    pub last_poc_challenge: Option<u64>,
}

/// Read access to the ledger at a versioned snapshot, plus the public PoC
/// writes the manager performs through scratch-and-commit contexts.
pub trait Ledger: Send + Sync {
    fn current_height(&self) -> u64;

    /// Immutable snapshot of the chain variables at the current height.
    fn snapshot_vars(&self) -> ChainVars;

    fn gateway_count(&self) -> usize;

    /// All populated targeting hexes with their gateway counts, ordered by
    /// hex id ascending.
    fn populated_hexes(&self) -> Vec<(HexId, u64)>;

    /// One random populated targeting hex, drawn with `rng`. `None` when no
    /// hex is populated.
    fn random_targeting_hex(&self, rng: &mut dyn RngCore) -> Option<HexId>;

    fn count_gateways_in_hex(&self, hex: HexId) -> u64;

    /// Gateways homed in `hex`, ordered by public key bytes ascending.
    fn gateways_in_hex(&self, hex: HexId) -> Vec<PublicKey>;

    fn find_gateway_info(&self, gateway: &PublicKey) -> Option<GatewayInfo>;

    /// Drops a gateway from the hex→gateways index. Used by v6 targeting to
    /// prune filtered-out gateways; implementations commit the scratch
    /// context atomically.
    fn remove_gateway_from_hex_index(&self, hex: HexId, gateway: &PublicKey);

    /// Full-overwrite write keyed by onion key hash.
    fn save_public_poc(&self, poc: PublicPoc) -> anyhow::Result<()>;

    fn delete_public_poc(&self, onion_key_hash: &Hash256) -> anyhow::Result<()>;

    fn active_public_pocs(&self) -> Vec<PublicPoc>;
}

/// Builds the ordered challenge path for a freshly selected target.
pub trait PathBuilder: Send + Sync {
    /// The first element of the returned path must be `target`.
    fn build(
        &self,
        target: PublicKey,
        rng: &mut dyn RngCore,
        ledger: &dyn Ledger,
        block_time: u64,
        vars: &ChainVars,
    ) -> anyhow::Result<Vec<PublicKey>>;
}

/// Builds the layered onion packet delivered to the target.
pub trait OnionBuilder: Send + Sync {
    /// Returns the onion ciphertext and the `hops.len() + 1` cleartext
    /// layers, outermost first.
    fn build(
        &self,
        keys: &Keypair,
        iv: u16,
        hops: &[(PublicKey, Vec<u8>)],
        block_hash: &Hash256,
        ledger: &dyn Ledger,
    ) -> anyhow::Result<(Vec<u8>, Vec<Vec<u8>>)>;
}

/// Broadcasts a signed receipts transaction to the chain.
#[async_trait]
pub trait TxnSubmitter: Send + Sync {
    async fn submit(&self, txn: PocReceiptsTxn) -> anyhow::Result<()>;
}
