use crate::{Hash256, PocReceiptsTxn, PublicKey};
use serde::{Deserialize, Serialize};

/// An ephemeral PoC key that landed in a block, together with the validator
/// that proposed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PocKey {
    pub challenger: PublicKey,
    pub onion_key_hash: Hash256,
}

/// Decoded view of a chain block, restricted to the fields the challenger
/// consumes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    hash: Hash256,
    height: u64,
    time: u64,
    poc_keys: Vec<PocKey>,
    receipt_txns: Vec<PocReceiptsTxn>,
}

impl Block {
    pub fn new(
        hash: Hash256,
        height: u64,
        time: u64,
        poc_keys: Vec<PocKey>,
        receipt_txns: Vec<PocReceiptsTxn>,
    ) -> Self {
        Self {
            hash,
            height,
            time,
            poc_keys,
            receipt_txns,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Block time in seconds since epoch.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Ephemeral key list carried by this block.
    pub fn poc_keys(&self) -> &[PocKey] {
        &self.poc_keys
    }

    /// PoC-receipts transactions included in this block.
    pub fn receipt_txns(&self) -> &[PocReceiptsTxn] {
        &self.receipt_txns
    }
}
