use crate::{CodecError, Hash256, Keypair, PublicKey, Receipt, Witness};
use serde::{Deserialize, Serialize};

/// One hop of the submitted path: the challengee, its receipt (if one was
/// collected) and the surviving witnesses for that hop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PocPathElement {
    pub challengee: PublicKey,
    pub receipt: Option<Receipt>,
    pub witnesses: Vec<Witness>,
}

/// PoC-receipts-v1 transaction submitted by the challenger at TTL expiry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PocReceiptsTxn {
    pub challenger: PublicKey,
    /// Serialized ephemeral keypair, disclosed so the derivation can be
    /// replayed by verifiers.
    pub secret: Vec<u8>,
    pub onion_key_hash: Hash256,
    pub block_hash: Hash256,
    /// Path elements in challenge order: element 0 is the target.
    pub path: Vec<PocPathElement>,
    pub fee: u64,
    pub signature: Vec<u8>,
}

impl PocReceiptsTxn {
    pub fn new(
        challenger: PublicKey,
        secret: Vec<u8>,
        onion_key_hash: Hash256,
        block_hash: Hash256,
        path: Vec<PocPathElement>,
    ) -> Self {
        Self {
            challenger,
            secret,
            onion_key_hash,
            block_hash,
            path,
            fee: 0,
            signature: vec![],
        }
    }

    /// Canonical bytes covered by the signature: the transaction with an
    /// empty signature field.
    pub fn signing_payload(&self) -> Result<Vec<u8>, CodecError> {
        let mut unsigned = self.clone();
        unsigned.signature = vec![];
        Ok(bincode::serialize(&unsigned)?)
    }

    pub fn sign(mut self, keypair: &Keypair) -> Result<Self, CodecError> {
        let payload = self.signing_payload()?;
        self.signature = keypair.sign(&payload);
        Ok(self)
    }

    pub fn verify_signature(&self) -> bool {
        match self.signing_payload() {
            Ok(payload) => self.challenger.verify(&payload, &self.signature),
            Err(_) => false,
        }
    }

    /// Address hashes carried by this transaction's receipts, in path order.
    /// The address-hash filter folds these when rebuilding.
    pub fn receipt_addr_hashes(&self) -> impl Iterator<Item = &[u8]> {
        self.path
            .iter()
            .filter_map(|element| element.receipt.as_ref())
            .filter_map(|receipt| receipt.addr_hash.as_deref())
    }
}
