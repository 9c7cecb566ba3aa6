//! Data model shared across the PoC challenger: hashes, keys, reports,
//! challenge records and the receipts transaction.

mod block;
mod hash;
mod keys;
mod poc;
mod report;
mod txn;

pub use self::{
    block::{Block, PocKey},
    hash::Hash256,
    keys::{Keypair, PublicKey, SIGNATURE_LENGTH},
    poc::{CodecError, LocalPoc, PublicPoc, STORE_VERSION},
    report::{PeerId, Receipt, ReceiptOrigin, Witness},
    txn::{PocPathElement, PocReceiptsTxn},
};
