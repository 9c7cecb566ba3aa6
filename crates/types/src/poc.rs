use crate::{Hash256, Keypair, PeerId, PublicKey, Receipt, Witness};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current version byte prepended to every serialized [`LocalPoc`].
pub const STORE_VERSION: u8 = 1;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("empty record")]
    Empty,
    #[error("unknown record version `{0}`")]
    UnknownVersion(u8),
    #[error(transparent)]
    Bincode(#[from] bincode::Error),
}

/// Durable record of an in-flight challenge owned by the local validator.
///
/// Created by the derivation task, mutated only by the challenge manager on
/// receipt/witness ingestion, deleted once the receipts transaction is
/// submitted at TTL expiry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalPoc {
    /// Primary key: SHA-256 of the ephemeral public key.
    pub onion_key_hash: Hash256,
    /// Block whose hash seeded the challenge entropy.
    pub block_hash: Hash256,
    /// Height at which the challenge was initialized.
    pub start_height: u64,
    /// The ephemeral keypair, retained for later verification.
    pub keys: Keypair,
    /// Serialized keypair bytes embedded in the final transaction.
    pub secret: Vec<u8>,
    /// First hop of the path.
    pub target: PublicKey,
    /// Onion ciphertext delivered to the target.
    pub onion: Vec<u8>,
    /// Hop i's gateway and the layer data it is expected to echo back.
    pub challengees: Vec<(PublicKey, Vec<u8>)>,
    /// Hop i's gateway and the hash a downstream witness of hop i reports.
    pub packet_hashes: Vec<(PublicKey, Hash256)>,
    /// Receipt per challengee, keyed by the challengee's public key.
    pub receipts: BTreeMap<PublicKey, (PeerId, Receipt)>,
    /// Witnesses per hop, keyed by the hop's packet hash.
    pub witnesses: BTreeMap<Hash256, Vec<(PeerId, Witness)>>,
}

impl LocalPoc {
    /// Index of the hop whose challengee is `gateway`.
    pub fn hop_index(&self, gateway: &PublicKey) -> Option<usize> {
        self.challengees.iter().position(|(g, _)| g == gateway)
    }

    /// Index of the hop whose packet hash is `packet_hash`.
    pub fn packet_hash_index(&self, packet_hash: &Hash256) -> Option<usize> {
        self.packet_hashes.iter().position(|(_, h)| h == packet_hash)
    }

    pub fn path_len(&self) -> usize {
        self.challengees.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![STORE_VERSION];
        bincode::serialize_into(&mut buf, self)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        match bytes.split_first() {
            None => Err(CodecError::Empty),
            Some((&STORE_VERSION, rest)) => Ok(bincode::deserialize(rest)?),
            Some((&version, _)) => Err(CodecError::UnknownVersion(version)),
        }
    }
}

/// Ledger-resident record of a challenge, written for every ephemeral key in
/// a block regardless of which validator owns it. Read back only for
/// TTL-based deletion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicPoc {
    pub onion_key_hash: Hash256,
    pub challenger: PublicKey,
    pub block_hash: Hash256,
    pub start_height: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReceiptOrigin;
    use rand::rngs::OsRng;

    fn sample_poc() -> LocalPoc {
        let keys = Keypair::generate(&mut OsRng);
        let target = Keypair::generate(&mut OsRng).public_key();
        let hop2 = Keypair::generate(&mut OsRng).public_key();
        let layer0 = Hash256::digest(b"layer-0");
        let layer1 = Hash256::digest(b"layer-1");
        let mut receipts = BTreeMap::new();
        receipts.insert(
            target,
            (
                PeerId::from_bytes([7u8; 32]),
                Receipt {
                    gateway: target,
                    timestamp: 17,
                    signal: -90,
                    data: vec![0xab, 0xcd],
                    origin: ReceiptOrigin::Radio,
                    signature: vec![1, 2, 3],
                    addr_hash: Some(vec![0x11, 0x22]),
                },
            ),
        );
        let mut witnesses = BTreeMap::new();
        witnesses.insert(
            layer1,
            vec![(
                PeerId::from_bytes([9u8; 32]),
                Witness {
                    gateway: hop2,
                    timestamp: 18,
                    signal: -101,
                    snr: 2.5,
                    frequency: 904.3,
                    datarate: "SF8BW125".to_string(),
                    packet_hash: layer1,
                    signature: vec![4, 5],
                },
            )],
        );
        LocalPoc {
            onion_key_hash: keys.onion_key_hash(),
            block_hash: Hash256::digest(b"block"),
            start_height: 120,
            secret: keys.secret_bytes(),
            keys,
            target,
            onion: vec![0xde, 0xad],
            challengees: vec![(target, vec![0xab, 0xcd]), (hop2, vec![0x01, 0x02])],
            packet_hashes: vec![(target, layer0), (hop2, layer1)],
            receipts,
            witnesses,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let poc = sample_poc();
        let encoded = poc.encode().unwrap();
        assert_eq!(encoded[0], STORE_VERSION);
        let decoded = LocalPoc::decode(&encoded).unwrap();
        assert_eq!(poc, decoded);
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let mut encoded = sample_poc().encode().unwrap();
        encoded[0] = 42;
        assert!(matches!(
            LocalPoc::decode(&encoded),
            Err(CodecError::UnknownVersion(42))
        ));
    }

    #[test]
    fn decode_rejects_empty() {
        assert!(matches!(LocalPoc::decode(&[]), Err(CodecError::Empty)));
    }

    #[test]
    fn hop_lookups() {
        let poc = sample_poc();
        assert_eq!(poc.hop_index(&poc.target), Some(0));
        assert_eq!(poc.packet_hash_index(&poc.packet_hashes[1].1), Some(1));
        assert_eq!(poc.hop_index(&Keypair::generate(&mut OsRng).public_key()), None);
    }
}
