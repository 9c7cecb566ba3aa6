use crate::{CodecError, Hash256, Keypair, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque 32-byte identity of the p2p peer that relayed a report.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0[..8]))
    }
}

/// How the challengee heard the packet it is acknowledging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptOrigin {
    P2p,
    Radio,
}

/// Attestation from a challengee that it received its onion layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub gateway: PublicKey,
    pub timestamp: u64,
    pub signal: i32,
    /// Layer data decrypted by the challengee; must match the bytes recorded
    /// at challenge construction for its hop.
    pub data: Vec<u8>,
    pub origin: ReceiptOrigin,
    pub signature: Vec<u8>,
    /// Salted hash of the reporting address, stamped during ingestion when
    /// the address-hash filter is available.
    pub addr_hash: Option<Vec<u8>>,
}

impl Receipt {
    pub fn with_addr_hash(mut self, addr_hash: Vec<u8>) -> Self {
        self.addr_hash = Some(addr_hash);
        self
    }

    /// Bytes covered by the challengee's signature. The address hash is
    /// stamped after signing and is not part of the payload.
    pub fn signing_payload(&self) -> Result<Vec<u8>, CodecError> {
        let mut unsigned = self.clone();
        unsigned.signature = vec![];
        unsigned.addr_hash = None;
        Ok(bincode::serialize(&unsigned)?)
    }

    pub fn sign(mut self, keypair: &Keypair) -> Result<Self, CodecError> {
        let payload = self.signing_payload()?;
        self.signature = keypair.sign(&payload);
        Ok(self)
    }

    pub fn verify_signature(&self) -> bool {
        match self.signing_payload() {
            Ok(payload) => self.gateway.verify(&payload, &self.signature),
            Err(_) => false,
        }
    }
}

/// Third-party attestation from a gateway that overheard a hop's
/// transmission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Witness {
    pub gateway: PublicKey,
    pub timestamp: u64,
    pub signal: i32,
    pub snr: f32,
    pub frequency: f32,
    pub datarate: String,
    /// SHA-256 of the ciphertext layer the witness overheard; locates the
    /// hop inside the challenge.
    pub packet_hash: Hash256,
    pub signature: Vec<u8>,
}

impl Witness {
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
            Ok(payload) => self.gateway.verify(&payload, &self.signature),
            Err(_) => false,
        }
    }
}
