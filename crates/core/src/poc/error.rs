use poc_challenger_types::{CodecError, Hash256};

/// Outcomes of a `check_target` query that are not a yes/no answer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckTargetError {
    #[error("block not found")]
    BlockNotFound,
    #[error("invalid or expired poc")]
    InvalidOrExpiredPoc,
    #[error("mismatched block hash")]
    MismatchedBlockHash,
}

/// Why a challenge could not be initialized. The spawning task logs these
/// and abandons the challenge; no record is written.
#[derive(thiserror::Error, Debug)]
pub enum DerivationError {
    #[error("no populated hexes to target")]
    EmptyHexList,
    #[error("zone weights sum to zero")]
    ZoneWeightZero,
    #[error("no gateways found after {0} zone retries")]
    NoGatewaysFound(usize),
    #[error("path builder: {0}")]
    PathBuilder(anyhow::Error),
    #[error("onion builder: {0}")]
    OnionBuilder(anyhow::Error),
}

/// Local PoC store failures. `NotFound` is part of normal operation
/// (expired or foreign challenges) and never crosses the manager surface.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("no local poc for `{0}`")]
    NotFound(Hash256),
    #[error(transparent)]
    Db(#[from] sled::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
