//! Protocol constants. These are fixed by the protocol rather than chain
//! variables and never change at runtime.

use std::time::Duration;

/// Maximum number of blocks during which receipts and witnesses are
/// collected; a challenge older than this is submitted and deleted.
pub const POC_TIMEOUT: u64 = 4;

/// False-positive rate the address-hash bloom filter is sized for.
pub const ADDR_HASH_FP_RATE: f64 = 1e-9;

/// Argon2 salt length used by the address-hash construction.
pub const SALTBYTES: usize = 16;

/// Key-cache entries are garbage collected every this many blocks.
pub const KEY_CACHE_GC_INTERVAL: u64 = 50;

/// Public PoC ledger records are garbage collected every this many blocks.
pub const PUBLIC_POC_GC_INTERVAL: u64 = 100;

/// Delay before retrying bootstrap while the chain is not yet available.
pub const BOOTSTRAP_RETRY: Duration = Duration::from_millis(500);

/// Per-hop layer data width in bytes; the leading fragment doubles as the
/// 16-bit onion IV.
pub const LAYER_DATA_LENGTH: usize = 2;
