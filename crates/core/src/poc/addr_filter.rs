use crate::interfaces::{Ledger, ReadChain};
use argon2::Argon2;
use bloomfilter::Bloom;
use poc_challenger_config::constants::{ADDR_HASH_FP_RATE, SALTBYTES};
use poc_challenger_config::ChainVars;
use poc_challenger_types::Block;
use std::net::SocketAddr;

/// Verdict on a reporting peer's address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddrHashCheck {
    /// The address hash was observed before: possible replay or collocation.
    Seen,
    /// First observation; the hash so the caller can stamp it on the receipt.
    Fresh(Vec<u8>),
    /// Filter disabled, address not IPv4, or hashing failed.
    Unknown,
}

/// Bloom-backed set of receipt address hashes observed during the current
/// challenge interval. Manager-local: rebuilt when the epoch advances,
/// applied incrementally within it.
pub struct AddrHashFilter {
    inner: Option<Inner>,
}

struct Inner {
    /// First block of the challenge-interval epoch this filter covers.
    start_height: u64,
    /// Latest block folded into the bloom.
    reference_height: u64,
    /// Width of the stored address hashes.
    byte_count: usize,
    /// Leading bytes of the hash of the block at `start_height`.
    salt: [u8; SALTBYTES],
    bloom: Bloom<Vec<u8>>,
}

impl Inner {
    fn apply_block(&mut self, block: &Block) {
        for txn in block.receipt_txns() {
            for addr_hash in txn.receipt_addr_hashes() {
                self.bloom.set(&addr_hash.to_vec());
            }
        }
    }
}

impl Default for AddrHashFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl AddrHashFilter {
    pub fn new() -> Self {
        Self { inner: None }
    }

    /// Brings the filter up to date with `tip`. Called once per non-sync
    /// block, before any receipt for that block interval is ingested.
    pub async fn maybe_rebuild(
        &mut self,
        tip: &Block,
        chain: &dyn ReadChain,
        ledger: &dyn Ledger,
        vars: &ChainVars,
    ) {
        let (byte_count, interval) = match (
            vars.poc_addr_hash_byte_count,
            vars.poc_challenge_interval,
        ) {
            (Some(byte_count), Some(interval)) if interval > 0 => (byte_count, interval),
            _ => {
                self.inner = None;
                return;
            }
        };

        let height = tip.height();
        let start = std::cmp::max(1, height - height % interval);
        match &mut self.inner {
            Some(inner) if inner.start_height == start => {
                if height > inner.reference_height {
                    inner.apply_block(tip);
                    inner.reference_height = height;
                }
            }
            _ => self.rebuild(start, byte_count, tip, chain, ledger).await,
        }
    }

    async fn rebuild(
        &mut self,
        start: u64,
        byte_count: usize,
        tip: &Block,
        chain: &dyn ReadChain,
        ledger: &dyn Ledger,
    ) {
        let height = tip.height();
        let salt_hash = if start == height {
            Some(tip.hash())
        } else {
            chain.get_block_by_height(start).await.map(|block| block.hash())
        };
        let Some(salt_hash) = salt_hash else {
            tracing::warn!(start, "epoch start block not found; disabling address filter");
            self.inner = None;
            return;
        };
        let mut salt = [0u8; SALTBYTES];
        salt.copy_from_slice(&salt_hash.as_bytes()[..SALTBYTES]);

        let mut inner = Inner {
            start_height: start,
            reference_height: height,
            byte_count,
            salt,
            bloom: Bloom::new_for_fp_rate(ledger.gateway_count().max(1), ADDR_HASH_FP_RATE),
        };
        // Fold the epoch so far, newest block first.
        for h in (start..=height).rev() {
            if h == height {
                inner.apply_block(tip);
                continue;
            }
            match chain.get_block_by_height(h).await {
                Some(block) => inner.apply_block(&block),
                None => tracing::warn!(height = h, "missing block during filter fold"),
            }
        }
        tracing::debug!(start, height, "rebuilt address-hash filter");
        self.inner = Some(inner);
    }

    /// Checks (and records) the reporting peer's address.
    pub fn check(&mut self, peer_addr: &str) -> AddrHashCheck {
        let Some(inner) = &mut self.inner else {
            return AddrHashCheck::Unknown;
        };
        let addr: SocketAddr = match peer_addr.parse() {
            Ok(addr) => addr,
            Err(_) => return AddrHashCheck::Unknown,
        };
        let SocketAddr::V4(addr) = addr else {
            return AddrHashCheck::Unknown;
        };

        let mut out = [0u8; 32];
        if let Err(err) =
            Argon2::default().hash_password_into(&addr.ip().octets(), &inner.salt, &mut out)
        {
            tracing::warn!(%err, "address hashing failed");
            return AddrHashCheck::Unknown;
        }
        let hash = out[..inner.byte_count.min(out.len())].to_vec();
        if inner.bloom.check_and_set(&hash) {
            AddrHashCheck::Seen
        } else {
            AddrHashCheck::Fresh(hash)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Epoch start of the current filter, if one is built.
    pub fn start_height(&self) -> Option<u64> {
        self.inner.as_ref().map(|inner| inner.start_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryLedger, TestChain};
    use std::sync::Arc;

    fn vars() -> ChainVars {
        ChainVars {
            poc_addr_hash_byte_count: Some(8),
            poc_challenge_interval: Some(10),
            ..ChainVars::default()
        }
    }

    #[tokio::test]
    async fn disabled_without_vars() {
        let chain = TestChain::new(true);
        let ledger = Arc::new(MemoryLedger::new());
        let tip = chain.push_block(vec![], vec![]).await;

        let mut filter = AddrHashFilter::new();
        let mut disabled = vars();
        disabled.poc_challenge_interval = None;
        filter.maybe_rebuild(&tip, &chain, ledger.as_ref(), &disabled).await;

        assert!(!filter.is_enabled());
        assert_eq!(filter.check("10.0.0.1:44158"), AddrHashCheck::Unknown);
    }

    #[tokio::test]
    async fn fresh_then_seen() {
        let chain = TestChain::new(true);
        let ledger = Arc::new(MemoryLedger::new());
        let tip = chain.push_block(vec![], vec![]).await;

        let mut filter = AddrHashFilter::new();
        filter.maybe_rebuild(&tip, &chain, ledger.as_ref(), &vars()).await;
        assert!(filter.is_enabled());

        let first = filter.check("192.168.1.7:44158");
        let hash = match first {
            AddrHashCheck::Fresh(hash) => hash,
            other => panic!("expected fresh, got {other:?}"),
        };
        assert_eq!(hash.len(), 8);
        assert_eq!(filter.check("192.168.1.7:44158"), AddrHashCheck::Seen);
        // A different address gets a different hash.
        match filter.check("192.168.1.8:44158") {
            AddrHashCheck::Fresh(other) => assert_ne!(other, hash),
            other => panic!("expected fresh, got {other:?}"),
        }
    }

    #[test_case::test_case("[2001:db8::1]:44158" ; "ipv6 address")]
    #[test_case::test_case("not-an-address" ; "unparseable address")]
    #[test_case::test_case("10.0.0.1" ; "missing port")]
    #[tokio::test]
    async fn non_ipv4_is_unknown(peer_addr: &str) {
        let chain = TestChain::new(true);
        let ledger = Arc::new(MemoryLedger::new());
        let tip = chain.push_block(vec![], vec![]).await;

        let mut filter = AddrHashFilter::new();
        filter.maybe_rebuild(&tip, &chain, ledger.as_ref(), &vars()).await;

        assert_eq!(filter.check(peer_addr), AddrHashCheck::Unknown);
    }

    #[tokio::test]
    async fn rebuilds_on_epoch_advance() {
        let chain = TestChain::new(true);
        let ledger = Arc::new(MemoryLedger::new());
        let mut filter = AddrHashFilter::new();

        let mut tip = chain.push_block(vec![], vec![]).await;
        for _ in 0..8 {
            tip = chain.push_block(vec![], vec![]).await;
        }
        filter.maybe_rebuild(&tip, &chain, ledger.as_ref(), &vars()).await;
        // Height 9 is still inside the first epoch (start = 1).
        assert_eq!(filter.start_height(), Some(1));

        let tip = chain.push_block(vec![], vec![]).await;
        filter.maybe_rebuild(&tip, &chain, ledger.as_ref(), &vars()).await;
        assert_eq!(filter.start_height(), Some(10));
    }

    #[tokio::test]
    async fn fold_picks_up_submitted_addr_hashes() {
        use poc_challenger_types::{
            Hash256, Keypair, PocPathElement, PocReceiptsTxn, Receipt, ReceiptOrigin,
        };
        use rand::rngs::OsRng;

        let chain = TestChain::new(true);
        let ledger = Arc::new(MemoryLedger::new());

        // Compute the hash the filter would assign to this address.
        let mut filter = AddrHashFilter::new();
        let tip = chain.push_block(vec![], vec![]).await;
        filter.maybe_rebuild(&tip, &chain, ledger.as_ref(), &vars()).await;
        let addr_hash = match filter.check("10.1.2.3:44158") {
            AddrHashCheck::Fresh(hash) => hash,
            other => panic!("expected fresh, got {other:?}"),
        };

        // A later block carries a receipts transaction with that hash.
        let gateway = Keypair::generate(&mut OsRng);
        let receipt = Receipt {
            gateway: gateway.public_key(),
            timestamp: 1,
            signal: -70,
            data: vec![0x01, 0x02],
            origin: ReceiptOrigin::P2p,
            signature: vec![],
            addr_hash: Some(addr_hash),
        };
        let txn = PocReceiptsTxn::new(
            gateway.public_key(),
            vec![],
            Hash256::digest(b"okh"),
            tip.hash(),
            vec![PocPathElement {
                challengee: gateway.public_key(),
                receipt: Some(receipt),
                witnesses: vec![],
            }],
        );
        let tip = chain.push_block(vec![], vec![txn]).await;

        // A fresh filter folding the chain must already contain the hash.
        let mut rebuilt = AddrHashFilter::new();
        rebuilt.maybe_rebuild(&tip, &chain, ledger.as_ref(), &vars()).await;
        assert_eq!(rebuilt.check("10.1.2.3:44158"), AddrHashCheck::Seen);
    }
}
