//! In-memory doubles for the external collaborators, used by unit tests
//! across the crate.

#![cfg(test)]

use crate::interfaces::{
    BlockEvent, GatewayInfo, GatewayMode, HexId, Ledger, OnionBuilder, PathBuilder, ReadChain,
    TxnSubmitter,
};
use async_trait::async_trait;
use poc_challenger_config::ChainVars;
use poc_challenger_types::{
    Block, Hash256, Keypair, PocKey, PocReceiptsTxn, PublicKey, PublicPoc,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::{mpsc, Mutex};

/// A manually driven chain: tests push blocks, subscribers receive events.
#[derive(Clone)]
pub struct TestChain {
    inner: Arc<Mutex<TestChainInner>>,
}

struct TestChainInner {
    available: bool,
    by_height: BTreeMap<u64, Block>,
    by_hash: HashMap<Hash256, Block>,
    subscribers: Vec<mpsc::Sender<BlockEvent>>,
}

impl TestChain {
    pub fn new(available: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TestChainInner {
                available,
                by_height: BTreeMap::new(),
                by_hash: HashMap::new(),
                subscribers: Vec::new(),
            })),
        }
    }

    pub async fn make_available(&self) {
        self.inner.lock().await.available = true;
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }

    /// Appends a block and delivers it to all subscribers.
    pub async fn push_block(
        &self,
        poc_keys: Vec<PocKey>,
        receipt_txns: Vec<PocReceiptsTxn>,
    ) -> Block {
        self.push(poc_keys, receipt_txns, false).await
    }

    /// Same as [`Self::push_block`] but flagged as a sync block.
    pub async fn push_sync_block(
        &self,
        poc_keys: Vec<PocKey>,
        receipt_txns: Vec<PocReceiptsTxn>,
    ) -> Block {
        self.push(poc_keys, receipt_txns, true).await
    }

    async fn push(
        &self,
        poc_keys: Vec<PocKey>,
        receipt_txns: Vec<PocReceiptsTxn>,
        sync: bool,
    ) -> Block {
        let (block, subscribers) = {
            let mut inner = self.inner.lock().await;
            let height = inner.by_height.keys().next_back().copied().unwrap_or(0) + 1;
            let hash = Hash256::digest(format!("test-block-{height}"));
            let block = Block::new(hash, height, 1_700_000_000 + height, poc_keys, receipt_txns);
            inner.by_height.insert(height, block.clone());
            inner.by_hash.insert(hash, block.clone());
            (block, inner.subscribers.clone())
        };
        for subscriber in subscribers {
            let _ = subscriber
                .send(BlockEvent {
                    block: block.clone(),
                    sync,
                })
                .await;
        }
        block
    }
}

#[async_trait]
impl ReadChain for TestChain {
    async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<BlockEvent>> {
        let mut inner = self.inner.lock().await;
        if !inner.available {
            anyhow::bail!("chain not started");
        }
        let (sender, receiver) = mpsc::channel(64);
        inner.subscribers.push(sender);
        Ok(receiver)
    }

    async fn get_block_by_hash(&self, hash: &Hash256) -> Option<Block> {
        self.inner.lock().await.by_hash.get(hash).cloned()
    }

    async fn get_block_by_height(&self, height: u64) -> Option<Block> {
        self.inner.lock().await.by_height.get(&height).cloned()
    }
}

/// Ledger double over ordered maps so every read is deterministic.
#[derive(Default)]
pub struct MemoryLedger {
    inner: RwLock<LedgerInner>,
}

#[derive(Default)]
struct LedgerInner {
    height: u64,
    vars: ChainVars,
    gateways: BTreeMap<PublicKey, GatewayInfo>,
    hex_index: BTreeMap<HexId, BTreeSet<PublicKey>>,
    public_pocs: BTreeMap<Hash256, PublicPoc>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LedgerInner {
                height: 1,
                vars: ChainVars::default(),
                gateways: BTreeMap::new(),
                hex_index: BTreeMap::new(),
                public_pocs: BTreeMap::new(),
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LedgerInner> {
        self.inner.read().expect("MemoryLedger lock is poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, LedgerInner> {
        self.inner.write().expect("MemoryLedger lock is poisoned")
    }

    pub fn set_vars(&self, vars: ChainVars) {
        self.write().vars = vars;
    }

    pub fn set_height(&self, height: u64) {
        self.write().height = height;
    }

    /// A gateway homed in `hex` and present in the targeting index.
    pub fn add_gateway(
        &self,
        gateway: PublicKey,
        hex: HexId,
        mode: GatewayMode,
        last_poc_challenge: Option<u64>,
    ) {
        let mut inner = self.write();
        inner.gateways.insert(
            gateway,
            GatewayInfo {
                mode,
                location: Some(hex),
                last_poc_challenge,
            },
        );
        inner.hex_index.entry(hex).or_default().insert(gateway);
    }

    /// A gateway with an asserted location that never appears in the
    /// targeting index; useful as a path hop or witness.
    pub fn add_relay_gateway(&self, gateway: PublicKey, hex: HexId, mode: GatewayMode) {
        self.write().gateways.insert(
            gateway,
            GatewayInfo {
                mode,
                location: Some(hex),
                last_poc_challenge: None,
            },
        );
    }

    /// A known gateway without an asserted location.
    pub fn add_unasserted_gateway(&self, gateway: PublicKey, mode: GatewayMode) {
        self.write().gateways.insert(
            gateway,
            GatewayInfo {
                mode,
                location: None,
                last_poc_challenge: None,
            },
        );
    }

    pub fn public_poc(&self, onion_key_hash: &Hash256) -> Option<PublicPoc> {
        self.read().public_pocs.get(onion_key_hash).cloned()
    }
}

impl Ledger for MemoryLedger {
    fn current_height(&self) -> u64 {
        self.read().height
    }

    fn snapshot_vars(&self) -> ChainVars {
        self.read().vars.clone()
    }

    fn gateway_count(&self) -> usize {
        self.read().gateways.len()
    }

    fn populated_hexes(&self) -> Vec<(HexId, u64)> {
        self.read()
            .hex_index
            .iter()
            .filter(|(_, gateways)| !gateways.is_empty())
            .map(|(hex, gateways)| (*hex, gateways.len() as u64))
            .collect()
    }

    fn random_targeting_hex(&self, rng: &mut dyn RngCore) -> Option<HexId> {
        let inner = self.read();
        let hexes: Vec<HexId> = inner.hex_index.keys().copied().collect();
        if hexes.is_empty() {
            return None;
        }
        let index = (rng.next_u64() % hexes.len() as u64) as usize;
        Some(hexes[index])
    }

    fn count_gateways_in_hex(&self, hex: HexId) -> u64 {
        self.read()
            .hex_index
            .get(&hex)
            .map(|gateways| gateways.len() as u64)
            .unwrap_or(0)
    }

    fn gateways_in_hex(&self, hex: HexId) -> Vec<PublicKey> {
        self.read()
            .hex_index
            .get(&hex)
            .map(|gateways| gateways.iter().copied().collect())
            .unwrap_or_default()
    }

    fn find_gateway_info(&self, gateway: &PublicKey) -> Option<GatewayInfo> {
        self.read().gateways.get(gateway).copied()
    }

    fn remove_gateway_from_hex_index(&self, hex: HexId, gateway: &PublicKey) {
        let mut inner = self.write();
        if let Some(gateways) = inner.hex_index.get_mut(&hex) {
            gateways.remove(gateway);
            if gateways.is_empty() {
                inner.hex_index.remove(&hex);
            }
        }
    }

    fn save_public_poc(&self, poc: PublicPoc) -> anyhow::Result<()> {
        self.write().public_pocs.insert(poc.onion_key_hash, poc);
        Ok(())
    }

    fn delete_public_poc(&self, onion_key_hash: &Hash256) -> anyhow::Result<()> {
        self.write().public_pocs.remove(onion_key_hash);
        Ok(())
    }

    fn active_public_pocs(&self) -> Vec<PublicPoc> {
        self.read().public_pocs.values().cloned().collect()
    }
}

/// Path builder with a configurable shape: an explicit path per target or a
/// shared tail of extra hops appended after the target.
#[derive(Default)]
pub struct StaticPathBuilder {
    inner: StdMutex<PathConfig>,
}

#[derive(Default)]
struct PathConfig {
    paths: HashMap<PublicKey, Vec<PublicKey>>,
    extra_hops: Vec<PublicKey>,
}

impl StaticPathBuilder {
    pub fn set_path(&self, target: PublicKey, path: Vec<PublicKey>) {
        self.inner.lock().unwrap().paths.insert(target, path);
    }

    pub fn set_extra_hops(&self, hops: Vec<PublicKey>) {
        self.inner.lock().unwrap().extra_hops = hops;
    }
}

impl PathBuilder for StaticPathBuilder {
    fn build(
        &self,
        target: PublicKey,
        _rng: &mut dyn RngCore,
        _ledger: &dyn Ledger,
        _block_time: u64,
        _vars: &ChainVars,
    ) -> anyhow::Result<Vec<PublicKey>> {
        let config = self.inner.lock().unwrap();
        if let Some(path) = config.paths.get(&target) {
            return Ok(path.clone());
        }
        let mut path = vec![target];
        path.extend(config.extra_hops.iter().copied().filter(|hop| *hop != target));
        Ok(path)
    }
}

/// Deterministic stand-in for the onion packet codec: each layer is a
/// digest over the keys, IV, block hash, layer index and the hop list.
pub struct HashOnionBuilder;

impl OnionBuilder for HashOnionBuilder {
    fn build(
        &self,
        keys: &Keypair,
        iv: u16,
        hops: &[(PublicKey, Vec<u8>)],
        block_hash: &Hash256,
        _ledger: &dyn Ledger,
    ) -> anyhow::Result<(Vec<u8>, Vec<Vec<u8>>)> {
        let mut layers = Vec::with_capacity(hops.len() + 1);
        for index in 0..=hops.len() {
            let mut hasher = Sha256::new();
            hasher.update(keys.public_key().as_bytes());
            hasher.update(iv.to_le_bytes());
            hasher.update(block_hash.as_bytes());
            hasher.update([index as u8]);
            for (gateway, data) in hops {
                hasher.update(gateway.as_bytes());
                hasher.update(data);
            }
            layers.push(hasher.finalize().to_vec());
        }
        Ok((layers[0].clone(), layers))
    }
}

pub fn peer(tag: u8) -> poc_challenger_types::PeerId {
    poc_challenger_types::PeerId::from_bytes([tag; 32])
}

pub fn signed_receipt(keys: &Keypair, data: Vec<u8>) -> poc_challenger_types::Receipt {
    poc_challenger_types::Receipt {
        gateway: keys.public_key(),
        timestamp: 1,
        signal: -80,
        data,
        origin: poc_challenger_types::ReceiptOrigin::Radio,
        signature: vec![],
        addr_hash: None,
    }
    .sign(keys)
    .unwrap()
}

pub fn signed_witness(keys: &Keypair, packet_hash: Hash256) -> poc_challenger_types::Witness {
    poc_challenger_types::Witness {
        gateway: keys.public_key(),
        timestamp: 2,
        signal: -110,
        snr: 1.0,
        frequency: 904.7,
        datarate: "SF8BW125".to_string(),
        packet_hash,
        signature: vec![],
    }
    .sign(keys)
    .unwrap()
}

/// Records submitted transactions; can be told to fail.
#[derive(Default)]
pub struct CapturingSubmitter {
    sent: StdMutex<Vec<PocReceiptsTxn>>,
    fail: AtomicBool,
}

impl CapturingSubmitter {
    pub fn sent(&self) -> Vec<PocReceiptsTxn> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TxnSubmitter for CapturingSubmitter {
    async fn submit(&self, txn: PocReceiptsTxn) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("submission rejected");
        }
        self.sent.lock().unwrap().push(txn);
        Ok(())
    }
}
