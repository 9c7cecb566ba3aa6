use crate::interfaces::{
    BlockEvent, Ledger, OnionBuilder, PathBuilder, ReadChain, TxnSubmitter,
};
use crate::poc::addr_filter::{AddrHashCheck, AddrHashFilter};
use crate::poc::error::{CheckTargetError, StoreError};
use crate::poc::key_cache::KeyCacheWriter;
use crate::poc::store::PocStore;
use crate::poc::target::{self, Derivation};
use poc_challenger_config::constants::{
    BOOTSTRAP_RETRY, KEY_CACHE_GC_INTERVAL, POC_TIMEOUT, PUBLIC_POC_GC_INTERVAL,
};
use poc_challenger_config::{ChainVars, ChallengerConfig};
use poc_challenger_types::{
    Block, Hash256, Keypair, LocalPoc, PeerId, PocPathElement, PocReceiptsTxn, PublicKey,
    PublicPoc, Receipt, Witness,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Answer to a `check_target` query.
#[derive(Clone, Debug, PartialEq)]
pub enum TargetCheck {
    /// The challengee is the intended first hop; ships the onion so the
    /// caller can deliver it.
    Target { onion: Vec<u8> },
    NotTarget,
}

/// The single-writer coordinator for all challenges this validator owns.
///
/// All state mutation (local PoC store, key cache, address-hash filter) is
/// serialized through this actor: block events and peer reports are
/// processed one at a time, in arrival order. Target/path derivation is the
/// only work dispatched off-actor, because its inputs are immutable
/// snapshots and its output is keyed by a unique onion key hash.
pub struct ChallengeManager {
    validator: Keypair,
    store: PocStore,
    key_cache: KeyCacheWriter,
    addr_filter: AddrHashFilter,
    chain: Arc<dyn ReadChain>,
    ledger: Arc<dyn Ledger>,
    path_builder: Arc<dyn PathBuilder>,
    onion_builder: Arc<dyn OnionBuilder>,
    submitter: Arc<dyn TxnSubmitter>,
    command_receiver: mpsc::Receiver<Command>,
}

impl ChallengeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ChallengerConfig,
        validator: Keypair,
        store: PocStore,
        key_cache: KeyCacheWriter,
        chain: Arc<dyn ReadChain>,
        ledger: Arc<dyn Ledger>,
        path_builder: Arc<dyn PathBuilder>,
        onion_builder: Arc<dyn OnionBuilder>,
        submitter: Arc<dyn TxnSubmitter>,
    ) -> (Self, ChallengeManagerHandle) {
        let (command_sender, command_receiver) =
            mpsc::channel(config.command_channel_capacity.max(1));
        let this = Self {
            validator,
            store,
            key_cache,
            addr_filter: AddrHashFilter::new(),
            chain,
            ledger,
            path_builder,
            onion_builder,
            submitter,
            command_receiver,
        };
        let handle = ChallengeManagerHandle { command_sender };
        (this, handle)
    }

    /// Runs the manager until its channels close. Bootstraps by attaching
    /// to the block event source, retrying while the chain is unavailable.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut block_events = loop {
            match self.chain.subscribe().await {
                Ok(events) => break events,
                Err(err) => {
                    tracing::debug!(%err, "chain not available yet; retrying bootstrap");
                    tokio::time::sleep(BOOTSTRAP_RETRY).await;
                }
            }
        };
        tracing::debug!("challenge manager attached to block events");

        loop {
            tokio::select! {
                biased;
                event = block_events.recv() => {
                    let Some(BlockEvent { block, sync }) = event else {
                        tracing::trace!("block event stream closed; stopping challenge manager");
                        return Ok(());
                    };
                    self.process_block(block, sync).await;
                }
                command = self.command_receiver.recv() => {
                    let Some(command) = command else {
                        tracing::trace!("channel has been closed; stopping challenge manager");
                        return Ok(());
                    };
                    self.handle_command(command).await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::CachePocKey {
                onion_key_hash,
                receive_height,
                keypair,
            } => {
                self.key_cache.cache(onion_key_hash, receive_height, keypair);
            }
            Command::CheckTarget {
                challengee,
                block_hash,
                onion_key_hash,
                reply,
            } => {
                let result = self.check_target(challengee, block_hash, onion_key_hash).await;
                if reply.send(result).is_err() {
                    tracing::info!("failed to reply as receiver has been dropped");
                }
            }
            Command::Receipt {
                onion_key_hash,
                receipt,
                peer,
                peer_addr,
            } => self.ingest_receipt(onion_key_hash, receipt, peer, &peer_addr),
            Command::Witness {
                onion_key_hash,
                witness,
                peer,
            } => self.ingest_witness(onion_key_hash, witness, peer),
            Command::ActivePocs { reply } => {
                if reply.send(self.store.iter()).is_err() {
                    tracing::info!("failed to reply as receiver has been dropped");
                }
            }
        }
    }

    /// One non-sync block: refresh the filter, convert our ephemeral keys
    /// into challenges, submit what expired, garbage collect.
    async fn process_block(&mut self, block: Block, sync: bool) {
        let height = block.height();
        if sync {
            tracing::debug!(height, "ignoring block while node is synchronizing");
            return;
        }
        let vars = self.ledger.snapshot_vars();

        self.addr_filter
            .maybe_rebuild(&block, self.chain.as_ref(), self.ledger.as_ref(), &vars)
            .await;
        self.process_block_pocs(&block, height, &vars);
        self.submit_expired(height, &vars).await;

        if height % KEY_CACHE_GC_INTERVAL == 0 {
            self.gc_key_cache(height);
        }
        if height % PUBLIC_POC_GC_INTERVAL == 0 {
            self.gc_public_pocs(height);
        }
    }

    /// Every ephemeral key in the block gets a public PoC record; keys we
    /// own additionally spawn an initialization task.
    fn process_block_pocs(&self, block: &Block, height: u64, vars: &ChainVars) {
        for poc_key in block.poc_keys() {
            let record = PublicPoc {
                onion_key_hash: poc_key.onion_key_hash,
                challenger: poc_key.challenger,
                block_hash: block.hash(),
                start_height: height,
            };
            if let Err(err) = self.ledger.save_public_poc(record) {
                tracing::error!(
                    onion_key_hash = %poc_key.onion_key_hash,
                    %err,
                    "failed to save public poc record"
                );
            }

            let Some(cached) = self.key_cache.lookup(&poc_key.onion_key_hash) else {
                continue;
            };
            tracing::debug!(
                onion_key_hash = %poc_key.onion_key_hash,
                height,
                "our ephemeral key landed in a block; initializing challenge"
            );
            self.spawn_initializer(cached.keypair, block, height, vars.clone());
        }
    }

    /// Derivation runs off-actor: its inputs are immutable and the
    /// resulting record is keyed by a unique onion key hash, so no
    /// coordination with the actor is needed. There is no reply path; the
    /// task either persists or logs and exits.
    fn spawn_initializer(&self, keypair: Keypair, block: &Block, height: u64, vars: ChainVars) {
        let store = self.store.clone();
        let ledger = self.ledger.clone();
        let path_builder = self.path_builder.clone();
        let onion_builder = self.onion_builder.clone();
        let challenger = self.validator.public_key();
        let block_hash = block.hash();
        let block_time = block.time();
        tokio::spawn(async move {
            let derivation = Derivation {
                challenger,
                keys: &keypair,
                block_hash,
                block_height: height,
                block_time,
                ledger: ledger.as_ref(),
                vars: &vars,
                path_builder: path_builder.as_ref(),
                onion_builder: onion_builder.as_ref(),
            };
            match target::derive(&derivation) {
                Ok(poc) => {
                    let onion_key_hash = poc.onion_key_hash;
                    match store.put(&poc) {
                        Ok(()) => tracing::info!(
                            %onion_key_hash,
                            target = %poc.target,
                            hops = poc.path_len(),
                            "initialized challenge"
                        ),
                        Err(err) => tracing::error!(
                            %onion_key_hash,
                            %err,
                            "failed to persist initialized challenge"
                        ),
                    }
                }
                Err(err) => {
                    tracing::warn!(%block_hash, %err, "challenge initialization failed");
                }
            }
        });
    }

    async fn check_target(
        &self,
        challengee: PublicKey,
        block_hash: Hash256,
        onion_key_hash: Hash256,
    ) -> Result<TargetCheck, CheckTargetError> {
        if self.chain.get_block_by_hash(&block_hash).await.is_none() {
            return Err(CheckTargetError::BlockNotFound);
        }
        let poc = match self.store.get(&onion_key_hash) {
            Ok(poc) => poc,
            Err(StoreError::NotFound(_)) => return Err(CheckTargetError::InvalidOrExpiredPoc),
            Err(err) => {
                tracing::error!(%onion_key_hash, %err, "failed to load local poc");
                return Err(CheckTargetError::InvalidOrExpiredPoc);
            }
        };
        if poc.block_hash != block_hash {
            return Err(CheckTargetError::MismatchedBlockHash);
        }
        if poc.target == challengee {
            Ok(TargetCheck::Target { onion: poc.onion })
        } else {
            Ok(TargetCheck::NotTarget)
        }
    }

    /// Receipts are adversarial input: every rejection is logged and
    /// swallowed so the actor keeps making progress.
    fn ingest_receipt(
        &mut self,
        onion_key_hash: Hash256,
        receipt: Receipt,
        peer: PeerId,
        peer_addr: &str,
    ) {
        let gateway = receipt.gateway;
        if self.ledger.find_gateway_info(&gateway).is_none() {
            tracing::warn!(%onion_key_hash, %gateway, "receipt from unknown gateway");
            return;
        }
        if !receipt.verify_signature() {
            tracing::warn!(%onion_key_hash, %gateway, "receipt signature invalid");
            return;
        }
        let mut poc = match self.store.get(&onion_key_hash) {
            Ok(poc) => poc,
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(%onion_key_hash, "receipt for unknown or expired challenge");
                return;
            }
            Err(err) => {
                tracing::error!(%onion_key_hash, %err, "failed to load local poc");
                return;
            }
        };
        let Some(hop) = poc.hop_index(&gateway) else {
            tracing::warn!(%onion_key_hash, %gateway, "receipt gateway is not on the path");
            return;
        };
        if poc.challengees[hop].1 != receipt.data {
            tracing::warn!(%onion_key_hash, %gateway, hop, "receipt layer data mismatch");
            return;
        }
        if poc.receipts.contains_key(&gateway) {
            tracing::warn!(%onion_key_hash, %gateway, hop, "receipt already received");
            return;
        }

        let receipt = match self.addr_filter.check(peer_addr) {
            AddrHashCheck::Seen if hop == 0 => {
                // A replayed first hop is fatal: the first receipt must be
                // freshly obtainable or the whole challenge is worthless.
                tracing::warn!(
                    %onion_key_hash,
                    %gateway,
                    "first-hop receipt address already seen; discarding challenge"
                );
                if let Err(err) = self.store.delete(&onion_key_hash) {
                    tracing::error!(%onion_key_hash, %err, "failed to discard challenge");
                }
                return;
            }
            AddrHashCheck::Seen => {
                tracing::debug!(%onion_key_hash, %gateway, hop, "receipt address already seen");
                return;
            }
            AddrHashCheck::Unknown => receipt,
            AddrHashCheck::Fresh(addr_hash) => receipt.with_addr_hash(addr_hash),
        };

        poc.receipts.insert(gateway, (peer, receipt));
        if let Err(err) = self.store.put(&poc) {
            tracing::error!(%onion_key_hash, %err, "failed to persist receipt");
        } else {
            tracing::debug!(%onion_key_hash, %gateway, hop, "stored receipt");
        }
    }

    fn ingest_witness(&mut self, onion_key_hash: Hash256, witness: Witness, peer: PeerId) {
        let gateway = witness.gateway;
        let valid = self
            .ledger
            .find_gateway_info(&gateway)
            .is_some_and(|info| info.location.is_some());
        if !valid {
            tracing::warn!(%onion_key_hash, %gateway, "witness gateway unknown or unasserted");
            return;
        }
        if !witness.verify_signature() {
            tracing::warn!(%onion_key_hash, %gateway, "witness signature invalid");
            return;
        }
        let mut poc = match self.store.get(&onion_key_hash) {
            Ok(poc) => poc,
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(%onion_key_hash, "witness for unknown or expired challenge");
                return;
            }
            Err(err) => {
                tracing::error!(%onion_key_hash, %err, "failed to load local poc");
                return;
            }
        };
        let Some(hop) = poc.packet_hash_index(&witness.packet_hash) else {
            tracing::warn!(%onion_key_hash, %gateway, "witness for unknown layer");
            return;
        };
        if poc.challengees[hop].0 == gateway {
            tracing::warn!(%onion_key_hash, %gateway, hop, "dropping self-witness");
            return;
        }

        let max_witnesses = self.ledger.snapshot_vars().poc_per_hop_max_witnesses;
        let bucket = poc.witnesses.entry(witness.packet_hash).or_default();
        if bucket.len() >= max_witnesses {
            tracing::warn!(%onion_key_hash, %gateway, hop, "witness bucket full");
            return;
        }
        if bucket.iter().any(|(_, seen)| seen.gateway == gateway) {
            tracing::warn!(%onion_key_hash, %gateway, hop, "duplicate witness gateway");
            return;
        }
        // At most one entry per reporting peer.
        match bucket.iter_mut().find(|(entry_peer, _)| *entry_peer == peer) {
            Some(entry) => *entry = (peer, witness),
            None => bucket.push((peer, witness)),
        }

        if let Err(err) = self.store.put(&poc) {
            tracing::error!(%onion_key_hash, %err, "failed to persist witness");
        } else {
            tracing::debug!(%onion_key_hash, %gateway, hop, "stored witness");
        }
    }

    /// Submits and deletes every challenge past its TTL. A challenge that
    /// fails to submit stays in the store and is retried on the next block.
    async fn submit_expired(&mut self, height: u64, vars: &ChainVars) {
        for poc in self.store.iter() {
            if height.saturating_sub(poc.start_height) <= POC_TIMEOUT {
                continue;
            }
            let onion_key_hash = poc.onion_key_hash;
            if !vars.supports_receipts_txn() {
                tracing::warn!(
                    %onion_key_hash,
                    poc_version = vars.poc_version,
                    "chain does not support receipts transactions; dropping challenge"
                );
                if let Err(err) = self.store.delete(&onion_key_hash) {
                    tracing::error!(%onion_key_hash, %err, "failed to delete expired challenge");
                }
                continue;
            }

            let path = assemble_path(&poc);
            let receipts = path.iter().filter(|e| e.receipt.is_some()).count();
            let witnesses: usize = path.iter().map(|e| e.witnesses.len()).sum();
            let txn = PocReceiptsTxn::new(
                self.validator.public_key(),
                poc.secret.clone(),
                onion_key_hash,
                poc.block_hash,
                path,
            );
            let txn = match txn.sign(&self.validator) {
                Ok(txn) => txn,
                Err(err) => {
                    tracing::error!(%onion_key_hash, %err, "failed to sign receipts transaction");
                    continue;
                }
            };
            match self.submitter.submit(txn).await {
                Ok(()) => {
                    tracing::info!(
                        %onion_key_hash,
                        height,
                        receipts,
                        witnesses,
                        "submitted receipts transaction"
                    );
                    if let Err(err) = self.store.delete(&onion_key_hash) {
                        tracing::error!(
                            %onion_key_hash,
                            %err,
                            "failed to delete submitted challenge"
                        );
                    }
                }
                Err(err) => {
                    tracing::error!(%onion_key_hash, %err, "failed to submit receipts transaction");
                }
            }
        }
    }

    fn gc_key_cache(&self, height: u64) {
        let mut dropped = 0usize;
        for (hash, entry) in self.key_cache.entries() {
            if height.saturating_sub(entry.receive_height) > POC_TIMEOUT {
                self.key_cache.delete(&hash);
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!(height, dropped, "garbage collected key cache");
        }
    }

    fn gc_public_pocs(&self, height: u64) {
        let mut dropped = 0usize;
        for record in self.ledger.active_public_pocs() {
            if height.saturating_sub(record.start_height) > POC_TIMEOUT {
                if let Err(err) = self.ledger.delete_public_poc(&record.onion_key_hash) {
                    tracing::error!(
                        onion_key_hash = %record.onion_key_hash,
                        %err,
                        "failed to delete public poc record"
                    );
                } else {
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            tracing::debug!(height, dropped, "garbage collected public poc records");
        }
    }
}

/// Builds the submitted path in challenge order. Witnesses that duplicate
/// the challengee or arrive from the same peer as the hop's receipt are
/// excluded.
fn assemble_path(poc: &LocalPoc) -> Vec<PocPathElement> {
    poc.challengees
        .iter()
        .zip(&poc.packet_hashes)
        .map(|((challengee, _), (_, layer_hash))| {
            let receipt_entry = poc.receipts.get(challengee);
            let receipt_peer = receipt_entry.map(|(peer, _)| *peer);
            let receipt = receipt_entry.map(|(_, receipt)| receipt.clone());
            let witnesses = poc
                .witnesses
                .get(layer_hash)
                .map(|bucket| {
                    bucket
                        .iter()
                        .filter(|(peer, witness)| {
                            witness.gateway != *challengee && Some(*peer) != receipt_peer
                        })
                        .map(|(_, witness)| witness.clone())
                        .collect()
                })
                .unwrap_or_default();
            PocPathElement {
                challengee: *challengee,
                receipt,
                witnesses,
            }
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct ChallengeManagerHandle {
    command_sender: mpsc::Sender<Command>,
}

impl ChallengeManagerHandle {
    /// Remember an ephemeral keypair we proposed. Routed through the actor
    /// so the key cache keeps its single-writer contract.
    pub async fn cache_poc_key(
        &self,
        onion_key_hash: Hash256,
        receive_height: u64,
        keypair: Keypair,
    ) -> Result<(), mpsc::error::SendError<Command>> {
        self.command_sender
            .send(Command::CachePocKey {
                onion_key_hash,
                receive_height,
                keypair,
            })
            .await
    }

    /// Ask whether `challengee` is the intended first hop for the given
    /// challenge. Waits for the answer; the inner result carries the
    /// query-level errors.
    pub async fn check_target_sync(
        &self,
        challengee: PublicKey,
        block_hash: Hash256,
        onion_key_hash: Hash256,
    ) -> anyhow::Result<Result<TargetCheck, CheckTargetError>> {
        let (reply, response_receiver) = oneshot::channel();
        self.command_sender
            .send(Command::CheckTarget {
                challengee,
                block_hash,
                onion_key_hash,
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("failed to check target as challenge manager is dropped"))?;
        match response_receiver.await {
            Ok(result) => Ok(result),
            Err(_) => anyhow::bail!("failed to check target as challenge manager is dropped"),
        }
    }

    /// Report a receipt for ingestion. Fire-and-forget: invalid reports are
    /// dropped by the manager.
    pub async fn report_receipt(
        &self,
        onion_key_hash: Hash256,
        receipt: Receipt,
        peer: PeerId,
        peer_addr: String,
    ) -> Result<(), mpsc::error::SendError<Command>> {
        self.command_sender
            .send(Command::Receipt {
                onion_key_hash,
                receipt,
                peer,
                peer_addr,
            })
            .await
    }

    /// Report a witness for ingestion. Fire-and-forget.
    pub async fn report_witness(
        &self,
        onion_key_hash: Hash256,
        witness: Witness,
        peer: PeerId,
    ) -> Result<(), mpsc::error::SendError<Command>> {
        self.command_sender
            .send(Command::Witness {
                onion_key_hash,
                witness,
                peer,
            })
            .await
    }

    /// Snapshot of every in-flight challenge. Waits for the reply.
    pub async fn active_pocs_sync(&self) -> anyhow::Result<Vec<LocalPoc>> {
        let (reply, response_receiver) = oneshot::channel();
        self.command_sender
            .send(Command::ActivePocs { reply })
            .await
            .map_err(|_| {
                anyhow::anyhow!("failed to list active pocs as challenge manager is dropped")
            })?;
        match response_receiver.await {
            Ok(pocs) => Ok(pocs),
            Err(_) => anyhow::bail!("failed to list active pocs as challenge manager is dropped"),
        }
    }
}

#[derive(Debug)]
pub enum Command {
    CachePocKey {
        onion_key_hash: Hash256,
        receive_height: u64,
        keypair: Keypair,
    },
    CheckTarget {
        challengee: PublicKey,
        block_hash: Hash256,
        onion_key_hash: Hash256,
        reply: oneshot::Sender<Result<TargetCheck, CheckTargetError>>,
    },
    Receipt {
        onion_key_hash: Hash256,
        receipt: Receipt,
        peer: PeerId,
        peer_addr: String,
    },
    Witness {
        onion_key_hash: Hash256,
        witness: Witness,
        peer: PeerId,
    },
    ActivePocs {
        reply: oneshot::Sender<Vec<LocalPoc>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{signed_receipt, signed_witness};
    use rand::rngs::OsRng;

    // Path assembly is pure; exercised here without the actor.
    #[test]
    fn assemble_path_filters_witnesses() {
        let ephemeral = Keypair::generate(&mut OsRng);
        let hop0 = Keypair::generate(&mut OsRng);
        let hop1 = Keypair::generate(&mut OsRng);
        let observer = Keypair::generate(&mut OsRng);
        let layer0 = Hash256::digest(b"layer-0");
        let layer1 = Hash256::digest(b"layer-1");

        let receipt_peer = PeerId::from_bytes([1u8; 32]);
        let other_peer = PeerId::from_bytes([2u8; 32]);

        let receipts = maplit::btreemap! {
            hop0.public_key() => (receipt_peer, signed_receipt(&hop0, vec![0x01, 0x02])),
        };
        let witnesses = maplit::btreemap! {
            layer0 => vec![
                // Same peer as the hop's receipt: excluded.
                (receipt_peer, signed_witness(&observer, layer0)),
                // Challengee witnessing itself: excluded.
                (other_peer, signed_witness(&hop0, layer0)),
            ],
            layer1 => vec![(other_peer, signed_witness(&observer, layer1))],
        };

        let poc = LocalPoc {
            onion_key_hash: ephemeral.onion_key_hash(),
            block_hash: Hash256::digest(b"block"),
            start_height: 10,
            secret: ephemeral.secret_bytes(),
            keys: ephemeral,
            target: hop0.public_key(),
            onion: vec![],
            challengees: vec![
                (hop0.public_key(), vec![0x01, 0x02]),
                (hop1.public_key(), vec![0x03, 0x04]),
            ],
            packet_hashes: vec![(hop0.public_key(), layer0), (hop1.public_key(), layer1)],
            receipts,
            witnesses,
        };

        let path = assemble_path(&poc);
        assert_eq!(path.len(), 2);
        assert!(path[0].receipt.is_some());
        assert!(path[0].witnesses.is_empty());
        assert!(path[1].receipt.is_none());
        assert_eq!(path[1].witnesses.len(), 1);
        assert_eq!(path[1].witnesses[0].gateway, observer.public_key());
    }
}
