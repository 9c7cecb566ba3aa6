//! Deterministic target and path derivation.
//!
//! Zone selection is seeded from public data (onion key hash and block
//! hash) so anyone can verify it; the target pick within the zone is seeded
//! from the ephemeral secret so only the key owner can pre-compute it.

mod v4;
mod v6;

use crate::interfaces::{HexId, Ledger, OnionBuilder, PathBuilder};
use crate::poc::error::DerivationError;
use poc_challenger_config::constants::LAYER_DATA_LENGTH;
use poc_challenger_config::ChainVars;
use poc_challenger_types::{Hash256, Keypair, LocalPoc, PublicKey};
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Inputs to a single challenge derivation. Everything here is immutable
/// for the duration of the call, which is what makes it safe to run off the
/// manager actor.
pub struct Derivation<'a> {
    pub challenger: PublicKey,
    pub keys: &'a Keypair,
    pub block_hash: Hash256,
    pub block_height: u64,
    pub block_time: u64,
    pub ledger: &'a dyn Ledger,
    pub vars: &'a ChainVars,
    pub path_builder: &'a dyn PathBuilder,
    pub onion_builder: &'a dyn OnionBuilder,
}

/// Version-selected zone source. v4 enumerates every populated hex; v6
/// samples a bounded random pool and prunes filtered-out gateways from the
/// hex index.
trait TargetEngine: Send + Sync {
    /// Candidate zones with their gateway counts, ordered by hex id.
    fn zones(
        &self,
        ledger: &dyn Ledger,
        vars: &ChainVars,
        rng: &mut ChaCha20Rng,
    ) -> Vec<(HexId, u64)>;

    /// Invoked after candidate filtering with the gateways removed from
    /// `zone`.
    fn prune_hex_index(&self, ledger: &dyn Ledger, zone: HexId, removed: &[PublicKey]);
}

fn engine_for(vars: &ChainVars) -> &'static dyn TargetEngine {
    if vars.uses_hex_pool_sampling() {
        &v6::HexPoolV6
    } else {
        &v4::HexPoolV4
    }
}

/// Runs the full derivation: zone, target, path, layer data, onion.
pub fn derive(d: &Derivation<'_>) -> Result<LocalPoc, DerivationError> {
    let onion_key_hash = d.keys.onion_key_hash();
    let mut entropy = Vec::with_capacity(64);
    entropy.extend_from_slice(onion_key_hash.as_bytes());
    entropy.extend_from_slice(d.block_hash.as_bytes());

    let mut zone_rand = ChaCha20Rng::from_seed(Sha256::digest(&entropy).into());
    let mut target_rand = ChaCha20Rng::from_seed(Sha256::digest(d.keys.secret_seed()).into());

    let engine = engine_for(d.vars);
    let zones = engine.zones(d.ledger, d.vars, &mut zone_rand);
    if zones.is_empty() {
        return Err(DerivationError::EmptyHexList);
    }

    // Reselect the zone with the threaded RNG until one yields candidates;
    // bounded by the target pool size.
    let max_attempts = d.vars.poc_target_pool_size.max(1);
    let mut survivors = Vec::new();
    for _ in 0..max_attempts {
        let (zone, _) = *icdf_select(&zones, |(_, count)| *count as f64, &mut zone_rand)?;
        let mut candidates = d.ledger.gateways_in_hex(zone);
        candidates.sort_unstable();
        if let Some(limit) = d.vars.poc_witness_consideration_limit {
            candidates = deterministic_subset(limit, &mut zone_rand, candidates);
        }
        let (kept, removed) = filter_candidates(d, &candidates);
        engine.prune_hex_index(d.ledger, zone, &removed);
        if !kept.is_empty() {
            survivors = kept;
            break;
        }
    }
    if survivors.is_empty() {
        return Err(DerivationError::NoGatewaysFound(max_attempts));
    }

    // Every survivor carries the identical randomness weight; the draw is
    // still threaded through TargetRand so the pick needs the secret.
    let weight = d.vars.poc_v5_target_prob_randomness_wt;
    let target = *icdf_select(&survivors, |_| weight, &mut target_rand)?;

    let path = d
        .path_builder
        .build(target, &mut target_rand, d.ledger, d.block_time, d.vars)
        .map_err(DerivationError::PathBuilder)?;
    if path.first() != Some(&target) {
        return Err(DerivationError::PathBuilder(anyhow::anyhow!(
            "path does not start at the target"
        )));
    }

    let fragments = secret_fragments(&entropy, path.len() + 1);
    let iv = u16::from_le_bytes(fragments[0]);
    let hops: Vec<(PublicKey, Vec<u8>)> = path
        .iter()
        .zip(&fragments[1..])
        .map(|(gateway, fragment)| (*gateway, fragment.to_vec()))
        .collect();

    let (onion, layers) = d
        .onion_builder
        .build(d.keys, iv, &hops, &d.block_hash, d.ledger)
        .map_err(DerivationError::OnionBuilder)?;
    if layers.len() != path.len() + 1 {
        return Err(DerivationError::OnionBuilder(anyhow::anyhow!(
            "expected {} onion layers, got {}",
            path.len() + 1,
            layers.len()
        )));
    }
    // Skip the outermost layer: the hash at index i is what hop i's
    // downstream witness reports.
    let packet_hashes = path
        .iter()
        .zip(layers.iter().skip(1))
        .map(|(gateway, layer)| (*gateway, Hash256::digest(layer)))
        .collect();

    Ok(LocalPoc {
        onion_key_hash,
        block_hash: d.block_hash,
        start_height: d.block_height,
        keys: d.keys.clone(),
        secret: d.keys.secret_bytes(),
        target,
        onion,
        challengees: hops,
        packet_hashes,
        receipts: BTreeMap::new(),
        witnesses: BTreeMap::new(),
    })
}

/// Inverse-CDF selection over cumulative weights with a uniform draw.
fn icdf_select<'a, T>(
    items: &'a [T],
    weight: impl Fn(&T) -> f64,
    rng: &mut ChaCha20Rng,
) -> Result<&'a T, DerivationError> {
    let total: f64 = items.iter().map(&weight).sum();
    if total <= 0.0 {
        return Err(DerivationError::ZoneWeightZero);
    }
    let mut draw = rng.gen::<f64>() * total;
    for item in items {
        draw -= weight(item);
        if draw <= 0.0 {
            return Ok(item);
        }
    }
    // Floating point accumulation can leave a sliver past the last item.
    items.last().ok_or(DerivationError::ZoneWeightZero)
}

/// Bounds the candidate set with a reproducible partial shuffle, then
/// restores the canonical ordering.
fn deterministic_subset(
    limit: usize,
    rng: &mut ChaCha20Rng,
    mut candidates: Vec<PublicKey>,
) -> Vec<PublicKey> {
    if candidates.len() <= limit {
        return candidates;
    }
    for i in 0..limit {
        let j = rng.gen_range(i..candidates.len());
        candidates.swap(i, j);
    }
    candidates.truncate(limit);
    candidates.sort_unstable();
    candidates
}

/// Splits candidates into (kept, removed): the challenger itself, gateways
/// without the challengee capability, and (when activity filtering is on)
/// gateways that have not been challenged recently are removed.
fn filter_candidates(
    d: &Derivation<'_>,
    candidates: &[PublicKey],
) -> (Vec<PublicKey>, Vec<PublicKey>) {
    let mut kept = Vec::with_capacity(candidates.len());
    let mut removed = Vec::new();
    for gateway in candidates {
        if *gateway == d.challenger {
            removed.push(*gateway);
            continue;
        }
        let Some(info) = d.ledger.find_gateway_info(gateway) else {
            removed.push(*gateway);
            continue;
        };
        if !info.mode.is_poc_challengee() {
            removed.push(*gateway);
            continue;
        }
        if d.vars.poc_activity_filter_enabled {
            let interactive = info.last_poc_challenge.is_some_and(|last| {
                d.block_height.saturating_sub(last) <= d.vars.hip17_interactivity_blocks
            });
            if !interactive {
                removed.push(*gateway);
                continue;
            }
        }
        kept.push(*gateway);
    }
    (kept, removed)
}

/// `count` two-byte fragments chained through SHA-256 from the challenge
/// entropy. The first fragment, little-endian, is the onion IV; the rest
/// are per-hop layer data.
fn secret_fragments(entropy: &[u8], count: usize) -> Vec<[u8; LAYER_DATA_LENGTH]> {
    let mut fragments = Vec::with_capacity(count);
    let mut seed = entropy.to_vec();
    for _ in 0..count {
        let digest = Sha256::digest(&seed);
        let fragment = [digest[0], digest[1]];
        seed.extend_from_slice(&fragment);
        fragments.push(fragment);
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::GatewayMode;
    use crate::testing::{MemoryLedger, StaticPathBuilder, HashOnionBuilder};
    use rand::rngs::OsRng;
    use std::sync::Arc;

    struct Fixture {
        challenger: Keypair,
        keys: Keypair,
        ledger: Arc<MemoryLedger>,
        vars: ChainVars,
        path_builder: StaticPathBuilder,
        onion_builder: HashOnionBuilder,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                challenger: Keypair::generate(&mut OsRng),
                keys: Keypair::generate(&mut OsRng),
                ledger: Arc::new(MemoryLedger::new()),
                vars: ChainVars::default(),
                path_builder: StaticPathBuilder::default(),
                onion_builder: HashOnionBuilder,
            }
        }

        fn derivation(&self) -> Derivation<'_> {
            Derivation {
                challenger: self.challenger.public_key(),
                keys: &self.keys,
                block_hash: Hash256::digest(b"entropy-block"),
                block_height: 101,
                block_time: 1_700_000_000,
                ledger: self.ledger.as_ref(),
                vars: &self.vars,
                path_builder: &self.path_builder,
                onion_builder: &self.onion_builder,
            }
        }

        fn populate_hex(&self, hex: HexId, gateways: usize) -> Vec<PublicKey> {
            (0..gateways)
                .map(|_| {
                    let keys = Keypair::generate(&mut OsRng);
                    self.ledger
                        .add_gateway(keys.public_key(), hex, GatewayMode::Full, Some(90));
                    keys.public_key()
                })
                .collect()
        }
    }

    #[test]
    fn empty_hex_list_fails() {
        let fixture = Fixture::new();
        assert!(matches!(
            derive(&fixture.derivation()),
            Err(DerivationError::EmptyHexList)
        ));
    }

    #[test]
    fn derivation_is_deterministic() {
        let fixture = Fixture::new();
        fixture.populate_hex(HexId(0x8512_3000), 12);
        fixture.populate_hex(HexId(0x8512_4000), 3);

        let first = derive(&fixture.derivation()).unwrap();
        let second = derive(&fixture.derivation()).unwrap();
        assert_eq!(first, second);

        assert_eq!(first.challengees.len(), first.packet_hashes.len());
        assert_eq!(first.target, first.challengees[0].0);
        assert!(first.challengees.iter().all(|(_, data)| data.len() == 2));
        assert!(first.receipts.is_empty() && first.witnesses.is_empty());
    }

    #[test]
    fn distinct_keys_produce_distinct_challenges() {
        let mut fixture = Fixture::new();
        fixture.populate_hex(HexId(0x8512_3000), 50);

        let first = derive(&fixture.derivation()).unwrap();
        fixture.keys = Keypair::generate(&mut OsRng);
        let second = derive(&fixture.derivation()).unwrap();

        assert_ne!(first.onion_key_hash, second.onion_key_hash);
        assert_ne!(first.onion, second.onion);
        assert_eq!(second.secret, fixture.keys.secret_bytes());
    }

    #[test]
    fn challenger_is_never_targeted() {
        let fixture = Fixture::new();
        let hex = HexId(0x8512_3000);
        // The only challengeable gateway in the hex is the challenger.
        fixture
            .ledger
            .add_gateway(fixture.challenger.public_key(), hex, GatewayMode::Full, Some(90));

        assert!(matches!(
            derive(&fixture.derivation()),
            Err(DerivationError::NoGatewaysFound(_))
        ));
    }

    #[test]
    fn data_only_gateways_are_filtered() {
        let fixture = Fixture::new();
        let hex = HexId(0x8512_3000);
        let keys = Keypair::generate(&mut OsRng);
        fixture
            .ledger
            .add_gateway(keys.public_key(), hex, GatewayMode::DataOnly, Some(90));

        assert!(matches!(
            derive(&fixture.derivation()),
            Err(DerivationError::NoGatewaysFound(_))
        ));
    }

    #[test]
    fn activity_filter_drops_stale_gateways() {
        let mut fixture = Fixture::new();
        fixture.vars.poc_activity_filter_enabled = true;
        fixture.vars.hip17_interactivity_blocks = 10;
        let hex = HexId(0x8512_3000);

        let stale = Keypair::generate(&mut OsRng).public_key();
        fixture.ledger.add_gateway(stale, hex, GatewayMode::Full, Some(1));
        let never = Keypair::generate(&mut OsRng).public_key();
        fixture.ledger.add_gateway(never, hex, GatewayMode::Full, None);
        let fresh = Keypair::generate(&mut OsRng).public_key();
        fixture.ledger.add_gateway(fresh, hex, GatewayMode::Full, Some(95));

        let poc = derive(&fixture.derivation()).unwrap();
        assert_eq!(poc.target, fresh);
    }

    #[test]
    fn zone_reselects_when_filtered_empty() {
        let mut fixture = Fixture::new();
        fixture.vars.poc_version = 4;
        // One hex holds only the challenger, the other a real candidate;
        // whenever the first zone is drawn it must be retried.
        let dead_hex = HexId(0x8512_3000);
        fixture.ledger.add_gateway(
            fixture.challenger.public_key(),
            dead_hex,
            GatewayMode::Full,
            Some(90),
        );
        let live = fixture.populate_hex(HexId(0x8512_4000), 1);

        let poc = derive(&fixture.derivation()).unwrap();
        assert_eq!(poc.target, live[0]);
    }

    #[test]
    fn v6_prunes_filtered_gateways_from_hex_index() {
        let mut fixture = Fixture::new();
        fixture.vars.poc_version = 6;
        let hex = HexId(0x8512_3000);
        fixture.populate_hex(hex, 2);
        let lame = Keypair::generate(&mut OsRng).public_key();
        fixture.ledger.add_gateway(lame, hex, GatewayMode::DataOnly, None);

        assert_eq!(fixture.ledger.gateways_in_hex(hex).len(), 3);
        derive(&fixture.derivation()).unwrap();
        // The data-only gateway was dropped from the hex index.
        assert!(!fixture.ledger.gateways_in_hex(hex).contains(&lame));
    }

    #[test]
    fn consideration_limit_bounds_candidates() {
        let mut fixture = Fixture::new();
        fixture.vars.poc_witness_consideration_limit = Some(5);
        fixture.populate_hex(HexId(0x8512_3000), 40);

        // Still derives, and deterministically so.
        let first = derive(&fixture.derivation()).unwrap();
        let second = derive(&fixture.derivation()).unwrap();
        assert_eq!(first.target, second.target);
    }

    #[test]
    fn fragments_chain_and_size() {
        let fragments = secret_fragments(b"some-entropy", 4);
        assert_eq!(fragments.len(), 4);
        let again = secret_fragments(b"some-entropy", 4);
        assert_eq!(fragments, again);
        let other = secret_fragments(b"other-entropy", 4);
        assert_ne!(fragments, other);
    }

    #[test]
    fn icdf_zero_weight_fails() {
        let mut rng = ChaCha20Rng::from_seed([0u8; 32]);
        let items = vec![(HexId(1), 0u64), (HexId(2), 0u64)];
        assert!(matches!(
            icdf_select(&items, |(_, c)| *c as f64, &mut rng),
            Err(DerivationError::ZoneWeightZero)
        ));
    }

    #[test]
    fn icdf_respects_weights() {
        let mut rng = ChaCha20Rng::from_seed([7u8; 32]);
        let items = vec![("a", 0.0), ("b", 1.0)];
        for _ in 0..32 {
            let picked = icdf_select(&items, |(_, w)| *w, &mut rng).unwrap();
            assert_eq!(picked.0, "b");
        }
    }
}
