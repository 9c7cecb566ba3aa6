use super::TargetEngine;
use crate::interfaces::{HexId, Ledger};
use poc_challenger_config::ChainVars;
use poc_challenger_types::PublicKey;
use rand_chacha::ChaCha20Rng;

/// v6 targeting: a bounded random sample of hexes (duplicates removed by
/// sort) instead of a full enumeration, plus hex-index pruning of
/// filtered-out gateways in a scratch ledger context.
pub(super) struct HexPoolV6;

impl TargetEngine for HexPoolV6 {
    fn zones(
        &self,
        ledger: &dyn Ledger,
        vars: &ChainVars,
        rng: &mut ChaCha20Rng,
    ) -> Vec<(HexId, u64)> {
        let mut pool = Vec::with_capacity(vars.poc_target_pool_size);
        for _ in 0..vars.poc_target_pool_size {
            match ledger.random_targeting_hex(rng) {
                Some(hex) => pool.push(hex),
                None => break,
            }
        }
        pool.sort_unstable();
        pool.dedup();
        pool.into_iter()
            .map(|hex| (hex, ledger.count_gateways_in_hex(hex)))
            .collect()
    }

    fn prune_hex_index(&self, ledger: &dyn Ledger, zone: HexId, removed: &[PublicKey]) {
        for gateway in removed {
            ledger.remove_gateway_from_hex_index(zone, gateway);
        }
    }
}
