use super::TargetEngine;
use crate::interfaces::{HexId, Ledger};
use poc_challenger_config::ChainVars;
use poc_challenger_types::PublicKey;
use rand_chacha::ChaCha20Rng;

/// Pre-v6 targeting: every populated hex competes, weighted by its gateway
/// count.
pub(super) struct HexPoolV4;

impl TargetEngine for HexPoolV4 {
    fn zones(
        &self,
        ledger: &dyn Ledger,
        _vars: &ChainVars,
        _rng: &mut ChaCha20Rng,
    ) -> Vec<(HexId, u64)> {
        ledger.populated_hexes()
    }

    fn prune_hex_index(&self, _ledger: &dyn Ledger, _zone: HexId, _removed: &[PublicKey]) {}
}
