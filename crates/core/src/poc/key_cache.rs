use poc_challenger_types::{Hash256, Keypair};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// An ephemeral keypair we proposed, remembered until its onion key hash
/// shows up in a block (or the entry ages out).
#[derive(Clone, Debug)]
pub struct CachedKey {
    /// Height at which the key batch was generated.
    pub receive_height: u64,
    pub keypair: Keypair,
}

/// Shared read view on the ephemeral key cache.
///
/// Clones always agree on the underlying map. The cache is volatile by
/// design: keys not yet confirmed in a block can simply be regenerated
/// after a cold start. The supervisor keeps a clone so that a challenge
/// manager restart does not drop pending keys.
#[derive(Clone, Debug)]
pub struct KeyCache {
    internal: Arc<RwLock<HashMap<Hash256, CachedKey>>>,
}

impl KeyCache {
    /// Creates an empty cache plus the write half handed to the manager.
    pub fn new() -> (Self, KeyCacheWriter) {
        let internal = Arc::new(RwLock::new(HashMap::new()));
        (
            Self {
                internal: internal.clone(),
            },
            KeyCacheWriter { internal },
        )
    }

    fn get(&self) -> RwLockReadGuard<'_, HashMap<Hash256, CachedKey>> {
        self.internal.read().expect("KeyCache lock is poisoned")
    }

    pub fn lookup(&self, onion_key_hash: &Hash256) -> Option<CachedKey> {
        self.get().get(onion_key_hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.get().len()
    }

    pub fn is_empty(&self) -> bool {
        self.get().is_empty()
    }
}

/// Exclusive write access to the key cache; owned by the challenge manager.
#[derive(Debug)]
pub struct KeyCacheWriter {
    internal: Arc<RwLock<HashMap<Hash256, CachedKey>>>,
}

impl KeyCacheWriter {
    fn get(&self) -> RwLockReadGuard<'_, HashMap<Hash256, CachedKey>> {
        self.internal.read().expect("KeyCacheWriter lock is poisoned")
    }

    fn get_mut(&self) -> RwLockWriteGuard<'_, HashMap<Hash256, CachedKey>> {
        self.internal
            .write()
            .expect("KeyCacheWriter lock is poisoned")
    }

    /// Idempotent insert; last write wins.
    pub fn cache(&self, onion_key_hash: Hash256, receive_height: u64, keypair: Keypair) {
        self.get_mut().insert(
            onion_key_hash,
            CachedKey {
                receive_height,
                keypair,
            },
        );
    }

    pub fn lookup(&self, onion_key_hash: &Hash256) -> Option<CachedKey> {
        self.get().get(onion_key_hash).cloned()
    }

    pub fn delete(&self, onion_key_hash: &Hash256) {
        self.get_mut().remove(onion_key_hash);
    }

    /// Snapshot of all entries, for TTL garbage collection.
    pub fn entries(&self) -> Vec<(Hash256, CachedKey)> {
        self.get().iter().map(|(k, v)| (*k, v.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn reads_observe_writer() {
        let (cache, writer) = KeyCache::new();
        let keys = Keypair::generate(&mut OsRng);
        let hash = keys.onion_key_hash();

        assert!(cache.lookup(&hash).is_none());
        writer.cache(hash, 7, keys.clone());
        let entry = cache.lookup(&hash).unwrap();
        assert_eq!(entry.receive_height, 7);
        assert_eq!(entry.keypair, keys);

        writer.delete(&hash);
        assert!(cache.is_empty());
    }

    #[test]
    fn last_write_wins() {
        let (cache, writer) = KeyCache::new();
        let keys = Keypair::generate(&mut OsRng);
        let hash = keys.onion_key_hash();

        writer.cache(hash, 1, keys.clone());
        writer.cache(hash, 2, keys);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&hash).unwrap().receive_height, 2);
    }

    #[test]
    fn entries_snapshot() {
        let (_cache, writer) = KeyCache::new();
        for height in 0..3 {
            let keys = Keypair::generate(&mut OsRng);
            writer.cache(keys.onion_key_hash(), height, keys);
        }
        assert_eq!(writer.entries().len(), 3);
    }
}
