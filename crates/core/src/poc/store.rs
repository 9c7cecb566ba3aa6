use crate::poc::error::StoreError;
use poc_challenger_types::{Hash256, LocalPoc};
use std::path::Path;

/// Durable key-value store of in-flight challenges, keyed by onion key
/// hash. Values are the versioned [`LocalPoc`] encoding.
///
/// Challenges are short-lived and bounded in size, so every mutation is a
/// full-record overwrite; the manager is the only writer.
#[derive(Clone, Debug)]
pub struct PocStore {
    db: sled::Db,
}

impl PocStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// Backed by a temporary directory that is removed on drop; for tests.
    pub fn open_temporary() -> Result<Self, StoreError> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }

    pub fn get(&self, onion_key_hash: &Hash256) -> Result<LocalPoc, StoreError> {
        match self.db.get(onion_key_hash.as_bytes())? {
            Some(bytes) => Ok(LocalPoc::decode(&bytes)?),
            None => Err(StoreError::NotFound(*onion_key_hash)),
        }
    }

    pub fn put(&self, poc: &LocalPoc) -> Result<(), StoreError> {
        let encoded = poc.encode()?;
        self.db.insert(poc.onion_key_hash.as_bytes(), encoded)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn delete(&self, onion_key_hash: &Hash256) -> Result<(), StoreError> {
        self.db.remove(onion_key_hash.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// All decodable challenge records. Undecodable records are logged and
    /// skipped; they will age out with their key.
    pub fn iter(&self) -> Vec<LocalPoc> {
        self.db
            .iter()
            .filter_map(|entry| {
                let (key, value) = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::error!(%err, "failed to read local poc record");
                        return None;
                    }
                };
                match LocalPoc::decode(&value) {
                    Ok(poc) => Some(poc),
                    Err(err) => {
                        tracing::error!(
                            key = %hex::encode(&key),
                            %err,
                            "failed to decode local poc record; skipping"
                        );
                        None
                    }
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: &[u8], value: &[u8]) {
        self.db.insert(key, value).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poc_challenger_types::Keypair;
    use rand::rngs::OsRng;
    use std::collections::BTreeMap;

    fn sample_poc() -> LocalPoc {
        let keys = Keypair::generate(&mut OsRng);
        let target = Keypair::generate(&mut OsRng).public_key();
        LocalPoc {
            onion_key_hash: keys.onion_key_hash(),
            block_hash: Hash256::digest(b"block"),
            start_height: 5,
            secret: keys.secret_bytes(),
            keys,
            target,
            onion: vec![1, 2, 3],
            challengees: vec![(target, vec![0xaa, 0xbb])],
            packet_hashes: vec![(target, Hash256::digest(b"layer-1"))],
            receipts: BTreeMap::new(),
            witnesses: BTreeMap::new(),
        }
    }

    #[test]
    fn put_get_delete() {
        let store = PocStore::open_temporary().unwrap();
        let poc = sample_poc();

        store.put(&poc).unwrap();
        assert_eq!(store.get(&poc.onion_key_hash).unwrap(), poc);

        store.delete(&poc.onion_key_hash).unwrap();
        assert!(matches!(
            store.get(&poc.onion_key_hash),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn put_overwrites() {
        let store = PocStore::open_temporary().unwrap();
        let mut poc = sample_poc();
        store.put(&poc).unwrap();

        poc.start_height = 9;
        store.put(&poc).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&poc.onion_key_hash).unwrap().start_height, 9);
    }

    #[test]
    fn iter_skips_undecodable_records() {
        let store = PocStore::open_temporary().unwrap();
        let poc = sample_poc();
        store.put(&poc).unwrap();
        store.insert_raw(b"garbage-key", &[0xff, 0x00, 0x01]);

        let pocs = store.iter();
        assert_eq!(pocs, vec![poc]);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let poc = sample_poc();
        {
            let store = PocStore::open(dir.path()).unwrap();
            store.put(&poc).unwrap();
        }
        let store = PocStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&poc.onion_key_hash).unwrap(), poc);
    }
}
