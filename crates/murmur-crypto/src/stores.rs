//! In-memory key and instance tag stores, persisted via the persistence
//! module.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use murmur_protocol::types::{InstanceTag, MIN_VALID_INSTAG};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::debug;

use crate::identity::IdentityKey;
use crate::persistence::{
    decode_key_store, encode_key_store, format_instags, parse_instags, KeyRecord,
};

type StoreKey = (String, String);

fn store_key(account: &str, protocol: &str) -> StoreKey {
    (account.to_string(), protocol.to_string())
}

// ── Private keys ────────────────────────────────────────────────────────

/// Identity keys by (account, protocol).
#[derive(Debug, Default)]
pub struct KeyStore {
    keys: HashMap<StoreKey, IdentityKey>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, account: &str, protocol: &str) -> Option<&IdentityKey> {
        self.keys.get(&store_key(account, protocol))
    }

    pub fn insert(&mut self, account: &str, protocol: &str, key: IdentityKey) {
        self.keys.insert(store_key(account, protocol), key);
    }

    pub fn remove(&mut self, account: &str, protocol: &str) -> bool {
        self.keys.remove(&store_key(account, protocol)).is_some()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Merge the keys stored at `path` into this store. Returns how many
    /// were read.
    pub fn load(&mut self, path: &Path) -> anyhow::Result<usize> {
        let data = fs::read(path)?;
        let records = decode_key_store(&data)?;
        for record in &records {
            let key = IdentityKey::from_pkcs8(&record.pkcs8)?;
            self.insert(&record.account, &record.protocol, key);
        }
        Ok(records.len())
    }

    /// Write every key to `path`, replacing the file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let mut records: Vec<KeyRecord> = self
            .keys
            .iter()
            .map(|((account, protocol), key)| KeyRecord {
                account: account.clone(),
                protocol: protocol.clone(),
                pkcs8: key.pkcs8().to_vec(),
            })
            .collect();
        records.sort_by(|a, b| (&a.account, &a.protocol).cmp(&(&b.account, &b.protocol)));
        fs::write(path, encode_key_store(&records)?)?;
        debug!(path = %path.display(), keys = records.len(), "wrote key store");
        Ok(())
    }
}

// ── Instance tags ───────────────────────────────────────────────────────

/// Our instance tag per (account, protocol), created on first use.
#[derive(Debug, Default)]
pub struct InstagStore {
    tags: HashMap<StoreKey, InstanceTag>,
    path: Option<PathBuf>,
}

impl InstagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the tags stored at `path`; tags created later are written back
    /// there.
    pub fn load(&mut self, path: &Path) -> anyhow::Result<usize> {
        let text = fs::read_to_string(path)?;
        let entries = parse_instags(&text)?;
        let count = entries.len();
        for (account, protocol, tag) in entries {
            self.tags.insert((account, protocol), tag);
        }
        self.path = Some(path.to_path_buf());
        Ok(count)
    }

    /// Write tags created from now on to `path`.
    pub fn set_path(&mut self, path: &Path) {
        self.path = Some(path.to_path_buf());
    }

    pub fn get(&self, account: &str, protocol: &str) -> Option<InstanceTag> {
        self.tags.get(&store_key(account, protocol)).copied()
    }

    pub fn get_or_create(
        &mut self,
        account: &str,
        protocol: &str,
        rng: &SystemRandom,
    ) -> anyhow::Result<InstanceTag> {
        if let Some(tag) = self.get(account, protocol) {
            return Ok(tag);
        }
        let tag = random_instag(rng)?;
        self.tags.insert(store_key(account, protocol), tag);
        debug!(account, protocol, instance = tag, "created instance tag");
        if let Some(path) = &self.path {
            self.save(path)?;
        }
        Ok(tag)
    }

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        let mut entries: Vec<(&str, &str, InstanceTag)> = self
            .tags
            .iter()
            .map(|((account, protocol), tag)| (account.as_str(), protocol.as_str(), *tag))
            .collect();
        entries.sort();
        fs::write(path, format_instags(entries))?;
        Ok(())
    }
}

fn random_instag(rng: &SystemRandom) -> anyhow::Result<InstanceTag> {
    loop {
        let mut bytes = [0u8; 4];
        rng.fill(&mut bytes)
            .map_err(|_| anyhow::anyhow!("RNG failed"))?;
        let tag = InstanceTag::from_be_bytes(bytes);
        if tag >= MIN_VALID_INSTAG {
            return Ok(tag);
        }
    }
}
