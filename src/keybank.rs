//! Persistent directory of peer identities
//!
//! The bank owns [`PeerNode`] values in a slab; two indexes, one from
//! `(group, name)` and one from a key fingerprint, map back to node
//! ids. Adding a `(name, key)` pair whose name and key resolve to two
//! different nodes **merges** them: the winner absorbs the loser's names
//! and keys and both indexes are rewritten. Merging is how a peer that
//! rotated keys, or renamed itself, collapses back into one identity.
//!
//! Everything mutating happens under one mutex, so `add_pair` (merges
//! included) is atomic with respect to concurrent `find` calls.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::bigint::BigInt;
use crate::envelope::{EnvelopeReader, EnvelopeWriter, Unlock};
use crate::error::{CryptoError, ErrorLog};
use crate::keypair::RsaKeypair;
use crate::suite::AlgorithmSuite;
use crate::{GROUP_SIZE, NAME_SIZE};

/// Identifier of a node within one bank.
pub type NodeId = u64;

/// An alias observed for a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerName {
    pub group: String,
    pub name: String,
    pub timestamp: i64,
}

/// A public key observed for a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerKey {
    pub key: BigInt,
    pub algorithm: u16,
    pub key_words: u16,
    pub timestamp: i64,
}

/// A cluster of names and keys believed to belong to one peer.
#[derive(Clone, Debug)]
pub struct PeerNode {
    pub id: NodeId,
    pub names: Vec<PeerName>,
    pub keys: Vec<PeerKey>,
}

impl PeerNode {
    /// Most recent `(group, name)` alias.
    pub fn primary_name(&self) -> Option<&PeerName> {
        self.names.iter().max_by_key(|n| n.timestamp)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct KeyFingerprint {
    algorithm: u16,
    key_words: u16,
    bytes: Vec<u8>,
}

impl KeyFingerprint {
    fn of(key: &BigInt, algorithm: u16, key_words: u16) -> Self {
        Self { algorithm, key_words, bytes: key.to_bytes_le_trimmed() }
    }
}

struct BankInner {
    nodes: HashMap<NodeId, PeerNode>,
    by_name: HashMap<(String, String), NodeId>,
    by_key: HashMap<KeyFingerprint, NodeId>,
    next_id: NodeId,
}

impl BankInner {
    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn add_pair(
        &mut self,
        group: &str,
        name: &str,
        key: &BigInt,
        algorithm: u16,
        key_words: u16,
    ) -> Result<NodeId, CryptoError> {
        if group.len() > GROUP_SIZE {
            return Err(CryptoError::StringTooLarge);
        }
        if name.len() > NAME_SIZE {
            return Err(CryptoError::StringTooLarge);
        }
        let name_key = (group.to_string(), name.to_string());
        let fp = KeyFingerprint::of(key, algorithm, key_words);
        let found_name = self.by_name.get(&name_key).copied();
        let found_key = self.by_key.get(&fp).copied();
        let now = Self::now();

        let id = match (found_name, found_key) {
            (None, None) => {
                let id = self.next_id;
                self.next_id += 1;
                self.nodes.insert(
                    id,
                    PeerNode {
                        id,
                        names: vec![PeerName {
                            group: group.to_string(),
                            name: name.to_string(),
                            timestamp: now,
                        }],
                        keys: vec![PeerKey {
                            key: key.clone(),
                            algorithm,
                            key_words,
                            timestamp: now,
                        }],
                    },
                );
                self.by_name.insert(name_key, id);
                self.by_key.insert(fp, id);
                id
            }
            (None, Some(by_key)) => {
                let node = self.nodes.get_mut(&by_key).ok_or(CryptoError::NullMaster)?;
                node.names.push(PeerName {
                    group: group.to_string(),
                    name: name.to_string(),
                    timestamp: now,
                });
                self.by_name.insert(name_key, by_key);
                by_key
            }
            (Some(by_name), None) => {
                let node = self.nodes.get_mut(&by_name).ok_or(CryptoError::NullMaster)?;
                node.keys.push(PeerKey { key: key.clone(), algorithm, key_words, timestamp: now });
                self.by_key.insert(fp, by_name);
                by_name
            }
            (Some(a), Some(b)) if a == b => a,
            (Some(winner), Some(loser)) => {
                self.merge(winner, loser)?;
                winner
            }
        };
        Ok(id)
    }

    /// Absorb `loser` into `winner` and rewrite both indexes.
    fn merge(&mut self, winner: NodeId, loser: NodeId) -> Result<(), CryptoError> {
        let absorbed = self.nodes.remove(&loser).ok_or(CryptoError::MasterMismatch)?;
        let target = self.nodes.get_mut(&winner).ok_or(CryptoError::NullMaster)?;
        for moved in &absorbed.names {
            if !target.names.iter().any(|n| n.group == moved.group && n.name == moved.name) {
                target.names.push(moved.clone());
            }
        }
        for moved in &absorbed.keys {
            let fp = KeyFingerprint::of(&moved.key, moved.algorithm, moved.key_words);
            if !target
                .keys
                .iter()
                .any(|k| KeyFingerprint::of(&k.key, k.algorithm, k.key_words) == fp)
            {
                target.keys.push(moved.clone());
            }
        }
        for index in self.by_name.values_mut() {
            if *index == loser {
                *index = winner;
            }
        }
        for index in self.by_key.values_mut() {
            if *index == loser {
                *index = winner;
            }
        }
        Ok(())
    }
}

/// How the bank's save file is sealed.
pub enum BankLock {
    /// No file configured; the bank lives in memory only.
    None,
    /// Password-sealed.
    Password(Vec<u8>),
    /// Sealed to one of the user's keypairs.
    PublicKey(Arc<RsaKeypair>),
}

/// The authoritative local record of which keys belong to which peer.
pub struct KeyBank {
    inner: Mutex<BankInner>,
    file: Mutex<(Option<PathBuf>, BankLock, AlgorithmSuite)>,
    errors: ErrorLog,
}

impl KeyBank {
    /// Empty in-memory bank.
    pub fn new(suite: AlgorithmSuite) -> Self {
        Self {
            inner: Mutex::new(BankInner {
                nodes: HashMap::new(),
                by_name: HashMap::new(),
                by_key: HashMap::new(),
                next_id: 1,
            }),
            file: Mutex::new((None, BankLock::None, suite)),
            errors: ErrorLog::default(),
        }
    }

    /// Recent errors this bank has surfaced.
    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    /// Configure the save path and lock.
    pub fn set_file(&self, path: PathBuf, lock: BankLock) {
        let mut file = self.file.lock().expect("bank file lock poisoned");
        file.0 = Some(path);
        file.1 = lock;
    }

    /// Re-seal under a new password.
    pub fn set_password(&self, password: &[u8]) {
        self.file.lock().expect("bank file lock poisoned").1 = BankLock::Password(password.to_vec());
    }

    /// Change the stream suite used for sealing.
    pub fn set_stream_suite(&self, suite: AlgorithmSuite) {
        self.file.lock().expect("bank file lock poisoned").2 = suite;
    }

    /// Record an authenticated `(group, name, key)` observation,
    /// creating, extending, or merging nodes as required. Returns the
    /// resulting node id.
    pub fn add_pair(
        &self,
        group: &str,
        name: &str,
        key: &BigInt,
        algorithm: u16,
        key_words: u16,
    ) -> Result<NodeId, CryptoError> {
        let result = self
            .inner
            .lock()
            .expect("bank lock poisoned")
            .add_pair(group, name, key, algorithm, key_words);
        if let Err(err) = &result {
            self.errors.log(err.clone());
        }
        result
    }

    /// Find a node by `(group, name)`.
    pub fn find_name(&self, group: &str, name: &str) -> Option<NodeId> {
        self.inner
            .lock()
            .expect("bank lock poisoned")
            .by_name
            .get(&(group.to_string(), name.to_string()))
            .copied()
    }

    /// Find a node by key value.
    pub fn find_key(&self, key: &BigInt, algorithm: u16, key_words: u16) -> Option<NodeId> {
        self.inner
            .lock()
            .expect("bank lock poisoned")
            .by_key
            .get(&KeyFingerprint::of(key, algorithm, key_words))
            .copied()
    }

    /// Snapshot of a node.
    pub fn node(&self, id: NodeId) -> Option<PeerNode> {
        self.inner.lock().expect("bank lock poisoned").nodes.get(&id).cloned()
    }

    /// Number of distinct peers.
    pub fn node_count(&self) -> usize {
        self.inner.lock().expect("bank lock poisoned").nodes.len()
    }

    /// A node's names, most recent first.
    pub fn names_by_timestamp(&self, id: NodeId) -> Vec<PeerName> {
        let mut names = self
            .node(id)
            .map(|n| n.names)
            .unwrap_or_default();
        names.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        names
    }

    /// A node's keys, most recent first.
    pub fn keys_by_timestamp(&self, id: NodeId) -> Vec<PeerKey> {
        let mut keys = self
            .node(id)
            .map(|n| n.keys)
            .unwrap_or_default();
        keys.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        keys
    }

    // ------------------------------ Persistence ------------------------------

    /// Serialize the node tree through the configured envelope.
    pub fn save(&self) -> Result<(), CryptoError> {
        let file = self.file.lock().expect("bank file lock poisoned");
        let (path, lock, suite) = (&file.0, &file.1, &file.2);
        let path = path.as_ref().ok_or(CryptoError::FileOpen)?;

        let record = {
            let inner = self.inner.lock().expect("bank lock poisoned");
            BankRecord::from_inner(&inner)
        };
        let json = serde_json::to_vec(&record).map_err(|_| CryptoError::FileFormat)?;

        let mut writer = match lock {
            BankLock::Password(password) => EnvelopeWriter::with_password(path, password, suite)?,
            BankLock::PublicKey(keypair) => EnvelopeWriter::with_public_key(
                path,
                &keypair.n(),
                keypair.algorithm(),
                keypair.size(),
                None,
                suite,
            )?,
            BankLock::None => return Err(CryptoError::KeyMissing),
        };
        writer.write(&json)?;
        writer.finish()?;
        tracing::debug!(nodes = record.nodes.len(), path = %path.display(), "key bank saved");
        Ok(())
    }

    /// Load a bank previously written by [`KeyBank::save`].
    pub fn load(path: &Path, lock: BankLock, suite: AlgorithmSuite) -> Result<Self, CryptoError> {
        let unlock = match &lock {
            BankLock::Password(password) => Unlock::Password(password),
            BankLock::PublicKey(keypair) => Unlock::Keypair(keypair),
            BankLock::None => return Err(CryptoError::KeyMissing),
        };
        let mut reader = EnvelopeReader::open(path, unlock)?;
        let json = reader.read_to_end()?;
        let record: BankRecord =
            serde_json::from_slice(&json).map_err(|_| CryptoError::FileFormat)?;

        let bank = Self::new(suite);
        record.restore(&bank)?;
        bank.set_file(path.to_path_buf(), lock);
        Ok(bank)
    }
}

// ============================================================================
// Save tree
// ============================================================================

#[derive(Serialize, Deserialize)]
struct KeyRecord {
    algorithm: u16,
    key_words: u16,
    key: String,
    timestamp: i64,
}

#[derive(Serialize, Deserialize)]
struct NodeRecord {
    names: Vec<PeerName>,
    keys: Vec<KeyRecord>,
}

#[derive(Serialize, Deserialize)]
struct BankRecord {
    nodes: Vec<NodeRecord>,
}

impl BankRecord {
    fn from_inner(inner: &BankInner) -> Self {
        let mut ids: Vec<&PeerNode> = inner.nodes.values().collect();
        ids.sort_by_key(|n| n.id);
        Self {
            nodes: ids
                .into_iter()
                .map(|node| NodeRecord {
                    names: node.names.clone(),
                    keys: node
                        .keys
                        .iter()
                        .map(|k| KeyRecord {
                            algorithm: k.algorithm,
                            key_words: k.key_words,
                            key: hex::encode(k.key.to_bytes_le_trimmed()),
                            timestamp: k.timestamp,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    fn restore(&self, bank: &KeyBank) -> Result<(), CryptoError> {
        let mut inner = bank.inner.lock().expect("bank lock poisoned");
        for node in &self.nodes {
            let id = inner.next_id;
            inner.next_id += 1;
            let mut names = Vec::new();
            for n in &node.names {
                inner
                    .by_name
                    .insert((n.group.clone(), n.name.clone()), id);
                names.push(n.clone());
            }
            let mut keys = Vec::new();
            for k in &node.keys {
                let bytes = hex::decode(&k.key).map_err(|_| CryptoError::FileFormat)?;
                let mut key = BigInt::from_bytes_le(&bytes);
                key.expand(k.key_words as usize * 2);
                inner
                    .by_key
                    .insert(KeyFingerprint::of(&key, k.algorithm, k.key_words), id);
                keys.push(PeerKey {
                    key,
                    algorithm: k.algorithm,
                    key_words: k.key_words,
                    timestamp: k.timestamp,
                });
            }
            inner.nodes.insert(id, PeerNode { id, names, keys });
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::SuiteRegistry;

    fn bank() -> KeyBank {
        KeyBank::new(SuiteRegistry::global().default_suite())
    }

    fn key(seed: u32) -> BigInt {
        BigInt::from_u32(seed, 8)
    }

    #[test]
    fn fresh_pair_creates_node() {
        let bank = bank();
        let id = bank.add_pair("grp", "alice", &key(11), 1, 4).unwrap();
        assert_eq!(bank.node_count(), 1);
        assert_eq!(bank.find_name("grp", "alice"), Some(id));
        assert_eq!(bank.find_key(&key(11), 1, 4), Some(id));
        assert_eq!(bank.find_name("grp", "bob"), None);
    }

    #[test]
    fn known_key_gains_alias_known_name_gains_key() {
        let bank = bank();
        let id = bank.add_pair("grp", "alice", &key(11), 1, 4).unwrap();

        // Same key, new name: alias lands on the same node.
        let same = bank.add_pair("grp", "alicia", &key(11), 1, 4).unwrap();
        assert_eq!(same, id);
        assert_eq!(bank.find_name("grp", "alicia"), Some(id));

        // Same name, new key: the node accumulates keys.
        let same = bank.add_pair("grp", "alice", &key(22), 1, 4).unwrap();
        assert_eq!(same, id);
        assert_eq!(bank.node(id).unwrap().keys.len(), 2);
        assert_eq!(bank.node_count(), 1);
    }

    #[test]
    fn repeated_pair_is_a_noop() {
        let bank = bank();
        let a = bank.add_pair("grp", "alice", &key(11), 1, 4).unwrap();
        let b = bank.add_pair("grp", "alice", &key(11), 1, 4).unwrap();
        assert_eq!(a, b);
        assert_eq!(bank.node_count(), 1);
        assert_eq!(bank.node(a).unwrap().keys.len(), 1);
    }

    #[test]
    fn conflicting_pair_merges_nodes() {
        let bank = bank();
        let a = bank.add_pair("grp", "alice", &key(11), 1, 4).unwrap();
        let b = bank.add_pair("grp", "bob", &key(22), 1, 4).unwrap();
        assert_ne!(a, b);

        // alice's name with bob's key: one node absorbs the other.
        let merged = bank.add_pair("grp", "alice", &key(22), 1, 4).unwrap();
        assert_eq!(merged, a);
        assert_eq!(bank.node_count(), 1);
        assert_eq!(bank.find_name("grp", "bob"), Some(a));
        assert_eq!(bank.find_key(&key(11), 1, 4), Some(a));
        assert_eq!(bank.find_key(&key(22), 1, 4), Some(a));
        let node = bank.node(a).unwrap();
        assert_eq!(node.names.len(), 2);
        assert_eq!(node.keys.len(), 2);
    }

    #[test]
    fn merge_closure_property() {
        // After any add_pair sequence, pairs sharing a name or a key
        // resolve to the same node.
        let bank = bank();
        let pairs = [
            ("g", "a", 1u32),
            ("g", "b", 2),
            ("g", "c", 3),
            ("g", "a", 2), // joins a and b
            ("g", "d", 4),
            ("g", "c", 4), // joins c and d
            ("g", "b", 3), // joins everything
        ];
        for (g, n, k) in pairs {
            bank.add_pair(g, n, &key(k), 1, 4).unwrap();
        }
        assert_eq!(bank.node_count(), 1);
        let id = bank.find_name("g", "a").unwrap();
        for name in ["a", "b", "c", "d"] {
            assert_eq!(bank.find_name("g", name), Some(id));
        }
        for k in 1..=4u32 {
            assert_eq!(bank.find_key(&key(k), 1, 4), Some(id));
        }
    }

    #[test]
    fn name_bounds_enforced() {
        let bank = bank();
        let long = "x".repeat(GROUP_SIZE + 1);
        assert_eq!(
            bank.add_pair(&long, "alice", &key(1), 1, 4).unwrap_err(),
            CryptoError::StringTooLarge
        );
        assert_eq!(bank.errors().len(), 1);
    }

    #[test]
    fn keys_sorted_most_recent_first() {
        let bank = bank();
        let id = bank.add_pair("g", "a", &key(1), 1, 4).unwrap();
        bank.add_pair("g", "a", &key(2), 1, 4).unwrap();
        {
            // Nudge timestamps apart artificially.
            let mut inner = bank.inner.lock().unwrap();
            let node = inner.nodes.get_mut(&id).unwrap();
            node.keys[0].timestamp = 100;
            node.keys[1].timestamp = 200;
        }
        let keys = bank.keys_by_timestamp(id);
        assert_eq!(keys[0].timestamp, 200);
        assert_eq!(keys[1].timestamp, 100);
    }

    #[test]
    fn save_load_roundtrip_with_password() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bank.json.enc");

        let bank = bank();
        bank.add_pair("g", "alice", &key(11), 1, 4).unwrap();
        bank.add_pair("g", "bob", &key(22), 1, 4).unwrap();
        bank.add_pair("g", "alice", &key(22), 1, 4).unwrap(); // merge
        bank.set_file(path.clone(), BankLock::Password(b"bankpw".to_vec()));
        bank.save().unwrap();

        let loaded = KeyBank::load(
            &path,
            BankLock::Password(b"bankpw".to_vec()),
            SuiteRegistry::global().default_suite(),
        )
        .unwrap();
        assert_eq!(loaded.node_count(), 1);
        let id = loaded.find_name("g", "alice").unwrap();
        assert_eq!(loaded.find_name("g", "bob"), Some(id));
        assert_eq!(loaded.find_key(&key(11), 1, 4), Some(id));
        assert_eq!(loaded.find_key(&key(22), 1, 4), Some(id));
        Ok(())
    }

    #[test]
    fn save_load_roundtrip_with_public_key() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bank.pk.enc");
        let keypair = Arc::new(crate::keypair::tests::test_keypair_128());

        let bank = bank();
        bank.add_pair("g", "carol", &key(33), 1, 4).unwrap();
        bank.set_file(path.clone(), BankLock::PublicKey(keypair.clone()));
        bank.save().unwrap();

        let loaded = KeyBank::load(
            &path,
            BankLock::PublicKey(keypair),
            SuiteRegistry::global().default_suite(),
        )
        .unwrap();
        assert!(loaded.find_name("g", "carol").is_some());
        Ok(())
    }
}
