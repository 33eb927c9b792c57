//! A local identity: keys, bank, suite, and per-group gateway settings
//!
//! The user owns everything a gateway needs: the set of RSA keypairs
//! (one of which is the default), the key bank of peer identities, the
//! preferred stream suite, and one settings bundle per group id. When a
//! save directory is configured, `save()` fans out to the keypair files
//! and the bank's sealed tree.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use crate::bigint::BigInt;
use crate::error::{CryptoError, ErrorLog};
use crate::keybank::{BankLock, KeyBank};
use crate::keypair::RsaKeypair;
use crate::settings::GatewaySettings;
use crate::suite::{AlgorithmSuite, HashDigest, SuiteRegistry};
use crate::NAME_SIZE;

/// A local identity and its key material.
pub struct User {
    username: String,
    save_dir: Option<PathBuf>,
    password: Mutex<Vec<u8>>,
    stream_suite: RwLock<AlgorithmSuite>,
    key_bank: Arc<KeyBank>,
    keys: RwLock<Vec<Arc<RsaKeypair>>>,
    default_key: RwLock<Option<Arc<RsaKeypair>>>,
    settings: Mutex<HashMap<String, Arc<RwLock<GatewaySettings>>>>,
    errors: ErrorLog,
}

impl User {
    /// Create a user. The username is bounded by [`NAME_SIZE`]; the
    /// password (when given) seals everything the user persists.
    pub fn new(
        username: &str,
        save_dir: Option<PathBuf>,
        password: Option<&[u8]>,
    ) -> Result<Arc<Self>, CryptoError> {
        if username.is_empty() || username.len() > NAME_SIZE {
            return Err(CryptoError::StringTooLarge);
        }
        let suite = SuiteRegistry::global().default_suite();
        let bank = Arc::new(KeyBank::new(suite.clone()));
        let user = Arc::new(Self {
            username: username.to_string(),
            save_dir,
            password: Mutex::new(password.unwrap_or_default().to_vec()),
            stream_suite: RwLock::new(suite),
            key_bank: bank,
            keys: RwLock::new(Vec::new()),
            default_key: RwLock::new(None),
            settings: Mutex::new(HashMap::new()),
            errors: ErrorLog::default(),
        });
        if let Some(dir) = &user.save_dir {
            let bank_path = dir.join(format!("{username}.bank"));
            let lock = match password {
                Some(p) => BankLock::Password(p.to_vec()),
                None => BankLock::Password(crate::keypair::DEFAULT_FILE_PASSWORD.to_vec()),
            };
            user.key_bank.set_file(bank_path, lock);
        }
        Ok(user)
    }

    /// The user's name.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Directory persisted material lands in, when configured.
    pub fn save_dir(&self) -> Option<&PathBuf> {
        self.save_dir.as_ref()
    }

    /// Recent errors surfaced by this user's operations.
    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    /// Replace the sealing password.
    pub fn set_password(&self, password: &[u8]) {
        *self.password.lock().expect("password lock poisoned") = password.to_vec();
        self.key_bank.set_password(password);
    }

    /// Preferred stream suite.
    pub fn stream_suite(&self) -> AlgorithmSuite {
        self.stream_suite.read().expect("suite lock poisoned").clone()
    }

    /// Replace the preferred stream suite.
    pub fn set_stream_suite(&self, suite: AlgorithmSuite) {
        *self.stream_suite.write().expect("suite lock poisoned") = suite.clone();
        self.key_bank.set_stream_suite(suite);
    }

    /// The bank of peer identities.
    pub fn key_bank(&self) -> Arc<KeyBank> {
        self.key_bank.clone()
    }

    /// Register a keypair. The first registered pair becomes the
    /// default. Returns `false` when a pair of the same algorithm and
    /// size is already held.
    pub fn add_keypair(&self, keypair: Arc<RsaKeypair>) -> bool {
        let mut keys = self.keys.write().expect("keys lock poisoned");
        if keys
            .iter()
            .any(|k| k.algorithm() == keypair.algorithm() && k.size() == keypair.size())
        {
            return false;
        }
        keys.push(keypair.clone());
        drop(keys);
        let mut default = self.default_key.write().expect("default key lock poisoned");
        if default.is_none() {
            *default = Some(keypair);
        }
        true
    }

    /// The default keypair, if any.
    pub fn default_keypair(&self) -> Option<Arc<RsaKeypair>> {
        self.default_key.read().expect("default key lock poisoned").clone()
    }

    /// Promote a held keypair (matched by algorithm and size) to default.
    pub fn set_default_keypair(&self, algorithm: u16, size: u16) -> bool {
        let keys = self.keys.read().expect("keys lock poisoned");
        let found = keys
            .iter()
            .find(|k| k.algorithm() == algorithm && k.size() == size)
            .cloned();
        drop(keys);
        match found {
            Some(key) => {
                *self.default_key.write().expect("default key lock poisoned") = Some(key);
                true
            }
            None => false,
        }
    }

    /// Find a held keypair by algorithm and size.
    pub fn find_keypair(&self, algorithm: u16, size: u16) -> Option<Arc<RsaKeypair>> {
        self.keys
            .read()
            .expect("keys lock poisoned")
            .iter()
            .find(|k| k.algorithm() == algorithm && k.size() == size)
            .cloned()
    }

    /// Search every held keypair for a key value. Returns the owning
    /// pair along with `(history_index, is_public)`.
    pub fn search_key(&self, key: &BigInt) -> Option<(Arc<RsaKeypair>, usize, bool)> {
        let keys = self.keys.read().expect("keys lock poisoned");
        for keypair in keys.iter() {
            if let Some((hist, public)) = keypair.search_key(key) {
                return Some((keypair.clone(), hist, public));
            }
        }
        None
    }

    /// Search every held keypair for a key hash.
    pub fn search_key_hash(
        &self,
        digest: &HashDigest,
        suite: &AlgorithmSuite,
    ) -> Option<(Arc<RsaKeypair>, usize, bool)> {
        let keys = self.keys.read().expect("keys lock poisoned");
        for keypair in keys.iter() {
            if let Some((hist, public)) = keypair.search_hash(digest, suite) {
                return Some((keypair.clone(), hist, public));
            }
        }
        None
    }

    /// Settings for `group`, created on first use.
    pub fn insert_settings(
        &self,
        group: &str,
    ) -> Result<Arc<RwLock<GatewaySettings>>, CryptoError> {
        let mut map = self.settings.lock().expect("settings lock poisoned");
        if let Some(existing) = map.get(group) {
            return Ok(existing.clone());
        }
        let path = self
            .save_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.{}.settings", self.username, group)));
        let settings = GatewaySettings::from_user(self, group, path)?;
        let shared = Arc::new(RwLock::new(settings));
        map.insert(group.to_string(), shared.clone());
        Ok(shared)
    }

    /// Settings for `group`, if previously created.
    pub fn find_settings(&self, group: &str) -> Option<Arc<RwLock<GatewaySettings>>> {
        self.settings.lock().expect("settings lock poisoned").get(group).cloned()
    }

    /// Persist keypairs, bank, and settings snapshots under the save
    /// directory. Failures are logged to this user's error ring as well
    /// as returned.
    pub fn save(&self) -> Result<(), CryptoError> {
        self.save_inner().map_err(|err| {
            self.errors.log(err.clone());
            err
        })
    }

    fn save_inner(&self) -> Result<(), CryptoError> {
        let dir = self.save_dir.as_ref().ok_or(CryptoError::FileOpen)?;
        std::fs::create_dir_all(dir).map_err(|_| CryptoError::FileOpen)?;

        let password = self.password.lock().expect("password lock poisoned").clone();
        let password = if password.is_empty() { None } else { Some(password) };
        let suite = self.stream_suite();

        for keypair in self.keys.read().expect("keys lock poisoned").iter() {
            let path = dir.join(format!(
                "{}.rsa{}.key",
                self.username,
                keypair.size() as usize * 32
            ));
            keypair.save(&path, password.as_deref(), &suite)?;
        }
        self.key_bank.save()?;
        let settings = self.settings.lock().expect("settings lock poisoned");
        for shared in settings.values() {
            shared.read().expect("settings poisoned").save()?;
        }
        tracing::debug!(user = %self.username, "user state saved");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::tests::{test_keypair_128, test_keypair_128_alt, test_keypair_256};
    use crate::keypair::{key_size, RsaKeypair, ALGO_RSA};

    #[test]
    fn username_bounds() {
        assert!(User::new("", None, None).is_err());
        let long = "u".repeat(NAME_SIZE + 1);
        assert!(User::new(&long, None, None).is_err());
        assert!(User::new("fine", None, None).is_ok());
    }

    #[test]
    fn first_keypair_becomes_default() {
        let user = User::new("alice", None, None).unwrap();
        assert!(user.default_keypair().is_none());

        let kp128 = Arc::new(test_keypair_128());
        let kp256 = Arc::new(test_keypair_256());
        assert!(user.add_keypair(kp128.clone()));
        assert!(user.add_keypair(kp256));
        // Duplicate algorithm/size refused.
        assert!(!user.add_keypair(Arc::new(test_keypair_128_alt())));

        assert_eq!(user.default_keypair().unwrap().size(), kp128.size());
        assert!(user.set_default_keypair(ALGO_RSA, key_size::PUBLIC256));
        assert_eq!(user.default_keypair().unwrap().size(), key_size::PUBLIC256);
        assert!(!user.set_default_keypair(ALGO_RSA, 99));
    }

    #[test]
    fn search_spans_all_keypairs() {
        let user = User::new("bob", None, None).unwrap();
        let kp128 = Arc::new(test_keypair_128());
        let kp256 = Arc::new(test_keypair_256());
        user.add_keypair(kp128.clone());
        user.add_keypair(kp256.clone());

        let (found, hist, public) = user.search_key(&kp256.n()).unwrap();
        assert_eq!(found.size(), kp256.size());
        assert_eq!(hist, crate::keypair::CURRENT_INDEX);
        assert!(public);

        let suite = user.stream_suite();
        let digest = suite.hash(&kp128.n().to_bytes_le_trimmed());
        let (found, _, public) = user.search_key_hash(&digest, &suite).unwrap();
        assert_eq!(found.size(), kp128.size());
        assert!(public);

        assert!(user.search_key(&BigInt::from_u32(5, 4)).is_none());
    }

    #[test]
    fn settings_created_once_per_group() {
        let user = User::new("carol", None, None).unwrap();
        user.add_keypair(Arc::new(test_keypair_128()));
        let a = user.insert_settings("alpha").unwrap();
        let b = user.insert_settings("alpha").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(user.find_settings("beta").is_none());
        user.insert_settings("beta").unwrap();
        assert!(user.find_settings("beta").is_some());
    }

    #[test]
    fn settings_require_a_default_key() {
        let user = User::new("dave", None, None).unwrap();
        assert_eq!(user.insert_settings("g").unwrap_err(), CryptoError::NullPublicKey);
    }

    #[test]
    fn save_writes_keys_and_bank() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let user = User::new("erin", Some(dir.path().to_path_buf()), Some(b"pw")).unwrap();
        user.add_keypair(Arc::new(test_keypair_128()));
        user.key_bank()
            .add_pair("g", "peer", &BigInt::from_u32(9, 8), ALGO_RSA, 4)
            .unwrap();
        user.insert_settings("g").unwrap();
        user.save().unwrap();

        let key_path = dir.path().join("erin.rsa128.key");
        assert!(key_path.exists());
        let loaded = RsaKeypair::load(&key_path, Some(b"pw")).unwrap();
        assert_eq!(loaded.n(), user.default_keypair().unwrap().n());
        assert!(dir.path().join("erin.bank").exists());
        assert!(dir.path().join("erin.g.settings").exists());
        Ok(())
    }
}
