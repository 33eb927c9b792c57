//! RSA keypairs with a bounded history of retired keys
//!
//! A keypair holds the current `(N, D)` plus up to [`HISTORY_MAX`]
//! retired pairs, most recent first. Decoding and signing accept any key
//! that has not yet aged out of history, addressed by a history index or
//! the [`CURRENT_INDEX`] sentinel. The public exponent is fixed at
//! `2^16 + 1`.
//!
//! All externally visible integers carry `2 * size` words of storage so
//! products of two residues never overflow mid-operation.
//!
//! Key generation runs on a background thread; `generating()` polls the
//! task handle and installation happens under the write side of the
//! keypair's lock, so readers always observe a complete pair.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::bigint::BigInt;
use crate::envelope::{EnvelopeReader, EnvelopeWriter, Unlock};
use crate::error::CryptoError;
use crate::prime;
use crate::suite::{AlgorithmSuite, HashDigest, SuiteRegistry};

/// Public-key algorithm ids.
pub const ALGO_NULL: u16 = 0;
/// See [`ALGO_NULL`].
pub const ALGO_RSA: u16 = 1;

/// History index addressing the current pair.
pub const CURRENT_INDEX: usize = usize::MAX;

/// Hard cap on retained retired keys.
pub const HISTORY_MAX: usize = 20;

/// Password used for keypair files when none is configured.
pub const DEFAULT_FILE_PASSWORD: &[u8] = b"default";

/// Key sizes in 32-bit words.
pub mod key_size {
    pub const PUBLIC128: u16 = 4;
    pub const PUBLIC256: u16 = 8;
    pub const PUBLIC512: u16 = 16;
}

/// The fixed public exponent `2^16 + 1` at the given word width.
pub fn public_exponent(len: usize) -> BigInt {
    BigInt::from_u32(65_537, len)
}

// ============================================================================
// Static RSA operations
// ============================================================================

/// `code ^ e mod n` against an arbitrary public key. The input must be
/// strictly below `n`; `code == n` fails.
pub fn rsa_encode(code: &BigInt, public_n: &BigInt, words: u16) -> Result<BigInt, CryptoError> {
    if code.cmp_value(public_n) != Ordering::Less {
        return Err(CryptoError::PublicKeySizeWrong);
    }
    let len = words as usize * 2;
    code.resized(len)
        .pow_mod(&public_exponent(len), &public_n.resized(len))
        .ok_or(CryptoError::PublicKeySizeWrong)
}

/// Hybrid form of [`rsa_encode`]: packs `code` little-endian, encodes,
/// and writes the result back into the same buffer, zero-padded when the
/// value is shorter and truncated (with loss) when longer.
pub fn rsa_encode_bytes(code: &mut [u8], public_n: &BigInt, words: u16) -> Result<(), CryptoError> {
    let value = BigInt::from_bytes_le(code);
    let encoded = rsa_encode(&value, public_n, words)?;
    write_back(code, &encoded);
    Ok(())
}

fn write_back(code: &mut [u8], value: &BigInt) {
    let bytes = value.to_bytes_le_trimmed();
    code.fill(0);
    let n = bytes.len().min(code.len());
    code[..n].copy_from_slice(&bytes[..n]);
}

// ============================================================================
// Keypair
// ============================================================================

struct OldKey {
    n: BigInt,
    d: BigInt,
    timestamp: i64,
}

struct KeyState {
    size: u16,
    n: BigInt,
    d: BigInt,
    timestamp: i64,
    history: Vec<OldKey>,
    history_cap: usize,
}

impl KeyState {
    fn push_old(&mut self) {
        if self.history_cap == 0 || self.n.is_zero() {
            return;
        }
        let old = OldKey {
            n: std::mem::replace(&mut self.n, BigInt::zero(0)),
            d: std::mem::replace(&mut self.d, BigInt::zero(0)),
            timestamp: self.timestamp,
        };
        self.history.insert(0, old);
        while self.history.len() > self.history_cap {
            self.history.pop();
        }
    }
}

/// An RSA keypair with rotation history.
pub struct RsaKeypair {
    state: Arc<RwLock<KeyState>>,
    generator: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RsaKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKeypair").finish_non_exhaustive()
    }
}

impl RsaKeypair {
    /// Keypair from raw current-key words. Storage is padded to twice the
    /// word size.
    pub fn from_parts(n: &[u32], d: &[u32], size: u16, timestamp: i64) -> Self {
        let mut n = BigInt::from_words(n);
        let mut d = BigInt::from_words(d);
        n.expand(size as usize * 2);
        d.expand(size as usize * 2);
        Self {
            state: Arc::new(RwLock::new(KeyState {
                size,
                n,
                d,
                timestamp,
                history: Vec::new(),
                history_cap: HISTORY_MAX,
            })),
            generator: Mutex::new(None),
        }
    }

    /// Empty keypair that immediately starts generating in the
    /// background. Readers observe zero keys until installation.
    pub fn generate(size: u16) -> Self {
        let kp = Self::from_parts(&[], &[], size, 0);
        kp.generate_new_keys();
        kp
    }

    /// Generate synchronously on the calling thread.
    pub fn generate_blocking(size: u16) -> Self {
        let kp = Self::from_parts(&[], &[], size, 0);
        generate_into(&kp.state);
        kp
    }

    /// Spawn a rotation unless one is already running.
    pub fn generate_new_keys(&self) {
        let mut guard = self.generator.lock().expect("generator lock poisoned");
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        if let Some(handle) = guard.take() {
            let _ = handle.join();
        }
        let state = Arc::clone(&self.state);
        *guard = Some(std::thread::spawn(move || generate_into(&state)));
    }

    /// True while a generation task is in flight.
    pub fn generating(&self) -> bool {
        let mut guard = self.generator.lock().expect("generator lock poisoned");
        match guard.as_ref() {
            Some(handle) if handle.is_finished() => {
                if let Some(handle) = guard.take() {
                    let _ = handle.join();
                }
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Block until any in-flight generation completes.
    pub fn wait_ready(&self) {
        let handle = self.generator.lock().expect("generator lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Deep copy, history included. The copy shares no state with the
    /// original.
    pub fn duplicate(&self) -> Self {
        let state = self.state.read().expect("key lock poisoned");
        let copy = KeyState {
            size: state.size,
            n: state.n.clone(),
            d: state.d.clone(),
            timestamp: state.timestamp,
            history: state
                .history
                .iter()
                .map(|o| OldKey { n: o.n.clone(), d: o.d.clone(), timestamp: o.timestamp })
                .collect(),
            history_cap: state.history_cap,
        };
        Self { state: Arc::new(RwLock::new(copy)), generator: Mutex::new(None) }
    }

    /// Algorithm id (always RSA here).
    pub fn algorithm(&self) -> u16 {
        ALGO_RSA
    }

    /// Key size in words.
    pub fn size(&self) -> u16 {
        self.state.read().expect("key lock poisoned").size
    }

    /// Current public key.
    pub fn n(&self) -> BigInt {
        self.state.read().expect("key lock poisoned").n.clone()
    }

    /// Current private key.
    pub fn d(&self) -> BigInt {
        self.state.read().expect("key lock poisoned").d.clone()
    }

    /// Creation timestamp of the current pair.
    pub fn timestamp(&self) -> i64 {
        self.state.read().expect("key lock poisoned").timestamp
    }

    /// Number of retired pairs currently held.
    pub fn history_len(&self) -> usize {
        self.state.read().expect("key lock poisoned").history.len()
    }

    /// Retired public key at `index` (0 = most recent), or the current
    /// one for [`CURRENT_INDEX`].
    pub fn old_n(&self, index: usize) -> Option<BigInt> {
        let state = self.state.read().expect("key lock poisoned");
        if index == CURRENT_INDEX {
            return Some(state.n.clone());
        }
        state.history.get(index).map(|o| o.n.clone())
    }

    /// Retired private key at `index`.
    pub fn old_d(&self, index: usize) -> Option<BigInt> {
        let state = self.state.read().expect("key lock poisoned");
        if index == CURRENT_INDEX {
            return Some(state.d.clone());
        }
        state.history.get(index).map(|o| o.d.clone())
    }

    /// Timestamp of the retired pair at `index`.
    pub fn old_timestamp(&self, index: usize) -> Option<i64> {
        let state = self.state.read().expect("key lock poisoned");
        if index == CURRENT_INDEX {
            return Some(state.timestamp);
        }
        state.history.get(index).map(|o| o.timestamp)
    }

    /// Cap the history length (hard-limited to [`HISTORY_MAX`]), evicting
    /// the oldest entries if needed.
    pub fn set_history(&self, cap: usize) {
        if cap > HISTORY_MAX {
            return;
        }
        let mut state = self.state.write().expect("key lock poisoned");
        state.history_cap = cap;
        while state.history.len() > cap {
            state.history.pop();
        }
    }

    /// Install a new current pair, retiring the old one into history.
    pub fn add_key_pair(&self, n: &BigInt, d: &BigInt, timestamp: i64) {
        let mut state = self.state.write().expect("key lock poisoned");
        state.push_old();
        let width = state.size as usize * 2;
        state.n = n.resized(width);
        state.d = d.resized(width);
        state.timestamp = timestamp;
    }

    // ------------------------------ Encode/decode ------------------------------

    /// Encode against `public_n`, or against this pair's own `N` when
    /// none is given.
    pub fn encode(&self, code: &BigInt, public_n: Option<&BigInt>) -> Result<BigInt, CryptoError> {
        let state = self.state.read().expect("key lock poisoned");
        let n = match public_n {
            Some(n) => n,
            None => &state.n,
        };
        rsa_encode(code, n, state.size)
    }

    /// Hybrid byte-buffer encode; see [`rsa_encode_bytes`].
    pub fn encode_bytes(&self, code: &mut [u8], public_n: Option<&BigInt>) -> Result<(), CryptoError> {
        let state = self.state.read().expect("key lock poisoned");
        let n = match public_n {
            Some(n) => n,
            None => &state.n,
        };
        rsa_encode_bytes(code, n, state.size)
    }

    /// Decode with the current private key: `code ^ D mod N`.
    pub fn decode(&self, code: &BigInt) -> Result<BigInt, CryptoError> {
        self.decode_at(code, CURRENT_INDEX)
    }

    /// Decode with the pair at `history` ([`CURRENT_INDEX`] for the
    /// current one).
    pub fn decode_at(&self, code: &BigInt, history: usize) -> Result<BigInt, CryptoError> {
        let state = self.state.read().expect("key lock poisoned");
        let (n, d) = if history == CURRENT_INDEX {
            (&state.n, &state.d)
        } else {
            let old = state.history.get(history).ok_or(CryptoError::NullPublicKey)?;
            (&old.n, &old.d)
        };
        if n.is_zero() {
            return Err(CryptoError::NullPublicKey);
        }
        if code.cmp_value(n) == Ordering::Greater {
            return Err(CryptoError::PublicKeySizeWrong);
        }
        let len = state.size as usize * 2;
        code.resized(len)
            .pow_mod(&d.resized(len), &n.resized(len))
            .ok_or(CryptoError::PublicKeySizeWrong)
    }

    /// Byte-buffer decode in place, with the same pad/truncate behavior
    /// as the hybrid encode.
    pub fn decode_bytes(&self, code: &mut [u8], history: usize) -> Result<(), CryptoError> {
        let value = BigInt::from_bytes_le(code);
        let decoded = self.decode_at(&value, history)?;
        write_back(code, &decoded);
        Ok(())
    }

    // ------------------------------ Key search ------------------------------

    /// Locate `key` among the current and historical halves. Returns
    /// `(history_index, is_public)`; the private half is searched first,
    /// as is the current pair.
    pub fn search_key(&self, key: &BigInt) -> Option<(usize, bool)> {
        let state = self.state.read().expect("key lock poisoned");
        if key.cmp_value(&state.d) == Ordering::Equal {
            return Some((CURRENT_INDEX, false));
        }
        if key.cmp_value(&state.n) == Ordering::Equal {
            return Some((CURRENT_INDEX, true));
        }
        for (i, old) in state.history.iter().enumerate() {
            if key.cmp_value(&old.d) == Ordering::Equal {
                return Some((i, false));
            }
        }
        for (i, old) in state.history.iter().enumerate() {
            if key.cmp_value(&old.n) == Ordering::Equal {
                return Some((i, true));
            }
        }
        None
    }

    /// Locate a key by its hash under the caller's suite. Each stored
    /// half is hashed over its trimmed little-endian bytes and compared
    /// against `digest`.
    pub fn search_hash(&self, digest: &HashDigest, suite: &AlgorithmSuite) -> Option<(usize, bool)> {
        let suite = if suite.hash_algorithm() == digest.algorithm() {
            suite.clone()
        } else {
            SuiteRegistry::global().find(suite.stream_algorithm(), digest.algorithm())?
        };
        let suite = suite.with_hash_size(digest.size() as u16);
        let matches = |value: &BigInt| suite.hash(&value.to_bytes_le_trimmed()) == *digest;

        let state = self.state.read().expect("key lock poisoned");
        if matches(&state.d) {
            return Some((CURRENT_INDEX, false));
        }
        if matches(&state.n) {
            return Some((CURRENT_INDEX, true));
        }
        for (i, old) in state.history.iter().enumerate() {
            if matches(&old.d) {
                return Some((i, false));
            }
        }
        for (i, old) in state.history.iter().enumerate() {
            if matches(&old.n) {
                return Some((i, true));
            }
        }
        None
    }

    // ------------------------------ Persistence ------------------------------

    /// Save to `path` through a password-sealed envelope. The password
    /// falls back to `"default"` when none is given, matching the load
    /// path.
    pub fn save(
        &self,
        path: &Path,
        password: Option<&[u8]>,
        suite: &AlgorithmSuite,
    ) -> Result<(), CryptoError> {
        if self.generating() {
            return Err(CryptoError::custom(
                "Key Generation Running",
                "cannot save while keys are being generated",
            ));
        }
        let state = self.state.read().expect("key lock poisoned");
        let size = state.size as usize;

        let mut writer =
            EnvelopeWriter::with_password(path, password.unwrap_or(DEFAULT_FILE_PASSWORD), suite)?;

        let mut head = Vec::with_capacity(12);
        head.extend_from_slice(&state.size.to_le_bytes());
        head.extend_from_slice(&ALGO_RSA.to_le_bytes());
        head.extend_from_slice(&state.timestamp.to_le_bytes());
        writer.write(&head)?;

        let write_pair = |writer: &mut EnvelopeWriter, n: &BigInt, d: &BigInt| {
            let mut block = Vec::with_capacity(size * 8);
            for value in [n, d] {
                for w in &value.words()[..size] {
                    block.extend_from_slice(&w.to_le_bytes());
                }
            }
            writer.write(&block)
        };
        write_pair(&mut writer, &state.n, &state.d)?;

        writer.write(&(state.history.len() as u16).to_le_bytes())?;
        for old in &state.history {
            writer.write(&old.timestamp.to_le_bytes())?;
            write_pair(&mut writer, &old.n, &old.d)?;
        }
        writer.finish()
    }

    /// Load a keypair previously written by [`RsaKeypair::save`].
    pub fn load(path: &Path, password: Option<&[u8]>) -> Result<Self, CryptoError> {
        let mut reader = EnvelopeReader::open(
            path,
            Unlock::Password(password.unwrap_or(DEFAULT_FILE_PASSWORD)),
        )?;

        let mut head = [0u8; 12];
        reader.read_exact(&mut head)?;
        let size = u16::from_le_bytes([head[0], head[1]]);
        let algo = u16::from_le_bytes([head[2], head[3]]);
        if algo != ALGO_RSA {
            return Err(CryptoError::IllegalAlgorithmBind("RSA file read".into()));
        }
        if size == 0 {
            return Err(CryptoError::FileFormat);
        }
        let timestamp = i64::from_le_bytes(head[4..12].try_into().expect("8 bytes"));

        let mut read_pair = |reader: &mut EnvelopeReader| -> Result<(BigInt, BigInt), CryptoError> {
            let mut block = vec![0u8; size as usize * 8];
            reader.read_exact(&mut block)?;
            let half = size as usize * 4;
            Ok((BigInt::from_bytes_le(&block[..half]), BigInt::from_bytes_le(&block[half..])))
        };

        let (n, d) = read_pair(&mut reader)?;
        let kp = Self::from_parts(n.words(), d.words(), size, timestamp);

        let mut count_buf = [0u8; 2];
        reader.read_exact(&mut count_buf)?;
        let count = u16::from_le_bytes(count_buf) as usize;
        if count > HISTORY_MAX {
            return Err(CryptoError::custom(
                "History Size",
                "history length invalid, must be at most 20",
            ));
        }

        let width = size as usize * 2;
        let mut state = kp.state.write().expect("key lock poisoned");
        for _ in 0..count {
            let mut ts_buf = [0u8; 8];
            reader.read_exact(&mut ts_buf)?;
            let (n, d) = read_pair(&mut reader)?;
            state.history.push(OldKey {
                n: n.resized(width),
                d: d.resized(width),
                timestamp: i64::from_le_bytes(ts_buf),
            });
        }
        drop(state);
        Ok(kp)
    }
}

/// Generate a fresh pair and install it under the write lock. Retries
/// until the public exponent is invertible mod φ.
fn generate_into(state: &Arc<RwLock<KeyState>>) {
    let size = state.read().expect("key lock poisoned").size as usize;
    let width = size * 2;
    let mut rng = rand::thread_rng();
    let e = public_exponent(width);

    let started = std::time::Instant::now();
    let (n, d) = loop {
        let p = prime::generate_prime(width, size / 2, prime::DEFAULT_ROUNDS, &mut rng);
        let q = prime::generate_prime(width, size / 2, prime::DEFAULT_ROUNDS, &mut rng);
        let n = match p.checked_mul(&q) {
            Some(n) => n,
            None => continue,
        };
        let one = BigInt::from_u32(1, width);
        let phi = match (p.checked_sub(&one), q.checked_sub(&one)) {
            (Some(pm), Some(qm)) => match pm.checked_mul(&qm) {
                Some(phi) => phi,
                None => continue,
            },
            _ => continue,
        };
        if let Some(d) = e.mod_inverse(&phi) {
            break (n, d);
        }
    };
    tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, bits = size * 32, "rsa pair generated");

    let mut guard = state.write().expect("key lock poisoned");
    guard.push_old();
    guard.n = n.resized(width);
    guard.d = d.resized(width);
    guard.timestamp = chrono::Utc::now().timestamp();
}

// ============================================================================
// Public-key algorithm registry
// ============================================================================

/// Descriptor for an RSA-like public-key algorithm at a key size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyScheme {
    algo: u16,
    key_words: u16,
}

impl PublicKeyScheme {
    /// Algorithm id.
    pub fn algorithm(&self) -> u16 {
        self.algo
    }

    /// Algorithm name.
    pub fn name(&self) -> &'static str {
        match self.algo {
            ALGO_RSA => "RSA",
            _ => "NULL Public Key",
        }
    }

    /// Key size in words.
    pub fn key_words(&self) -> u16 {
        self.key_words
    }

    /// Copy at a different key size.
    pub fn with_key_words(&self, key_words: u16) -> Self {
        Self { algo: self.algo, key_words }
    }

    /// Key byte length on the wire.
    pub fn key_bytes(&self) -> usize {
        self.key_words as usize * 4
    }

    /// Pack wire bytes into a key value padded for this scheme.
    pub fn convert(&self, bytes: &[u8]) -> BigInt {
        let mut value = BigInt::from_bytes_le(bytes);
        value.expand(self.key_words as usize * 2);
        value
    }

    /// Public-key encode a value.
    pub fn encode(&self, code: &BigInt, public_n: &BigInt) -> Result<BigInt, CryptoError> {
        rsa_encode(code, public_n, self.key_words)
    }

    /// Public-key encode a byte buffer in place.
    pub fn encode_bytes(&self, code: &mut [u8], public_n: &BigInt) -> Result<(), CryptoError> {
        rsa_encode_bytes(code, public_n, self.key_words)
    }
}

/// Process-wide registry of public-key schemes, keyed by algorithm id
/// and name.
pub struct PublicKeyRegistry {
    schemes: Vec<PublicKeyScheme>,
}

static PK_REGISTRY: std::sync::OnceLock<PublicKeyRegistry> = std::sync::OnceLock::new();

impl PublicKeyRegistry {
    /// The process-wide registry.
    pub fn global() -> &'static PublicKeyRegistry {
        PK_REGISTRY.get_or_init(|| PublicKeyRegistry {
            schemes: vec![PublicKeyScheme { algo: ALGO_RSA, key_words: key_size::PUBLIC256 }],
        })
    }

    /// Look up by algorithm id.
    pub fn find(&self, algo: u16) -> Option<PublicKeyScheme> {
        self.schemes.iter().find(|s| s.algo == algo).cloned()
    }

    /// Look up by algorithm name.
    pub fn find_by_name(&self, name: &str) -> Option<PublicKeyScheme> {
        self.schemes.iter().find(|s| s.name() == name).cloned()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::OnceLock;

    /// Shared 128-bit keypair; generated once per test binary.
    pub(crate) fn test_keypair_128() -> RsaKeypair {
        static KEY: OnceLock<RsaKeypair> = OnceLock::new();
        KEY.get_or_init(|| RsaKeypair::generate_blocking(key_size::PUBLIC128)).duplicate()
    }

    /// A second, distinct 128-bit keypair for rotation scenarios.
    pub(crate) fn test_keypair_128_alt() -> RsaKeypair {
        static KEY: OnceLock<RsaKeypair> = OnceLock::new();
        KEY.get_or_init(|| RsaKeypair::generate_blocking(key_size::PUBLIC128)).duplicate()
    }

    /// Shared 256-bit keypair; generated once per test binary.
    pub(crate) fn test_keypair_256() -> RsaKeypair {
        static KEY: OnceLock<RsaKeypair> = OnceLock::new();
        KEY.get_or_init(|| RsaKeypair::generate_blocking(key_size::PUBLIC256)).duplicate()
    }

    #[test]
    fn generated_pair_satisfies_rsa_identity() {
        let kp = test_keypair_128();
        assert!(!kp.n().is_zero());
        assert!(!kp.d().is_zero());
        let m = BigInt::from_u32(0xCAFE, kp.size() as usize * 2);
        let c = kp.encode(&m, None).unwrap();
        assert_ne!(c, m);
        assert_eq!(kp.decode(&c).unwrap(), m);
    }

    #[test]
    fn byte_roundtrip_for_short_payloads() {
        let kp = test_keypair_256();
        let key_bytes = kp.size() as usize * 4;
        // Any payload up to key_bytes - 1 encodes below N.
        let mut buf = vec![0u8; key_bytes];
        let payload = b"attack at dawn";
        buf[..payload.len()].copy_from_slice(payload);
        let original = buf.clone();

        kp.encode_bytes(&mut buf, None).unwrap();
        assert_ne!(buf, original);
        kp.decode_bytes(&mut buf, CURRENT_INDEX).unwrap();
        assert_eq!(buf, original);
    }

    #[test]
    fn oversized_code_is_rejected() {
        let kp = test_keypair_128();
        let width = kp.size() as usize * 2;
        // One above N fails both directions.
        let big = kp.n().resized(width).checked_add(&BigInt::from_u32(1, width)).unwrap();
        assert_eq!(kp.encode(&big, None).unwrap_err(), CryptoError::PublicKeySizeWrong);
        assert_eq!(kp.decode(&big).unwrap_err(), CryptoError::PublicKeySizeWrong);

        // Exactly N: the encode bound is strict, the decode bound is not.
        let n = kp.n();
        assert_eq!(kp.encode(&n, None).unwrap_err(), CryptoError::PublicKeySizeWrong);
        assert!(kp.decode(&n).is_ok());
    }

    #[test]
    fn rotation_pushes_history_and_old_keys_still_decode() {
        let kp = test_keypair_128();
        let (old_n, old_d, old_ts) = (kp.n(), kp.d(), kp.timestamp());

        let next = test_keypair_128_alt();
        kp.add_key_pair(&next.n(), &next.d(), old_ts + 5);

        assert_eq!(kp.history_len(), 1);
        assert_eq!(kp.old_n(0).unwrap(), old_n);
        assert_eq!(kp.old_d(0).unwrap(), old_d);
        assert_eq!(kp.old_timestamp(0).unwrap(), old_ts);

        // A message under the retired key decodes through the history index.
        let m = BigInt::from_u32(0xBEEF, kp.size() as usize * 2);
        let c = rsa_encode(&m, &old_n, kp.size()).unwrap();
        assert_eq!(kp.decode_at(&c, 0).unwrap(), m);
        // And the current index uses the fresh key.
        let c2 = kp.encode(&m, None).unwrap();
        assert_eq!(kp.decode_at(&c2, CURRENT_INDEX).unwrap(), m);
    }

    #[test]
    fn history_evicts_beyond_cap() {
        let kp = test_keypair_128();
        kp.set_history(2);
        let donor = test_keypair_128();
        for i in 0..4 {
            kp.add_key_pair(&donor.n(), &donor.d(), i);
        }
        assert_eq!(kp.history_len(), 2);
        assert!(kp.old_n(2).is_none());
        // A cap above the hard limit is refused.
        kp.set_history(HISTORY_MAX + 1);
        assert_eq!(kp.history_len(), 2);
    }

    #[test]
    fn search_finds_current_and_historical_halves() {
        let kp = test_keypair_128();
        let (old_n, old_d) = (kp.n(), kp.d());
        let next = test_keypair_128_alt();
        kp.add_key_pair(&next.n(), &next.d(), 99);

        assert_eq!(kp.search_key(&kp.n()), Some((CURRENT_INDEX, true)));
        assert_eq!(kp.search_key(&kp.d()), Some((CURRENT_INDEX, false)));
        assert_eq!(kp.search_key(&old_n), Some((0, true)));
        assert_eq!(kp.search_key(&old_d), Some((0, false)));
        assert_eq!(kp.search_key(&BigInt::from_u32(12345, 8)), None);
    }

    #[test]
    fn search_by_hash_matches_search_by_value() {
        let kp = test_keypair_128();
        let suite = SuiteRegistry::global().default_suite();
        let digest = suite.hash(&kp.n().to_bytes_le_trimmed());
        assert_eq!(kp.search_hash(&digest, &suite), Some((CURRENT_INDEX, true)));

        let other = suite.hash(b"unrelated");
        assert_eq!(kp.search_hash(&other, &suite), None);
    }

    #[test]
    fn save_load_roundtrip_with_history() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("keys.bin");

        let kp = test_keypair_128();
        let donor = test_keypair_128();
        kp.add_key_pair(&donor.n(), &donor.d(), 1234);

        let suite = SuiteRegistry::global().default_suite();
        kp.save(&path, Some(b"open sesame"), &suite).unwrap();

        let loaded = RsaKeypair::load(&path, Some(b"open sesame")).unwrap();
        assert_eq!(loaded.size(), kp.size());
        assert_eq!(loaded.n(), kp.n());
        assert_eq!(loaded.d(), kp.d());
        assert_eq!(loaded.history_len(), 1);
        assert_eq!(loaded.old_n(0).unwrap(), kp.old_n(0).unwrap());
        assert_eq!(loaded.old_timestamp(0), kp.old_timestamp(0));

        // Wrong password refuses.
        assert!(RsaKeypair::load(&path, Some(b"nope")).is_err());
        Ok(())
    }

    #[test]
    fn default_password_applies_when_none_given() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("keys.bin");
        let kp = test_keypair_128();
        let suite = SuiteRegistry::global().default_suite();
        kp.save(&path, None, &suite).unwrap();
        let loaded = RsaKeypair::load(&path, None).unwrap();
        assert_eq!(loaded.n(), kp.n());
        Ok(())
    }

    #[test]
    fn background_generation_reports_and_installs() {
        let kp = RsaKeypair::generate(key_size::PUBLIC128);
        // Either still running or already done; both observable states
        // are legal. After waiting the keys must be installed.
        let _ = kp.generating();
        kp.wait_ready();
        assert!(!kp.generating());
        assert!(!kp.n().is_zero());
        let m = BigInt::from_u32(77, kp.size() as usize * 2);
        let c = kp.encode(&m, None).unwrap();
        assert_eq!(kp.decode(&c).unwrap(), m);
    }

    #[test]
    fn scheme_registry_round_trips_values() {
        let scheme = PublicKeyRegistry::global().find(ALGO_RSA).unwrap();
        assert_eq!(scheme.name(), "RSA");
        let sized = scheme.with_key_words(key_size::PUBLIC128);
        assert_eq!(sized.key_bytes(), 16);

        let kp = test_keypair_128();
        let m = BigInt::from_u32(4242, 8);
        let c = sized.encode(&m, &kp.n()).unwrap();
        assert_eq!(kp.decode(&c).unwrap(), m);
    }
}
