//! Algorithm suites: stream ciphers paired with keyed hashes
//!
//! A suite is an immutable descriptor binding a stream algorithm and a
//! hash algorithm to a hash output size. Two keystreams are registered:
//!
//! - **BLAKE3-XOF**: the BLAKE3 extendable output seeded with the key;
//!   the same construction the transcript hashing uses, so one primitive
//!   covers both concerns.
//! - **HMAC-SHA256-CTR**: HMAC-SHA-256 over a little-endian block
//!   counter.
//!
//! Both are deterministic given (seed, algorithm): equal seeds produce
//! byte-identical keystreams, which is what the gateway's key-transport
//! step relies on.
//!
//! [`StreamEncrypter`]/[`StreamDecrypter`] add the wire discipline: every
//! packet carries a 16-bit synchronization tag, and a decrypter that
//! missed packets fast-forwards its keystream to the tagged position
//! (equal-length packet discipline).

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::OnceLock;

use hmac::{Hmac, Mac};
use sha2::{Digest as _, Sha256};

use crate::error::CryptoError;

/// Stream algorithm ids.
pub const STREAM_BLAKE3_XOF: u16 = 1;
/// See [`STREAM_BLAKE3_XOF`].
pub const STREAM_HMAC_SHA256_CTR: u16 = 2;

/// Hash algorithm ids.
pub const HASH_BLAKE3: u16 = 1;
/// See [`HASH_BLAKE3`].
pub const HASH_SHA256: u16 = 2;

/// Supported hash output sizes, in bytes.
pub mod hash_size {
    pub const HASH64: u16 = 8;
    pub const HASH128: u16 = 16;
    pub const HASH256: u16 = 32;
    pub const HASH512: u16 = 64;
}

/// How far ahead of the local sequence a received tag may run before the
/// decrypter refuses to resynchronize.
const DESYNC_WINDOW: u16 = 64;

// ============================================================================
// Keystreams
// ============================================================================

/// An infinite, deterministic keystream built from a seed.
pub trait StreamCipher: Send {
    /// Next keystream byte.
    fn next_byte(&mut self) -> u8;

    /// XOR the keystream into `data`.
    fn xor_into(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b ^= self.next_byte();
        }
    }

    /// Discard `n` keystream bytes.
    fn skip(&mut self, n: usize) {
        for _ in 0..n {
            self.next_byte();
        }
    }

    /// Algorithm id of this keystream.
    fn algorithm(&self) -> u16;

    /// Algorithm name of this keystream.
    fn algorithm_name(&self) -> &'static str;
}

/// BLAKE3 XOF keystream.
struct Blake3XofStream {
    reader: blake3::OutputReader,
    buf: [u8; 64],
    pos: usize,
}

impl Blake3XofStream {
    fn new(seed: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"peergate.stream.v1");
        hasher.update(seed);
        Self { reader: hasher.finalize_xof(), buf: [0; 64], pos: 64 }
    }
}

impl StreamCipher for Blake3XofStream {
    fn next_byte(&mut self) -> u8 {
        if self.pos >= self.buf.len() {
            self.reader.fill(&mut self.buf);
            self.pos = 0;
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        b
    }

    fn algorithm(&self) -> u16 {
        STREAM_BLAKE3_XOF
    }

    fn algorithm_name(&self) -> &'static str {
        "BLAKE3-XOF"
    }
}

/// HMAC-SHA-256 counter-mode keystream.
struct HmacSha256CtrStream {
    key: Vec<u8>,
    counter: u64,
    buf: [u8; 32],
    pos: usize,
}

impl HmacSha256CtrStream {
    fn new(seed: &[u8]) -> Self {
        Self { key: seed.to_vec(), counter: 0, buf: [0; 32], pos: 32 }
    }

    fn refill(&mut self) {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(&self.counter.to_le_bytes());
        self.buf.copy_from_slice(&mac.finalize().into_bytes());
        self.counter = self.counter.wrapping_add(1);
        self.pos = 0;
    }
}

impl StreamCipher for HmacSha256CtrStream {
    fn next_byte(&mut self) -> u8 {
        if self.pos >= self.buf.len() {
            self.refill();
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        b
    }

    fn algorithm(&self) -> u16 {
        STREAM_HMAC_SHA256_CTR
    }

    fn algorithm_name(&self) -> &'static str {
        "HMAC-SHA256-CTR"
    }
}

// ============================================================================
// Digests
// ============================================================================

/// A hash output carrying its algorithm id.
///
/// Digests of different algorithms or sizes never compare equal.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HashDigest {
    algorithm: u16,
    bytes: Vec<u8>,
}

impl HashDigest {
    /// Wrap raw digest bytes (used when parsing wire messages).
    pub fn from_bytes(algorithm: u16, bytes: &[u8]) -> Self {
        Self { algorithm, bytes: bytes.to_vec() }
    }

    /// Algorithm id that produced this digest.
    pub fn algorithm(&self) -> u16 {
        self.algorithm
    }

    /// Digest bytes.
    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    /// Digest length in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

impl fmt::Debug for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashDigest({}:{})", self.algorithm, hex::encode(&self.bytes))
    }
}

// ============================================================================
// Suites
// ============================================================================

/// Immutable stream + hash descriptor.
#[derive(Clone, PartialEq, Eq)]
pub struct AlgorithmSuite {
    stream_id: u16,
    hash_id: u16,
    hash_size: u16,
}

impl AlgorithmSuite {
    fn new(stream_id: u16, hash_id: u16, hash_size: u16) -> Self {
        Self { stream_id, hash_id, hash_size }
    }

    /// Stream algorithm id.
    pub fn stream_algorithm(&self) -> u16 {
        self.stream_id
    }

    /// Hash algorithm id.
    pub fn hash_algorithm(&self) -> u16 {
        self.hash_id
    }

    /// Configured hash output size in bytes.
    pub fn hash_size(&self) -> u16 {
        self.hash_size
    }

    /// Stream algorithm name.
    pub fn stream_name(&self) -> &'static str {
        match self.stream_id {
            STREAM_BLAKE3_XOF => "BLAKE3-XOF",
            STREAM_HMAC_SHA256_CTR => "HMAC-SHA256-CTR",
            _ => "unknown",
        }
    }

    /// Hash algorithm name.
    pub fn hash_name(&self) -> &'static str {
        match self.hash_id {
            HASH_BLAKE3 => "BLAKE3",
            HASH_SHA256 => "SHA-256",
            _ => "unknown",
        }
    }

    /// Copy of this suite with a different hash output size. The suite
    /// is otherwise immutable.
    pub fn with_hash_size(&self, size: u16) -> Self {
        Self {
            stream_id: self.stream_id,
            hash_id: self.hash_id,
            hash_size: size.clamp(1, hash_size::HASH512),
        }
    }

    /// Build a keystream from `seed`. Seeds are capped at
    /// [`crate::STREAM_SEED_MAX`] bytes; both endpoints apply the same
    /// cap, so oversized key material still agrees.
    pub fn build_stream(&self, seed: &[u8]) -> Box<dyn StreamCipher> {
        let seed = &seed[..seed.len().min(crate::STREAM_SEED_MAX)];
        match self.stream_id {
            STREAM_HMAC_SHA256_CTR => Box::new(HmacSha256CtrStream::new(seed)),
            _ => Box::new(Blake3XofStream::new(seed)),
        }
    }

    /// Hash a byte range to the configured output size.
    pub fn hash(&self, data: &[u8]) -> HashDigest {
        let size = self.hash_size as usize;
        let bytes = match self.hash_id {
            HASH_SHA256 => {
                let full = Sha256::digest(data);
                let mut out = vec![0u8; size];
                let n = size.min(full.len());
                out[..n].copy_from_slice(&full[..n]);
                out
            }
            _ => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(data);
                let mut out = vec![0u8; size];
                hasher.finalize_xof().fill(&mut out);
                out
            }
        };
        HashDigest { algorithm: self.hash_id, bytes }
    }

    /// Sentinel digest for "algorithm chosen, nothing hashed yet".
    pub fn hash_empty(&self) -> HashDigest {
        HashDigest { algorithm: self.hash_id, bytes: vec![0; self.hash_size as usize] }
    }
}

impl fmt::Debug for AlgorithmSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}-{}", self.stream_name(), self.hash_name(), self.hash_size * 8)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Process-wide, append-only suite registry.
///
/// Populated once (either the standard set on first access, or an
/// explicit [`SuiteRegistry::install`] before that) and read-only
/// thereafter.
pub struct SuiteRegistry {
    suites: Vec<AlgorithmSuite>,
    default_index: usize,
}

static REGISTRY: OnceLock<SuiteRegistry> = OnceLock::new();

impl SuiteRegistry {
    fn standard() -> Self {
        Self {
            suites: vec![
                AlgorithmSuite::new(STREAM_BLAKE3_XOF, HASH_BLAKE3, hash_size::HASH256),
                AlgorithmSuite::new(STREAM_HMAC_SHA256_CTR, HASH_SHA256, hash_size::HASH256),
                AlgorithmSuite::new(STREAM_BLAKE3_XOF, HASH_SHA256, hash_size::HASH256),
                AlgorithmSuite::new(STREAM_HMAC_SHA256_CTR, HASH_BLAKE3, hash_size::HASH256),
            ],
            default_index: 0,
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static SuiteRegistry {
        REGISTRY.get_or_init(Self::standard)
    }

    /// Install a custom suite set before first use. Returns `false` when
    /// the registry is already populated.
    pub fn install(suites: Vec<AlgorithmSuite>, default_index: usize) -> bool {
        if suites.is_empty() || default_index >= suites.len() {
            return false;
        }
        REGISTRY.set(SuiteRegistry { suites, default_index }).is_ok()
    }

    /// Look a suite up by (stream id, hash id).
    pub fn find(&self, stream_id: u16, hash_id: u16) -> Option<AlgorithmSuite> {
        self.suites
            .iter()
            .find(|s| s.stream_id == stream_id && s.hash_id == hash_id)
            .cloned()
    }

    /// Look a suite up by (stream name, hash name).
    pub fn find_by_name(&self, stream_name: &str, hash_name: &str) -> Option<AlgorithmSuite> {
        self.suites
            .iter()
            .find(|s| s.stream_name() == stream_name && s.hash_name() == hash_name)
            .cloned()
    }

    /// The default suite.
    pub fn default_suite(&self) -> AlgorithmSuite {
        self.suites[self.default_index].clone()
    }
}

// ============================================================================
// Tagged packet streams
// ============================================================================

/// Outgoing packet encrypter: XORs the keystream over each packet and
/// stamps it with a 16-bit sequence tag.
pub struct StreamEncrypter {
    cipher: Box<dyn StreamCipher>,
    seq: u16,
}

impl StreamEncrypter {
    pub fn new(cipher: Box<dyn StreamCipher>) -> Self {
        Self { cipher, seq: 0 }
    }

    /// Encrypt `data` in place; returns the synchronization tag the
    /// receiver needs.
    pub fn send(&mut self, data: &mut [u8]) -> u16 {
        let tag = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.cipher.xor_into(data);
        tag
    }
}

/// Incoming packet decrypter.
///
/// Tolerates lost packets by fast-forwarding the keystream: when the
/// received tag runs ahead of the local sequence, the keystream is
/// advanced by whole packets of the same length before decrypting. A tag
/// behind the local sequence (a replay) or beyond the resync window is
/// an error.
pub struct StreamDecrypter {
    cipher: Box<dyn StreamCipher>,
    seq: u16,
}

impl StreamDecrypter {
    pub fn new(cipher: Box<dyn StreamCipher>) -> Self {
        Self { cipher, seq: 0 }
    }

    /// Decrypt `data` in place using the packet's tag.
    pub fn receive(&mut self, data: &mut [u8], tag: u16) -> Result<(), CryptoError> {
        let ahead = tag.wrapping_sub(self.seq);
        if ahead > DESYNC_WINDOW {
            return Err(CryptoError::custom(
                "Stream Desynchronized",
                "packet tag outside the resynchronization window",
            ));
        }
        self.cipher.skip(ahead as usize * data.len());
        self.cipher.xor_into(data);
        self.seq = tag.wrapping_add(1);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn default_suite() -> AlgorithmSuite {
        SuiteRegistry::global().default_suite()
    }

    #[test]
    fn keystreams_are_deterministic_per_seed() {
        for suite in [
            SuiteRegistry::global().find(STREAM_BLAKE3_XOF, HASH_BLAKE3).unwrap(),
            SuiteRegistry::global().find(STREAM_HMAC_SHA256_CTR, HASH_SHA256).unwrap(),
        ] {
            let mut a = suite.build_stream(b"seed");
            let mut b = suite.build_stream(b"seed");
            let mut c = suite.build_stream(b"other");
            let first: Vec<u8> = (0..100).map(|_| a.next_byte()).collect();
            let second: Vec<u8> = (0..100).map(|_| b.next_byte()).collect();
            let third: Vec<u8> = (0..100).map(|_| c.next_byte()).collect();
            assert_eq!(first, second);
            assert_ne!(first, third);
        }
    }

    #[test]
    fn hash_respects_configured_size() {
        let suite = default_suite();
        assert_eq!(suite.hash(b"abc").size(), 32);
        let wide = suite.with_hash_size(hash_size::HASH512);
        assert_eq!(wide.hash(b"abc").size(), 64);
        let narrow = suite.with_hash_size(hash_size::HASH64);
        assert_eq!(narrow.hash(b"abc").size(), 8);
        // Same prefix property of the XOF.
        assert_eq!(narrow.hash(b"abc").data(), &wide.hash(b"abc").data()[..8]);
    }

    #[test]
    fn digests_compare_by_algorithm_and_bytes() {
        let b3 = SuiteRegistry::global().find(STREAM_BLAKE3_XOF, HASH_BLAKE3).unwrap();
        let sha = SuiteRegistry::global().find(STREAM_BLAKE3_XOF, HASH_SHA256).unwrap();
        assert_ne!(b3.hash(b"x"), sha.hash(b"x"));
        assert_eq!(b3.hash(b"x"), b3.hash(b"x"));
        assert_eq!(b3.hash_empty().data(), &[0u8; 32]);
    }

    #[test]
    fn registry_finds_by_id_and_name() {
        let reg = SuiteRegistry::global();
        assert!(reg.find(STREAM_BLAKE3_XOF, HASH_BLAKE3).is_some());
        assert!(reg.find(99, HASH_BLAKE3).is_none());
        let byname = reg.find_by_name("HMAC-SHA256-CTR", "SHA-256").unwrap();
        assert_eq!(byname.stream_algorithm(), STREAM_HMAC_SHA256_CTR);
    }

    #[test]
    fn encrypt_decrypt_roundtrip_in_order() {
        let suite = default_suite();
        let mut enc = StreamEncrypter::new(suite.build_stream(b"k"));
        let mut dec = StreamDecrypter::new(suite.build_stream(b"k"));
        for round in 0..4u8 {
            let mut data = vec![round; 256];
            let tag = enc.send(&mut data);
            dec.receive(&mut data, tag).unwrap();
            assert_eq!(data, vec![round; 256]);
        }
    }

    #[test]
    fn decrypter_resynchronizes_after_missed_packets() {
        let suite = default_suite();
        let mut enc = StreamEncrypter::new(suite.build_stream(b"k"));
        let mut dec = StreamDecrypter::new(suite.build_stream(b"k"));

        // Drop one packet, then three.
        let mut lost = vec![0u8; 256];
        enc.send(&mut lost);
        let mut data = vec![7u8; 256];
        let tag = enc.send(&mut data);
        dec.receive(&mut data, tag).unwrap();
        assert_eq!(data, vec![7u8; 256]);

        for _ in 0..3 {
            let mut lost = vec![0u8; 256];
            enc.send(&mut lost);
        }
        let mut data = vec![9u8; 256];
        let tag = enc.send(&mut data);
        dec.receive(&mut data, tag).unwrap();
        assert_eq!(data, vec![9u8; 256]);
    }

    #[test]
    fn decrypter_rejects_tags_outside_window() {
        let suite = default_suite();
        let mut dec = StreamDecrypter::new(suite.build_stream(b"k"));
        let mut data = vec![0u8; 16];
        assert!(dec.receive(&mut data, DESYNC_WINDOW + 1).is_err());
        // A replayed (older) tag wraps far ahead and is rejected too.
        let mut dec = StreamDecrypter::new(suite.build_stream(b"k"));
        let mut first = vec![1u8; 16];
        dec.receive(&mut first, 0).unwrap();
        assert!(dec.receive(&mut data, 0).is_err());
    }
}
