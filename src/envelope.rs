//! Encrypted file containers for persisted key material
//!
//! A sealed file opens with a self-describing header naming the
//! algorithms involved, a lock-type byte, and one or two check blocks:
//!
//! ```text
//! [pk_algo u16] [pk_size u16] [stream_algo u16] [hash_algo u16] [hash_size u16]
//! [lock_type u8]
//! PRIVATE_UNLOCK: [hash(stretched password)]
//! PUBLIC_UNLOCK:  [session key ^ e mod N] [hash(N)]
//! DOUBLE_LOCK:    [session key ^ e mod N] [hash(N)] [hash(stretched password)]
//! ```
//!
//! followed by the payload run through the suite's stream cipher.
//! Passwords are stretched with Argon2 under a fixed domain salt before
//! they seed anything; the raw password never touches the keystream.

#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::bigint::BigInt;
use crate::error::CryptoError;
use crate::keypair::{self, RsaKeypair};
use crate::suite::{AlgorithmSuite, StreamCipher, SuiteRegistry};

/// Content readable by the keypair that locked the file.
pub const PRIVATE_UNLOCK: u8 = 1;
/// Content readable by anyone holding the named public key's private half.
pub const PUBLIC_UNLOCK: u8 = 2;
/// Requires both the private key and the password.
pub const DOUBLE_LOCK: u8 = 3;

/// Password length bounds.
const PASSWORD_MIN: usize = 1;
const PASSWORD_MAX: usize = 256;

const STRETCH_SALT: &[u8] = b"peergate.envelope.v1";
const STRETCHED_LEN: usize = 32;

/// Argon2-stretch a password into a stream seed.
pub fn stretch_password(password: &[u8]) -> Result<[u8; STRETCHED_LEN], CryptoError> {
    if password.len() < PASSWORD_MIN {
        return Err(CryptoError::PasswordTooSmall);
    }
    if password.len() > PASSWORD_MAX {
        return Err(CryptoError::PasswordTooLarge);
    }
    let mut out = [0u8; STRETCHED_LEN];
    argon2::Argon2::default()
        .hash_password_into(password, STRETCH_SALT, &mut out)
        .map_err(|_| CryptoError::HashGeneration)?;
    Ok(out)
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

// ============================================================================
// Writer
// ============================================================================

/// Streaming writer for a sealed file.
pub struct EnvelopeWriter {
    file: File,
    cipher: Box<dyn StreamCipher>,
}

impl EnvelopeWriter {
    /// Seal under a password (PRIVATE_UNLOCK).
    pub fn with_password(
        path: &Path,
        password: &[u8],
        suite: &AlgorithmSuite,
    ) -> Result<Self, CryptoError> {
        let stretched = stretch_password(password)?;

        let mut header = Vec::with_capacity(11 + suite.hash_size() as usize);
        push_u16(&mut header, 0);
        push_u16(&mut header, 0);
        push_u16(&mut header, suite.stream_algorithm());
        push_u16(&mut header, suite.hash_algorithm());
        push_u16(&mut header, suite.hash_size());
        header.push(PRIVATE_UNLOCK);
        header.extend_from_slice(suite.hash(&stretched).data());

        let mut file = File::create(path).map_err(|_| CryptoError::FileOpen)?;
        file.write_all(&header).map_err(|_| CryptoError::FileOpen)?;
        Ok(Self { file, cipher: suite.build_stream(&stretched) })
    }

    /// Seal under a public key (PUBLIC_UNLOCK), optionally also under a
    /// password (DOUBLE_LOCK).
    pub fn with_public_key(
        path: &Path,
        public_n: &BigInt,
        pk_algo: u16,
        pk_words: u16,
        password: Option<&[u8]>,
        suite: &AlgorithmSuite,
    ) -> Result<Self, CryptoError> {
        if public_n.is_zero() {
            return Err(CryptoError::NullPublicKey);
        }
        let key_bytes = pk_words as usize * 4;

        // Random session key strictly below N: the top byte stays zero.
        let mut session = vec![0u8; key_bytes];
        rand::Rng::fill(&mut rand::thread_rng(), &mut session[..key_bytes - 1]);

        let mut encoded = session.clone();
        keypair::rsa_encode_bytes(&mut encoded, public_n, pk_words)?;

        let stretched = password.map(|p| stretch_password(p)).transpose()?;
        let lock = if stretched.is_some() { DOUBLE_LOCK } else { PUBLIC_UNLOCK };

        let mut header = Vec::new();
        push_u16(&mut header, pk_algo);
        push_u16(&mut header, pk_words);
        push_u16(&mut header, suite.stream_algorithm());
        push_u16(&mut header, suite.hash_algorithm());
        push_u16(&mut header, suite.hash_size());
        header.push(lock);
        header.extend_from_slice(&encoded);
        header.extend_from_slice(suite.hash(&public_n.to_bytes_le_trimmed()).data());
        let mut seed = session.clone();
        if let Some(stretched) = &stretched {
            header.extend_from_slice(suite.hash(stretched).data());
            seed.extend_from_slice(stretched);
        }

        let mut file = File::create(path).map_err(|_| CryptoError::FileOpen)?;
        file.write_all(&header).map_err(|_| CryptoError::FileOpen)?;
        Ok(Self { file, cipher: suite.build_stream(&seed) })
    }

    /// Encrypt and append `data`.
    pub fn write(&mut self, data: &[u8]) -> Result<(), CryptoError> {
        let mut buf = data.to_vec();
        self.cipher.xor_into(&mut buf);
        self.file.write_all(&buf).map_err(|_| CryptoError::ActionOnFileInError)
    }

    /// Flush the underlying file.
    pub fn finish(mut self) -> Result<(), CryptoError> {
        self.file.flush().map_err(|_| CryptoError::ActionOnFileInError)
    }
}

// ============================================================================
// Reader
// ============================================================================

/// What the caller holds to open a sealed file.
#[derive(Clone, Copy)]
pub enum Unlock<'a> {
    /// A password for PRIVATE_UNLOCK (or the password half of a double
    /// lock when combined with a keypair).
    Password(&'a [u8]),
    /// A keypair whose private half decrypts the session key.
    Keypair(&'a RsaKeypair),
    /// Both halves, for DOUBLE_LOCK files.
    Both(&'a RsaKeypair, &'a [u8]),
}

/// Streaming reader for a sealed file.
pub struct EnvelopeReader {
    file: File,
    cipher: Box<dyn StreamCipher>,
    remaining: u64,
    suite: AlgorithmSuite,
    pk_algo: u16,
    pk_words: u16,
}

impl std::fmt::Debug for EnvelopeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeReader")
            .field("file", &self.file)
            .field("remaining", &self.remaining)
            .field("suite", &self.suite)
            .field("pk_algo", &self.pk_algo)
            .field("pk_words", &self.pk_words)
            .finish()
    }
}

impl EnvelopeReader {
    /// Open and verify a sealed file.
    pub fn open(path: &Path, unlock: Unlock<'_>) -> Result<Self, CryptoError> {
        let mut file = File::open(path).map_err(|_| CryptoError::FileOpen)?;
        let total = file.metadata().map_err(|_| CryptoError::FileOpen)?.len();

        let mut head = [0u8; 11];
        file.read_exact(&mut head).map_err(|_| CryptoError::FileFormat)?;
        let pk_algo = read_u16(&head, 0);
        let pk_words = read_u16(&head, 2);
        let stream_algo = read_u16(&head, 4);
        let hash_algo = read_u16(&head, 6);
        let hash_sz = read_u16(&head, 8);
        let lock = head[10];

        let suite = SuiteRegistry::global()
            .find(stream_algo, hash_algo)
            .ok_or_else(|| CryptoError::IllegalAlgorithmBind("unknown stream suite".into()))?
            .with_hash_size(hash_sz);

        let mut consumed = 11u64;
        let mut read_block = |file: &mut File, len: usize| -> Result<Vec<u8>, CryptoError> {
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).map_err(|_| CryptoError::FileFormat)?;
            consumed += len as u64;
            Ok(buf)
        };

        let seed: Vec<u8> = match lock {
            PRIVATE_UNLOCK => {
                let password = match unlock {
                    Unlock::Password(p) | Unlock::Both(_, p) => p,
                    Unlock::Keypair(_) => return Err(CryptoError::KeyMissing),
                };
                let stretched = stretch_password(password)?;
                let check = read_block(&mut file, hash_sz as usize)?;
                if suite.hash(&stretched).data() != check.as_slice() {
                    return Err(CryptoError::HashCompare);
                }
                stretched.to_vec()
            }
            PUBLIC_UNLOCK | DOUBLE_LOCK => {
                let keypair = match unlock {
                    Unlock::Keypair(k) => k,
                    Unlock::Both(k, _) => k,
                    Unlock::Password(_) => return Err(CryptoError::KeyMissing),
                };
                let mut encoded = read_block(&mut file, pk_words as usize * 4)?;
                let pk_hash = read_block(&mut file, hash_sz as usize)?;

                // Which of our keys sealed this? The header names it by hash.
                let digest = crate::suite::HashDigest::from_bytes(hash_algo, &pk_hash);
                let (hist, is_public) = keypair
                    .search_hash(&digest, &suite)
                    .ok_or(CryptoError::KeyMissing)?;
                if !is_public {
                    return Err(CryptoError::KeyMissing);
                }
                keypair.decode_bytes(&mut encoded, hist)?;

                let mut seed = encoded;
                if lock == DOUBLE_LOCK {
                    let password = match unlock {
                        Unlock::Both(_, p) => p,
                        _ => return Err(CryptoError::KeyMissing),
                    };
                    let stretched = stretch_password(password)?;
                    let check = read_block(&mut file, hash_sz as usize)?;
                    if suite.hash(&stretched).data() != check.as_slice() {
                        return Err(CryptoError::HashCompare);
                    }
                    seed.extend_from_slice(&stretched);
                }
                seed
            }
            _ => return Err(CryptoError::FileFormat),
        };

        Ok(Self {
            file,
            cipher: suite.build_stream(&seed),
            remaining: total.saturating_sub(consumed),
            suite,
            pk_algo,
            pk_words,
        })
    }

    /// Decrypt exactly `buf.len()` bytes.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), CryptoError> {
        if (buf.len() as u64) > self.remaining {
            return Err(CryptoError::FileFormat);
        }
        self.file.read_exact(buf).map_err(|_| CryptoError::FileFormat)?;
        self.cipher.xor_into(buf);
        self.remaining -= buf.len() as u64;
        Ok(())
    }

    /// Decrypt everything left in the file.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, CryptoError> {
        let mut buf = vec![0u8; self.remaining as usize];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Payload bytes not yet read.
    pub fn bytes_left(&self) -> u64 {
        self.remaining
    }

    /// Suite named in the header.
    pub fn suite(&self) -> &AlgorithmSuite {
        &self.suite
    }

    /// Public-key algorithm named in the header (zero for password locks).
    pub fn pk_algorithm(&self) -> u16 {
        self.pk_algo
    }

    /// Public-key word length named in the header.
    pub fn pk_words(&self) -> u16 {
        self.pk_words
    }
}

// ============================================================================
// Tests
// ============================================================================
