//! Crate root: public surface, library-wide constants, and invariants
//!
//! `peergate` is a peer-to-peer cryptographic session library. Two
//! endpoints, each identified by a long-lived RSA keypair, exchange
//! authenticated, confidential messages over an untrusted transport;
//! identity material (the user's own keypairs and a bank of peer keys)
//! persists to disk under a password or public-key lock.
//!
//! ## Invariants
//!
//! - **Fixed-width arithmetic.** Every big integer is a fixed array of
//!   32-bit little-endian words; an operation whose result would not fit
//!   fails rather than wrapping, and failures leave destinations in a
//!   documented state (never undefined).
//! - **Key continuity.** A keypair retains up to [`HISTORY_MAX`] retired
//!   pairs. Decoding and signing accept any key still in history, which
//!   is what lets a peer prove it is the same principal across a key
//!   rotation.
//! - **Identity clustering.** The key bank partitions every observed
//!   `(name, key)` pair by the transitive closure of "shares a name or
//!   shares a key"; merges preserve both lookup indexes.
//! - **Handshake discipline.** A gateway only reaches `ESTABLISHED`
//!   after the peer's signatures over the stream transcript verify under
//!   the authentication rules in [`gateway`].
//!
//! Failure is always a precise error value or a logged error-ring entry;
//! no protocol condition aborts the process.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Fixed-width unsigned multi-precision integers and their operations.
pub mod bigint;
/// Encrypted file containers for persisted key material.
pub mod envelope;
/// Shared error kinds, severity levels, and bounded error logs.
pub mod error;
/// The handshake state machine and secured channel.
pub mod gateway;
/// Persistent directory of peer identities.
pub mod keybank;
/// RSA keypairs with bounded rotation history.
pub mod keypair;
/// Typed byte-buffer packets with nested encryption.
pub mod message;
/// Miller–Rabin primality testing and prime generation.
pub mod prime;
/// Endpoint self-description exchanged in the first handshake packet.
pub mod settings;
/// Stream cipher + keyed hash suites and their registries.
pub mod suite;
/// A local identity: keys, bank, suite, per-group settings.
pub mod user;

// ============================================================================
// Library-wide size bounds
// ============================================================================

/// Maximum byte length of a group id.
pub const GROUP_SIZE: usize = 20;

/// Maximum byte length of a node name.
pub const NAME_SIZE: usize = 20;

/// Maximum byte length of a stream seed.
pub const STREAM_SEED_MAX: usize = 128;

// ============================================================================
// Canonical re-exports
// ============================================================================

pub use crate::bigint::BigInt;
pub use crate::error::{CryptoError, ErrorListener, ErrorLog, Severity};
pub use crate::gateway::Gateway;
pub use crate::keybank::{KeyBank, NodeId, PeerKey, PeerName, PeerNode};
pub use crate::keypair::{RsaKeypair, CURRENT_INDEX, HISTORY_MAX};
pub use crate::message::Message;
pub use crate::settings::GatewaySettings;
pub use crate::suite::{AlgorithmSuite, HashDigest, SuiteRegistry};
pub use crate::user::User;
