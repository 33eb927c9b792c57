//! Endpoint self-description exchanged in the first handshake packet
//!
//! A settings bundle names the endpoint (group id + node name), its
//! preferred public-key, hash, and stream algorithms, and carries the
//! current public key value. The PING wire form is fixed:
//!
//! ```text
//! [PING] [state hint]
//! [group id, GROUP_SIZE bytes, zero padded]
//! [node name, NAME_SIZE bytes, zero padded]
//! [pk_algo u16] [pk_size u16] [hash_algo u16] [hash_size u16] [stream_algo u16]
//! [public key N, pk_size * 4 bytes little-endian]
//! ```
//!
//! The message is marked depth 1 with zero payload so the stream layer
//! treats it as opaque.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bigint::BigInt;
use crate::error::CryptoError;
use crate::keypair::RsaKeypair;
use crate::message::{self, Message};
use crate::user::User;
use crate::{GROUP_SIZE, NAME_SIZE};

/// Byte length of a ping message for a given key word length.
pub fn ping_len(pk_words: u16) -> usize {
    2 + GROUP_SIZE + NAME_SIZE + 10 + pk_words as usize * 4
}

/// Self-description of one endpoint.
#[derive(Clone, Debug)]
pub struct GatewaySettings {
    group_id: String,
    node_name: String,
    file_path: Option<PathBuf>,
    keypair: Option<Arc<RsaKeypair>>,
    public_key: BigInt,
    pk_algo: u16,
    pk_size: u16,
    hash_algo: u16,
    hash_size: u16,
    stream_algo: u16,
}

impl GatewaySettings {
    /// Build the settings a user advertises for `group_id`.
    pub fn from_user(
        user: &User,
        group_id: &str,
        file_path: Option<PathBuf>,
    ) -> Result<Self, CryptoError> {
        if group_id.len() > GROUP_SIZE {
            return Err(CryptoError::StringTooLarge);
        }
        let keypair = user.default_keypair().ok_or(CryptoError::NullPublicKey)?;
        let suite = user.stream_suite();
        Ok(Self {
            group_id: group_id.to_string(),
            node_name: user.username().to_string(),
            file_path,
            public_key: keypair.n(),
            pk_algo: keypair.algorithm(),
            pk_size: keypair.size(),
            hash_algo: suite.hash_algorithm(),
            hash_size: suite.hash_size(),
            stream_algo: suite.stream_algorithm(),
            keypair: Some(keypair),
        })
    }

    /// Mirror-image settings parsed from a peer's ping message.
    pub fn from_ping(msg: &Message) -> Result<Self, CryptoError> {
        let data = msg.data();
        if data.is_empty() || data[0] != message::PING {
            return Err(CryptoError::custom(
                "Non-ping Initialization",
                "attempted to initialize gateway settings with a non-ping message",
            ));
        }
        let mut at = 2usize;
        let read_str = |data: &[u8], at: usize, len: usize| -> Result<String, CryptoError> {
            let raw = data.get(at..at + len).ok_or(CryptoError::BufferTooSmall)?;
            let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
            Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
        };
        let group_id = read_str(data, at, GROUP_SIZE)?;
        at += GROUP_SIZE;
        let node_name = read_str(data, at, NAME_SIZE)?;
        at += NAME_SIZE;

        let mut read_u16 = |data: &[u8]| -> Result<u16, CryptoError> {
            let raw = data.get(at..at + 2).ok_or(CryptoError::BufferTooSmall)?;
            at += 2;
            Ok(u16::from_le_bytes([raw[0], raw[1]]))
        };
        let pk_algo = read_u16(data)?;
        let pk_size = read_u16(data)?;
        let hash_algo = read_u16(data)?;
        let hash_size = read_u16(data)?;
        let stream_algo = read_u16(data)?;

        let key_bytes = pk_size as usize * 4;
        let raw_key = data.get(at..at + key_bytes).ok_or(CryptoError::BufferTooSmall)?;
        let mut public_key = BigInt::from_bytes_le(raw_key);
        public_key.expand(pk_size as usize * 2);

        Ok(Self {
            group_id,
            node_name,
            file_path: None,
            keypair: None,
            public_key,
            pk_algo,
            pk_size,
            hash_algo,
            hash_size,
            stream_algo,
        })
    }

    /// Construct this endpoint's ping message. The state hint byte is
    /// filled by the gateway before transmission.
    pub fn ping(&self) -> Result<Message, CryptoError> {
        if self.public_key.is_zero() {
            return Err(CryptoError::NullPublicKey);
        }
        let mut msg = Message::new(ping_len(self.pk_size))?;
        {
            let data = msg.data_mut();
            data[0] = message::PING;
            data[1] = crate::gateway::UNKNOWN_BROTHER;
            let mut at = 2;
            data[at..at + self.group_id.len()].copy_from_slice(self.group_id.as_bytes());
            at += GROUP_SIZE;
            data[at..at + self.node_name.len()].copy_from_slice(self.node_name.as_bytes());
            at += NAME_SIZE;
            for field in [self.pk_algo, self.pk_size, self.hash_algo, self.hash_size, self.stream_algo] {
                data[at..at + 2].copy_from_slice(&field.to_le_bytes());
                at += 2;
            }
            let key = self.public_key.to_bytes_le();
            let key_bytes = self.pk_size as usize * 4;
            let n = key.len().min(key_bytes);
            data[at..at + n].copy_from_slice(&key[..n]);
        }
        msg.mark_opaque();
        Ok(msg)
    }

    /// Pick up a rotated key from the backing keypair.
    pub fn refresh(&mut self) {
        if let Some(keypair) = &self.keypair {
            self.public_key = keypair.n();
            self.pk_algo = keypair.algorithm();
            self.pk_size = keypair.size();
        }
    }

    /// Group id of this endpoint.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Node name of this endpoint.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// The private keypair, when these settings describe the local user.
    pub fn keypair(&self) -> Option<Arc<RsaKeypair>> {
        self.keypair.clone()
    }

    /// Advertised public key value.
    pub fn public_key(&self) -> &BigInt {
        &self.public_key
    }

    /// Preferred public-key algorithm id.
    pub fn pk_algorithm(&self) -> u16 {
        self.pk_algo
    }

    /// Preferred public-key size in words.
    pub fn pk_size(&self) -> u16 {
        self.pk_size
    }

    /// Preferred hash algorithm id.
    pub fn hash_algorithm(&self) -> u16 {
        self.hash_algo
    }

    /// Preferred hash size in bytes.
    pub fn hash_size(&self) -> u16 {
        self.hash_size
    }

    /// Preferred stream algorithm id.
    pub fn stream_algorithm(&self) -> u16 {
        self.stream_algo
    }

    /// Configured snapshot path, if any.
    pub fn file_path(&self) -> Option<&PathBuf> {
        self.file_path.as_ref()
    }

    /// Write a JSON snapshot when a path is configured.
    pub fn save(&self) -> Result<(), CryptoError> {
        let path = match &self.file_path {
            Some(path) => path,
            None => return Ok(()),
        };
        let record = SettingsRecord {
            group: self.group_id.clone(),
            name: self.node_name.clone(),
            public_key: PreferenceRecord { algo: self.pk_algo, size: self.pk_size },
            hash: PreferenceRecord { algo: self.hash_algo, size: self.hash_size },
            stream: self.stream_algo,
        };
        let json = serde_json::to_vec_pretty(&record).map_err(|_| CryptoError::FileFormat)?;
        std::fs::write(path, json).map_err(|_| CryptoError::FileOpen)?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct PreferenceRecord {
    algo: u16,
    size: u16,
}

#[derive(Serialize, Deserialize)]
struct SettingsRecord {
    group: String,
    name: String,
    public_key: PreferenceRecord,
    hash: PreferenceRecord,
    stream: u16,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::SuiteRegistry;
    use crate::user::User;

    fn test_user(name: &str) -> Arc<User> {
        let user = User::new(name, None, None).unwrap();
        user.add_keypair(Arc::new(crate::keypair::tests::test_keypair_128()));
        user
    }

    #[test]
    fn ping_roundtrips_through_parse() {
        let user = test_user("alice");
        let settings = GatewaySettings::from_user(&user, "testgroup", None).unwrap();
        let ping = settings.ping().unwrap();

        assert_eq!(ping.message_type(), message::PING);
        assert_eq!(ping.encryption_depth(), 1);
        assert_eq!(ping.message_size(), 0);
        assert_eq!(ping.size(), ping_len(settings.pk_size()));

        let parsed = GatewaySettings::from_ping(&ping).unwrap();
        assert_eq!(parsed.group_id(), "testgroup");
        assert_eq!(parsed.node_name(), "alice");
        assert_eq!(parsed.pk_algorithm(), settings.pk_algorithm());
        assert_eq!(parsed.pk_size(), settings.pk_size());
        assert_eq!(parsed.hash_algorithm(), settings.hash_algorithm());
        assert_eq!(parsed.hash_size(), settings.hash_size());
        assert_eq!(parsed.stream_algorithm(), settings.stream_algorithm());
        assert_eq!(
            parsed.public_key().to_bytes_le_trimmed(),
            settings.public_key().to_bytes_le_trimmed()
        );
    }

    #[test]
    fn non_ping_message_is_rejected() {
        let mut msg = Message::new(8).unwrap();
        msg.data_mut()[0] = message::STREAM_KEY;
        assert!(GatewaySettings::from_ping(&msg).is_err());
    }

    #[test]
    fn truncated_ping_is_rejected() {
        let user = test_user("bob");
        let settings = GatewaySettings::from_user(&user, "g", None).unwrap();
        let ping = settings.ping().unwrap();
        let cut = Message::encrypted_message(&ping.data()[..20]).unwrap();
        assert!(GatewaySettings::from_ping(&cut).is_err());
    }

    #[test]
    fn oversized_group_fails_construction() {
        let user = test_user("carol");
        let long = "g".repeat(GROUP_SIZE + 1);
        assert_eq!(
            GatewaySettings::from_user(&user, &long, None).unwrap_err(),
            CryptoError::StringTooLarge
        );
    }

    #[test]
    fn refresh_tracks_key_rotation() {
        let user = test_user("dave");
        let mut settings = GatewaySettings::from_user(&user, "g", None).unwrap();
        let before = settings.public_key().clone();

        let keypair = settings.keypair().unwrap();
        let donor = crate::keypair::tests::test_keypair_128_alt();
        keypair.add_key_pair(&donor.n(), &donor.d(), 7);
        settings.refresh();
        assert_ne!(settings.public_key(), &before);
        assert_eq!(settings.public_key(), &donor.n());
    }

    #[test]
    fn preferences_follow_the_users_suite() {
        let user = User::new("erin", None, None).unwrap();
        user.add_keypair(Arc::new(crate::keypair::tests::test_keypair_128()));
        user.set_stream_suite(
            SuiteRegistry::global()
                .find(crate::suite::STREAM_HMAC_SHA256_CTR, crate::suite::HASH_SHA256)
                .unwrap(),
        );
        let settings = GatewaySettings::from_user(&user, "g", None).unwrap();
        assert_eq!(settings.stream_algorithm(), crate::suite::STREAM_HMAC_SHA256_CTR);
        assert_eq!(settings.hash_algorithm(), crate::suite::HASH_SHA256);
    }
}
