//! The security gateway: handshake state machine and secured channel
//!
//! Two gateways, one per endpoint, drive each other through settings
//! exchange (PING), symmetric key transport (STREAM_KEY), mutual
//! signature (SIGNING_MESSAGE, including proof of continuity through
//! retired keys), and finally a stream-encrypted channel
//! (SECURE_DATA_EXCHANGE).
//!
//! ## Transcript
//!
//! Each direction's transcript is `timestamp(8) ‖ stream seed ‖ sender
//! group+name ‖ receiver group+name`, with the timestamp overlaid into
//! the first eight bytes immediately before hashing. A signature is the
//! transcript hash (reduced to the signing key's width, top two bits
//! cleared) raised to `D mod N`; verification re-raises to `e` and
//! compares.
//!
//! ## Authentication
//!
//! A peer whose declared `(group, name)` is already bound to its declared
//! key in the bank authenticates on the primary signature alone, as does
//! a peer the bank has never seen. A known name arriving under an
//! unknown key must additionally sign with one of the retired keys the
//! bank still trusts for it (the secondary signature), chosen from the
//! hash list this side advertised.
//!
//! ## Locking
//!
//! One mutex guards the state tuple and transcript buffers, a second the
//! timestamps. Neither is ever held across a call into the peer.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, RwLock};

use rand::Rng;

use crate::bigint::BigInt;
use crate::error::{CryptoError, ErrorLog, Severity};
use crate::keybank::NodeId;
use crate::keypair::{PublicKeyRegistry, PublicKeyScheme, RsaKeypair};
use crate::message::{self, Message};
use crate::settings::GatewaySettings;
use crate::suite::{AlgorithmSuite, HashDigest, StreamDecrypter, StreamEncrypter, SuiteRegistry};
use crate::user::User;
use crate::{GROUP_SIZE, NAME_SIZE};

/// Default peer-inactivity timeout, seconds.
pub const DEFAULT_TIMEOUT: i64 = 60;
/// Default minimum dwell in the timeout error state, seconds.
pub const DEFAULT_ERROR_TIMEOUT: i64 = 10;

/// Gateway states.
pub const UNKNOWN_STATE: u8 = 0;
/// No ping received from the peer yet.
pub const UNKNOWN_BROTHER: u8 = 1;
/// Peer's ping received; ours not yet acknowledged.
pub const SETTINGS_EXCHANGED: u8 = 2;
/// Sending our stream key.
pub const ESTABLISHING_STREAM: u8 = 3;
/// Peer's stream key received; still announcing ours.
pub const STREAM_ESTABLISHED: u8 = 4;
/// Streams up; proving key ownership.
pub const SIGNING_STATE: u8 = 5;
/// Peer authenticated; waiting for it to authenticate us.
pub const CONFIRM_OLD: u8 = 6;
/// Secure, authenticated channel.
pub const ESTABLISHED: u8 = 7;
/// Acknowledging a peer's error.
pub const CONFIRM_ERROR_STATE: u8 = 252;
/// Connection reset required.
pub const BASIC_ERROR_STATE: u8 = 253;
/// Error during authentication; reconnection is delayed.
pub const TIMEOUT_ERROR_STATE: u8 = 254;
/// Terminal; the gateway refuses to reconnect.
pub const PERMANENT_ERROR_STATE: u8 = 255;

/// Most key hashes a signing message may carry.
pub const MAX_ELIGIBLE_KEYS: usize = 5;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn severity_state(severity: Severity) -> u8 {
    match severity {
        Severity::Basic => BASIC_ERROR_STATE,
        Severity::Timeout => TIMEOUT_ERROR_STATE,
        Severity::Permanent => PERMANENT_ERROR_STATE,
    }
}

/// Reduce a transcript hash to a signable value of the key's width,
/// clearing the top two bits so the value stays below any N with its
/// top bit set.
fn hash_to_value(digest: &HashDigest, words: u16) -> BigInt {
    let key_bytes = words as usize * 4;
    let take = digest.size().min(key_bytes);
    let mut value = BigInt::from_bytes_le(&digest.data()[..take]);
    value.expand(words as usize * 2);
    value.words_mut()[words as usize - 1] &= 0x3FFF_FFFF;
    value
}

struct LinkState {
    current: u8,
    brother: u8,
    brother_settings: Option<GatewaySettings>,

    last_error: Option<CryptoError>,
    last_error_level: u8,

    self_suite: Option<AlgorithmSuite>,
    self_scheme: Option<PublicKeyScheme>,
    self_keypair: Option<Arc<RsaKeypair>>,
    self_precise_key: Option<BigInt>,

    brother_suite: Option<AlgorithmSuite>,
    brother_scheme: Option<PublicKeyScheme>,
    brother_key: Option<BigInt>,

    stream_msg_in: Option<Message>,
    input_stream: Option<StreamDecrypter>,
    stream_est: i64,
    stream_msg_out: Option<Message>,
    output_stream: Option<StreamEncrypter>,

    out_transcript: Vec<u8>,
    self_primary_hash: Option<HashDigest>,
    self_secondary_hash: Option<HashDigest>,
    self_signing_msg: Option<Message>,
    eligible_keys: Vec<HashDigest>,

    in_transcript: Vec<u8>,
    brother_primary_hash: Option<HashDigest>,
    brother_secondary_hash: Option<HashDigest>,
    brother_authenticated: bool,
}

impl LinkState {
    fn clear_stream(&mut self) {
        self.stream_est = 0;
        self.stream_msg_in = None;
        self.input_stream = None;
        self.stream_msg_out = None;
        self.output_stream = None;
        self.out_transcript.clear();
        self.self_primary_hash = None;
        self.self_secondary_hash = None;
        self.self_signing_msg = None;
        self.in_transcript.clear();
        self.brother_primary_hash = None;
        self.brother_secondary_hash = None;
        self.brother_authenticated = false;
    }
}

struct Stamps {
    received: i64,
    sent: i64,
    error: i64,
}

/// A secured connection to one peer.
pub struct Gateway {
    user: Arc<User>,
    self_settings: Arc<RwLock<GatewaySettings>>,
    state: Mutex<LinkState>,
    stamps: Mutex<Stamps>,
    timeout: Mutex<(i64, i64, i64)>,
    errors: ErrorLog,
}

impl Gateway {
    /// Open a gateway for `user` on `group`.
    pub fn new(user: Arc<User>, group: &str) -> Result<Self, CryptoError> {
        let self_settings = user.insert_settings(group).map_err(|_| CryptoError::KeyMissing)?;
        Ok(Self {
            user,
            self_settings,
            state: Mutex::new(LinkState {
                current: UNKNOWN_BROTHER,
                brother: UNKNOWN_STATE,
                brother_settings: None,
                last_error: None,
                last_error_level: BASIC_ERROR_STATE,
                self_suite: None,
                self_scheme: None,
                self_keypair: None,
                self_precise_key: None,
                brother_suite: None,
                brother_scheme: None,
                brother_key: None,
                stream_msg_in: None,
                input_stream: None,
                stream_est: 0,
                stream_msg_out: None,
                output_stream: None,
                out_transcript: Vec::new(),
                self_primary_hash: None,
                self_secondary_hash: None,
                self_signing_msg: None,
                eligible_keys: Vec::new(),
                in_transcript: Vec::new(),
                brother_primary_hash: None,
                brother_secondary_hash: None,
                brother_authenticated: false,
            }),
            stamps: Mutex::new(Stamps { received: now(), sent: 0, error: 0 }),
            timeout: Mutex::new((DEFAULT_TIMEOUT, 3 * DEFAULT_TIMEOUT / 4, DEFAULT_ERROR_TIMEOUT)),
            errors: ErrorLog::default(),
        })
    }

    /// This gateway's state.
    pub fn current_state(&self) -> u8 {
        self.state.lock().expect("gateway state poisoned").current
    }

    /// Last known peer state.
    pub fn brother_state(&self) -> u8 {
        self.state.lock().expect("gateway state poisoned").brother
    }

    /// True once the channel is authenticated and encrypted.
    pub fn secure(&self) -> bool {
        self.current_state() == ESTABLISHED
    }

    /// Recent errors this gateway has logged.
    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    /// Peer settings learned from its ping, if any.
    pub fn brother_settings(&self) -> Option<GatewaySettings> {
        self.state.lock().expect("gateway state poisoned").brother_settings.clone()
    }

    /// Our own settings.
    pub fn self_settings(&self) -> Arc<RwLock<GatewaySettings>> {
        self.self_settings.clone()
    }

    /// The bank node for the connected peer, once secure.
    pub fn brother_node(&self) -> Option<NodeId> {
        if !self.secure() {
            return None;
        }
        let settings = self.brother_settings()?;
        self.user.key_bank().find_name(settings.group_id(), settings.node_name())
    }

    /// (timeout, safe_timeout, error_timeout) in seconds.
    pub fn timeouts(&self) -> (i64, i64, i64) {
        *self.timeout.lock().expect("timeout lock poisoned")
    }

    /// Reconfigure the inactivity timeout; the safe timeout follows at
    /// three quarters of it.
    pub fn set_timeout(&self, timeout: i64, error_timeout: i64) {
        *self.timeout.lock().expect("timeout lock poisoned") =
            (timeout, 3 * timeout / 4, error_timeout);
    }

    /// Timestamp of the last inbound message.
    pub fn time_message_received(&self) -> i64 {
        self.stamps.lock().expect("stamp lock poisoned").received
    }

    /// Timestamp of the last outbound message.
    pub fn time_message_sent(&self) -> i64 {
        self.stamps.lock().expect("stamp lock poisoned").sent
    }

    /// Timestamp of the last logged error.
    pub fn time_last_error(&self) -> i64 {
        self.stamps.lock().expect("stamp lock poisoned").error
    }

    // ------------------------------ Error plumbing ------------------------------

    fn log_error_locked(&self, st: &mut LinkState, error: CryptoError, severity: Severity) {
        let level = severity_state(severity);
        match severity {
            Severity::Permanent => {
                st.current = PERMANENT_ERROR_STATE;
                st.last_error = Some(error.clone());
                st.last_error_level = level;
            }
            Severity::Timeout => {
                if st.current != PERMANENT_ERROR_STATE {
                    st.current = TIMEOUT_ERROR_STATE;
                    st.last_error = Some(error.clone());
                    st.last_error_level = level;
                }
            }
            Severity::Basic => {
                if st.current != PERMANENT_ERROR_STATE && st.current != TIMEOUT_ERROR_STATE {
                    st.current = BASIC_ERROR_STATE;
                    st.last_error = Some(error.clone());
                    st.last_error_level = level;
                }
            }
        }
        st.clear_stream();
        self.stamps.lock().expect("stamp lock poisoned").error = now();
        tracing::debug!(state = st.current, error = %error, "gateway error");
        self.errors.log(error);
    }

    fn current_error_locked(&self, st: &LinkState) -> Option<Message> {
        if st.current != BASIC_ERROR_STATE
            && st.current != TIMEOUT_ERROR_STATE
            && st.current != PERMANENT_ERROR_STATE
        {
            return None;
        }
        let error = match &st.last_error {
            None => {
                let mut msg = Message::new(2).ok()?;
                msg.data_mut()[0] = st.last_error_level;
                msg.data_mut()[1] = st.current;
                return Some(msg);
            }
            Some(error) => error,
        };
        let title = error.title();
        let description = error.description();
        let mut msg = Message::new(6 + title.len() + description.len()).ok()?;
        {
            let data = msg.data_mut();
            data[0] = st.last_error_level;
            data[1] = st.current;
            let mut at = 2;
            data[at..at + 2].copy_from_slice(&(title.len() as u16).to_le_bytes());
            at += 2;
            data[at..at + title.len()].copy_from_slice(title.as_bytes());
            at += title.len();
            data[at..at + 2].copy_from_slice(&(description.len() as u16).to_le_bytes());
            at += 2;
            data[at..at + description.len()].copy_from_slice(description.as_bytes());
        }
        Some(msg)
    }

    /// Reset error bookkeeping, returning to the unconnected state.
    pub fn purge_last_error(&self) {
        let mut st = self.state.lock().expect("gateway state poisoned");
        st.current = if st.brother_settings.is_some() { SETTINGS_EXCHANGED } else { UNKNOWN_BROTHER };
        st.last_error = None;
        st.last_error_level = UNKNOWN_STATE;
    }

    // ------------------------------ Stream layer ------------------------------

    fn encrypt_locked(&self, st: &mut LinkState, mut msg: Message) -> Option<Message> {
        if st.output_stream.is_none() {
            self.log_error_locked(
                st,
                CryptoError::custom(
                    "Undefined Output Stream",
                    "cannot encrypt a message without an output stream",
                ),
                Severity::Basic,
            );
            return None;
        }
        match msg.message_type() {
            message::BLOCKED
            | message::PING
            | message::STREAM_KEY
            | message::BASIC_ERROR
            | message::TIMEOUT_ERROR
            | message::PERMANENT_ERROR => {
                self.log_error_locked(
                    st,
                    CryptoError::custom("Encryption Error", "message type cannot be encrypted"),
                    Severity::Basic,
                );
                return None;
            }
            _ => {}
        }
        let stream = st.output_stream.as_mut().expect("checked above");
        match msg.encrypt_layer(stream) {
            Ok(()) => Some(msg),
            Err(err) => {
                self.log_error_locked(st, err, Severity::Basic);
                None
            }
        }
    }

    fn decrypt_locked(&self, st: &mut LinkState, mut msg: Message) -> Option<Message> {
        if st.input_stream.is_none() {
            self.log_error_locked(
                st,
                CryptoError::custom(
                    "Undefined Input Stream",
                    "cannot decrypt a message without an input stream",
                ),
                Severity::Basic,
            );
            return None;
        }
        match msg.message_type() {
            message::BLOCKED
            | message::PING
            | message::STREAM_KEY
            | message::BASIC_ERROR
            | message::TIMEOUT_ERROR
            | message::PERMANENT_ERROR => {
                self.log_error_locked(
                    st,
                    CryptoError::custom("Decryption Error", "message type cannot be decrypted"),
                    Severity::Basic,
                );
                return None;
            }
            _ => {}
        }
        let stream = st.input_stream.as_mut().expect("checked above");
        match msg.decrypt_layer(stream) {
            Ok(()) => Some(msg),
            Err(err) => {
                self.log_error_locked(st, err, Severity::Basic);
                None
            }
        }
    }

    /// Generate (or keep) the outbound stream key and its transcript.
    fn build_stream_locked(&self, st: &mut LinkState) {
        let timeout = self.timeouts().0;
        if st.stream_msg_out.is_some() && st.stream_est + timeout > now() {
            return;
        }
        let (brother_key, brother_scheme, brother_suite) =
            match (&st.brother_key, &st.brother_scheme, &st.brother_suite) {
                (Some(k), Some(p), Some(s)) => (k.clone(), p.clone(), s.clone()),
                _ => {
                    self.log_error_locked(
                        st,
                        CryptoError::custom(
                            "Brother Undefined",
                            "cannot build a stream when the brother is undefined",
                        ),
                        Severity::Basic,
                    );
                    return;
                }
            };
        let (self_group, self_name, brother_group, brother_name) = {
            let settings = self.self_settings.read().expect("settings poisoned");
            let brother = match &st.brother_settings {
                Some(b) => b,
                None => {
                    self.log_error_locked(
                        st,
                        CryptoError::custom(
                            "Brother Undefined",
                            "cannot build a stream when the brother is undefined",
                        ),
                        Severity::Basic,
                    );
                    return;
                }
            };
            (
                settings.group_id().to_string(),
                settings.node_name().to_string(),
                brother.group_id().to_string(),
                brother.node_name().to_string(),
            )
        };

        st.stream_est = now();
        let key_bytes = brother_scheme.key_bytes();
        let mut seed = vec![0u8; key_bytes];
        rand::thread_rng().fill(&mut seed[..key_bytes - 1]);

        let mut msg = match Message::new(2 + key_bytes) {
            Ok(msg) => msg,
            Err(err) => {
                self.log_error_locked(st, err, Severity::Basic);
                return;
            }
        };
        msg.data_mut()[0] = message::STREAM_KEY;

        // Transcript skeleton: timestamp slot, seed, sender names, receiver names.
        let mut transcript = vec![0u8; 8 + key_bytes + 2 * GROUP_SIZE + 2 * NAME_SIZE];
        transcript[8..8 + key_bytes].copy_from_slice(&seed);
        let mut at = 8 + key_bytes;
        transcript[at..at + self_group.len()].copy_from_slice(self_group.as_bytes());
        at += GROUP_SIZE;
        transcript[at..at + self_name.len()].copy_from_slice(self_name.as_bytes());
        at += NAME_SIZE;
        transcript[at..at + brother_group.len()].copy_from_slice(brother_group.as_bytes());
        at += GROUP_SIZE;
        transcript[at..at + brother_name.len()].copy_from_slice(brother_name.as_bytes());

        st.output_stream = Some(StreamEncrypter::new(brother_suite.build_stream(&seed)));
        st.out_transcript = transcript;
        st.self_primary_hash = None;
        st.self_secondary_hash = None;
        st.self_signing_msg = None;

        msg.data_mut()[2..].copy_from_slice(&seed);
        if let Err(err) = brother_scheme.encode_bytes(&mut msg.data_mut()[2..], &brother_key) {
            self.log_error_locked(st, err, Severity::Basic);
            return;
        }
        st.stream_msg_out = Some(msg);
    }

    // ------------------------------ Outbound ------------------------------

    /// Next management message for the peer, chosen by state.
    pub fn get_message(&self) -> Option<Message> {
        self.process_timestamps();
        let mut st = self.state.lock().expect("gateway state poisoned");
        if st.current == UNKNOWN_STATE {
            st.current = UNKNOWN_BROTHER;
        }

        let ret: Option<Message> = match st.current {
            UNKNOWN_BROTHER | SETTINGS_EXCHANGED => self.ping_locked(&mut st),
            ESTABLISHING_STREAM | STREAM_ESTABLISHED => {
                self.build_stream_locked(&mut st);
                match &st.stream_msg_out {
                    Some(msg) => {
                        let mut msg = msg.clone();
                        msg.data_mut()[1] = st.current;
                        Some(msg)
                    }
                    None => self.current_error_locked(&st),
                }
            }
            SIGNING_STATE | CONFIRM_OLD => self.signing_message_locked(&mut st),
            ESTABLISHED => {
                let mut msg = Message::new(3).ok()?;
                msg.data_mut()[0] = message::SECURE_DATA_EXCHANGE;
                msg.data_mut()[1] = st.current;
                self.encrypt_locked(&mut st, msg).or_else(|| self.current_error_locked(&st))
            }
            BASIC_ERROR_STATE | TIMEOUT_ERROR_STATE | PERMANENT_ERROR_STATE => {
                self.current_error_locked(&st)
            }
            CONFIRM_ERROR_STATE => {
                st.clear_stream();
                let mut msg = Message::new(2).ok()?;
                msg.data_mut()[0] = message::CONFIRM_ERROR;
                msg.data_mut()[1] = st.current;
                Some(msg)
            }
            _ => None,
        };

        let ret = match ret {
            Some(msg) => Some(msg),
            None => {
                self.log_error_locked(
                    &mut st,
                    CryptoError::custom(
                        "Message Undefined",
                        "current system state does not define a message to be returned",
                    ),
                    Severity::Basic,
                );
                self.current_error_locked(&st)
            }
        };
        drop(st);

        if ret.is_some() {
            self.stamps.lock().expect("stamp lock poisoned").sent = now();
        }
        ret
    }

    /// Build the ping and bind our own algorithm frames.
    fn ping_locked(&self, st: &mut LinkState) -> Option<Message> {
        {
            let mut settings = self.self_settings.write().expect("settings poisoned");
            settings.refresh();
        }
        let settings = self.self_settings.read().expect("settings poisoned");
        let mut ping = match settings.ping() {
            Ok(ping) => ping,
            Err(err) => {
                self.log_error_locked(st, err, Severity::Basic);
                return self.current_error_locked(st);
            }
        };
        ping.data_mut()[1] = st.current;

        let suite = SuiteRegistry::global()
            .find(settings.stream_algorithm(), settings.hash_algorithm())
            .map(|s| s.with_hash_size(settings.hash_size()));
        let scheme = PublicKeyRegistry::global()
            .find(settings.pk_algorithm())
            .map(|p| p.with_key_words(settings.pk_size()));
        let (suite, scheme) = match (suite, scheme) {
            (Some(suite), Some(scheme)) => (suite, scheme),
            _ => {
                drop(settings);
                self.log_error_locked(
                    st,
                    CryptoError::IllegalAlgorithmBind("own preferences unregistered".into()),
                    Severity::Basic,
                );
                return self.current_error_locked(st);
            }
        };
        st.self_suite = Some(suite);
        st.self_scheme = Some(scheme);
        st.self_keypair = settings.keypair();
        st.self_precise_key = Some(settings.public_key().clone());
        Some(ping)
    }

    /// Build (or refresh) the signing message for SIGNING_STATE and
    /// CONFIRM_OLD.
    fn signing_message_locked(&self, st: &mut LinkState) -> Option<Message> {
        let (_, safe_timeout, _) = self.timeouts();
        let cur_stamp = now();

        let (brother_key, brother_suite) = match (&st.brother_key, &st.brother_suite) {
            (Some(k), Some(s)) => (k.clone(), s.clone()),
            _ => {
                self.log_error_locked(
                    st,
                    CryptoError::custom(
                        "Brother Undefined",
                        "cannot sign when the brother is undefined",
                    ),
                    Severity::Basic,
                );
                return self.current_error_locked(st);
            }
        };
        let (self_suite, self_scheme, self_keypair, self_precise) = match (
            &st.self_suite,
            &st.self_scheme,
            &st.self_keypair,
            &st.self_precise_key,
        ) {
            (Some(a), Some(b), Some(c), Some(d)) => (a.clone(), b.clone(), c.clone(), d.clone()),
            _ => {
                self.log_error_locked(
                    st,
                    CryptoError::custom("Self Not Found", "the gateway could not find itself"),
                    Severity::Basic,
                );
                return self.current_error_locked(st);
            }
        };
        if st.out_transcript.is_empty() {
            self.log_error_locked(
                st,
                CryptoError::custom("Init Error", "stream failed to build before hashing data"),
                Severity::Basic,
            );
            return self.current_error_locked(st);
        }
        let (brother_group, brother_name) = match &st.brother_settings {
            Some(b) => (b.group_id().to_string(), b.node_name().to_string()),
            None => {
                self.log_error_locked(
                    st,
                    CryptoError::custom(
                        "Brother Undefined",
                        "cannot sign when the brother is undefined",
                    ),
                    Severity::Basic,
                );
                return self.current_error_locked(st);
            }
        };

        // Hashes of the brother's keys we still trust, for its secondary
        // signature. Dropped entirely when its current key is already on
        // record.
        let bank = self.user.key_bank();
        let node = bank.find_name(&brother_group, &brother_name);
        let mut key_list: Vec<HashDigest> = Vec::new();
        if let Some(node) = node {
            let mut known_current = false;
            for peer_key in bank.keys_by_timestamp(node).iter().take(MAX_ELIGIBLE_KEYS) {
                if peer_key.key.cmp_value(&brother_key) == std::cmp::Ordering::Equal {
                    known_current = true;
                } else {
                    key_list.push(brother_suite.hash(&peer_key.key.to_bytes_le_trimmed()));
                }
            }
            if known_current {
                key_list.clear();
            }
        }

        // Secondary key selection: the brother told us which of our keys
        // it still accepts. If our current key is not among them, sign
        // with a retired key it named.
        let self_cur_hash = self_suite.hash(&self_precise.to_bytes_le_trimmed());
        let mut secondary: Option<(Arc<RsaKeypair>, usize, BigInt, u16)> = None;
        if !st.eligible_keys.is_empty() && !st.eligible_keys.contains(&self_cur_hash) {
            for candidate in &st.eligible_keys {
                if let Some((keypair, hist, _)) = self.user.search_key_hash(candidate, &self_suite)
                {
                    if let Some(old_n) = keypair.old_n(hist) {
                        let size = keypair.size();
                        secondary = Some((keypair, hist, old_n, size));
                        break;
                    }
                }
            }
            if secondary.is_none() {
                self.log_error_locked(
                    st,
                    CryptoError::custom(
                        "Old Key Not Found",
                        "old keys, as listed by the node's brother, could not be found",
                    ),
                    Severity::Timeout,
                );
                return self.current_error_locked(st);
            }
        }
        let sec_words = secondary.as_ref().map(|s| s.3).unwrap_or(0);
        let key_bytes = self_scheme.key_bytes();
        let hash_size = brother_suite.hash_size() as usize;

        let total = 2 + 16 + key_bytes + 2 + sec_words as usize * 4 + 1 + (1 + key_list.len()) * hash_size;
        let mut msg = Message::new(total).ok()?;
        msg.data_mut()[0] = message::SIGNING_MESSAGE;
        msg.data_mut()[1] = st.current;

        // Timestamps: reuse the cached ones while they are fresh so the
        // peer can recognize retransmissions.
        let (mut primary_stamp, mut secondary_stamp, mut prim, mut sec) = match &st.self_signing_msg
        {
            Some(cached) => {
                let data = cached.data();
                (
                    i64::from_le_bytes(data[2..10].try_into().expect("8 bytes")),
                    i64::from_le_bytes(data[10..18].try_into().expect("8 bytes")),
                    false,
                    false,
                )
            }
            None => (cur_stamp, cur_stamp, true, true),
        };
        if cur_stamp > primary_stamp + safe_timeout {
            primary_stamp = cur_stamp;
            prim = true;
        }
        if cur_stamp > secondary_stamp + safe_timeout {
            secondary_stamp = cur_stamp;
            sec = true;
        }

        // Primary signature over the transcript.
        msg.data_mut()[2..10].copy_from_slice(&primary_stamp.to_le_bytes());
        st.out_transcript[..8].copy_from_slice(&primary_stamp.to_le_bytes());
        let primary_hash = self_suite.hash(&st.out_transcript);
        if st.self_primary_hash.as_ref() != Some(&primary_hash) {
            prim = true;
        }
        if prim {
            st.self_primary_hash = Some(primary_hash);
            let value = hash_to_value(st.self_primary_hash.as_ref().expect("just set"), self_scheme.key_words());
            let hist = self_keypair
                .search_key(&self_precise)
                .map(|(h, _)| h)
                .unwrap_or(crate::keypair::CURRENT_INDEX);
            let signature = match self_keypair.decode_at(&value, hist) {
                Ok(sig) => sig,
                Err(_) => {
                    self.log_error_locked(
                        st,
                        CryptoError::custom(
                            "Could Not Sign, Primary",
                            "unexpected error occurred while attempting to sign a hash",
                        ),
                        Severity::Timeout,
                    );
                    return self.current_error_locked(st);
                }
            };
            let bytes = signature.to_bytes_le_trimmed();
            let n = bytes.len().min(key_bytes);
            msg.data_mut()[18..18 + n].copy_from_slice(&bytes[..n]);
        } else if let Some(cached) = &st.self_signing_msg {
            msg.data_mut()[18..18 + key_bytes]
                .copy_from_slice(&cached.data()[18..18 + key_bytes]);
        }

        // Secondary signature with a retired key, when one is required.
        msg.data_mut()[10..18].copy_from_slice(&secondary_stamp.to_le_bytes());
        st.out_transcript[..8].copy_from_slice(&secondary_stamp.to_le_bytes());
        let secondary_hash = self_suite.hash(&st.out_transcript);
        if st.self_secondary_hash.as_ref() != Some(&secondary_hash) {
            sec = true;
        }
        if st.eligible_keys.is_empty() {
            sec = false;
        }
        let sec_at = 2 + 16 + key_bytes + 2;
        if let Some((keypair, hist, old_n, words)) = &secondary {
            let cache_ok = st
                .self_signing_msg
                .as_ref()
                .map(|m| m.size() == total)
                .unwrap_or(false);
            if sec || !cache_ok {
                let key_id = brother_suite.hash(&old_n.to_bytes_le_trimmed());
                st.self_secondary_hash = Some(secondary_hash);
                let value = hash_to_value(
                    st.self_secondary_hash.as_ref().expect("just set"),
                    *words,
                );
                let signature = match keypair.decode_at(&value, *hist) {
                    Ok(sig) => sig,
                    Err(_) => {
                        self.log_error_locked(
                            st,
                            CryptoError::custom(
                                "Could Not Sign, Secondary",
                                "unexpected error occurred while attempting to sign a hash",
                            ),
                            Severity::Timeout,
                        );
                        return self.current_error_locked(st);
                    }
                };
                msg.data_mut()[sec_at..sec_at + hash_size].copy_from_slice(key_id.data());
                let bytes = signature.to_bytes_le_trimmed();
                let sig_bytes = *words as usize * 4;
                let n = bytes.len().min(sig_bytes);
                msg.data_mut()[sec_at + hash_size..sec_at + hash_size + n]
                    .copy_from_slice(&bytes[..n]);
            } else if let Some(cached) = &st.self_signing_msg {
                let span = hash_size + *words as usize * 4;
                msg.data_mut()[sec_at..sec_at + span]
                    .copy_from_slice(&cached.data()[sec_at..sec_at + span]);
            }
        }

        // Secondary key size, the eligible-list count, and the list.
        msg.data_mut()[2 + 16 + key_bytes..2 + 16 + key_bytes + 2]
            .copy_from_slice(&sec_words.to_le_bytes());
        let list_at = sec_at + sec_words as usize * 4 + hash_size;
        msg.data_mut()[list_at] = key_list.len() as u8;
        for (i, digest) in key_list.iter().enumerate() {
            let off = list_at + 1 + i * hash_size;
            msg.data_mut()[off..off + hash_size].copy_from_slice(digest.data());
        }

        st.self_signing_msg = Some(msg.clone());
        self.encrypt_locked(st, msg).or_else(|| self.current_error_locked(st))
    }

    /// Send an application message through the secured channel.
    pub fn send(&self, msg: Message) -> Option<Message> {
        let mut st = self.state.lock().expect("gateway state poisoned");
        let mut msg = msg;
        if msg.message_type() == message::SECURE_DATA_EXCHANGE
            && !msg.encrypted()
            && msg.size() >= 2
        {
            msg.data_mut()[1] = st.current;
        }
        let ret = self
            .encrypt_locked(&mut st, msg)
            .or_else(|| self.current_error_locked(&st));
        drop(st);
        if ret.is_some() {
            self.stamps.lock().expect("stamp lock poisoned").sent = now();
        }
        ret
    }

    // ------------------------------ Inbound ------------------------------

    /// Decrypt and process an inbound message, advancing the state
    /// machine. Returns the decrypted message where one survives.
    pub fn process_message(&self, msg: &Message) -> Option<Message> {
        self.process_timestamps();
        self.stamps.lock().expect("stamp lock poisoned").received = now();

        match msg.message_type() {
            message::PING => self.process_ping(msg),
            message::STREAM_KEY => self.process_stream_key(msg),
            message::SIGNING_MESSAGE => self.process_signing(msg),
            message::SECURE_DATA_EXCHANGE => self.process_secure_exchange(msg),
            message::BASIC_ERROR | message::TIMEOUT_ERROR | message::PERMANENT_ERROR => {
                self.process_error(msg)
            }
            message::CONFIRM_ERROR => {
                let mut st = self.state.lock().expect("gateway state poisoned");
                st.brother = msg.data().get(1).copied().unwrap_or(UNKNOWN_STATE);
                if st.current != TIMEOUT_ERROR_STATE && st.current != PERMANENT_ERROR_STATE {
                    st.current = UNKNOWN_BROTHER;
                }
                Some(msg.clone())
            }
            _ => {
                let mut st = self.state.lock().expect("gateway state poisoned");
                if st.current != ESTABLISHED {
                    self.log_error_locked(
                        &mut st,
                        CryptoError::custom(
                            "Invalid State",
                            "cannot receive a data-exchange message when not secured",
                        ),
                        Severity::Basic,
                    );
                    return None;
                }
                self.decrypt_locked(&mut st, msg.clone())
            }
        }
    }

    fn process_ping(&self, msg: &Message) -> Option<Message> {
        let mut st = self.state.lock().expect("gateway state poisoned");
        if st.current != UNKNOWN_STATE
            && st.current != UNKNOWN_BROTHER
            && st.current != SETTINGS_EXCHANGED
            && st.current != CONFIRM_ERROR_STATE
        {
            self.log_error_locked(
                &mut st,
                CryptoError::custom("Ping Received Error", "current state cannot receive a ping"),
                Severity::Basic,
            );
            return None;
        }
        let settings = match GatewaySettings::from_ping(msg) {
            Ok(settings) => settings,
            Err(err) => {
                self.log_error_locked(&mut st, err, Severity::Basic);
                return None;
            }
        };
        if settings.pk_size() == 0 || settings.pk_size() > 512 {
            self.log_error_locked(&mut st, CryptoError::PublicKeySizeWrong, Severity::Basic);
            return None;
        }

        st.brother = msg.data()[1];
        if st.current == UNKNOWN_BROTHER
            || st.current == SETTINGS_EXCHANGED
            || st.current == CONFIRM_ERROR_STATE
        {
            st.current = if st.brother == SETTINGS_EXCHANGED {
                ESTABLISHING_STREAM
            } else {
                SETTINGS_EXCHANGED
            };
        }

        let suite = SuiteRegistry::global()
            .find(settings.stream_algorithm(), settings.hash_algorithm())
            .map(|s| s.with_hash_size(settings.hash_size()));
        let scheme = PublicKeyRegistry::global()
            .find(settings.pk_algorithm())
            .map(|p| p.with_key_words(settings.pk_size()));
        let (suite, scheme) = match (suite, scheme) {
            (Some(suite), Some(scheme)) => (suite, scheme),
            _ => {
                self.log_error_locked(
                    &mut st,
                    CryptoError::IllegalAlgorithmBind("peer preferences unregistered".into()),
                    Severity::Basic,
                );
                return None;
            }
        };
        st.brother_key = Some(settings.public_key().clone());
        st.brother_suite = Some(suite);
        st.brother_scheme = Some(scheme);
        st.brother_settings = Some(settings);
        Some(msg.clone())
    }

    fn process_stream_key(&self, msg: &Message) -> Option<Message> {
        let mut st = self.state.lock().expect("gateway state poisoned");
        st.brother = msg.data().get(1).copied().unwrap_or(UNKNOWN_STATE);

        let receivable = matches!(
            st.current,
            SETTINGS_EXCHANGED | ESTABLISHING_STREAM | STREAM_ESTABLISHED | SIGNING_STATE
        );
        if !receivable {
            self.log_error_locked(
                &mut st,
                CryptoError::custom(
                    "Stream Received Error",
                    "current state cannot receive a stream key",
                ),
                Severity::Basic,
            );
            return None;
        }
        match st.brother {
            ESTABLISHING_STREAM => st.current = STREAM_ESTABLISHED,
            STREAM_ESTABLISHED => st.current = SIGNING_STATE,
            _ => {
                self.log_error_locked(
                    &mut st,
                    CryptoError::custom(
                        "Stream Received Error",
                        "brother state could not send a stream key",
                    ),
                    Severity::Basic,
                );
                return None;
            }
        }

        let fresh = match &st.stream_msg_in {
            None => true,
            Some(prev) => prev.data().get(2..) != msg.data().get(2..),
        };
        if !fresh {
            return Some(msg.clone());
        }
        if msg.size() < 3 {
            self.log_error_locked(&mut st, CryptoError::BufferTooSmall, Severity::Basic);
            return None;
        }

        let (self_keypair, self_precise, self_suite) =
            match (&st.self_keypair, &st.self_precise_key, &st.self_suite) {
                (Some(k), Some(p), Some(s)) => (k.clone(), p.clone(), s.clone()),
                _ => {
                    self.log_error_locked(
                        &mut st,
                        CryptoError::custom("Self Not Found", "the gateway could not find itself"),
                        Severity::Basic,
                    );
                    return None;
                }
            };
        let (self_group, self_name, brother_group, brother_name) = {
            let brother = match &st.brother_settings {
                Some(b) => b,
                None => {
                    self.log_error_locked(
                        &mut st,
                        CryptoError::custom(
                            "Brother Undefined",
                            "received a stream key before settings",
                        ),
                        Severity::Basic,
                    );
                    return None;
                }
            };
            let own = self.self_settings.read().expect("settings poisoned");
            (
                own.group_id().to_string(),
                own.node_name().to_string(),
                brother.group_id().to_string(),
                brother.node_name().to_string(),
            )
        };

        let mut seed = msg.data()[2..].to_vec();
        let hist = self_keypair
            .search_key(&self_precise)
            .map(|(h, _)| h)
            .unwrap_or(crate::keypair::CURRENT_INDEX);
        if let Err(err) = self_keypair.decode_bytes(&mut seed, hist) {
            self.log_error_locked(&mut st, err, Severity::Basic);
            return None;
        }
        st.input_stream = Some(StreamDecrypter::new(self_suite.build_stream(&seed)));

        let key_bytes = seed.len();
        let mut transcript = vec![0u8; 8 + key_bytes + 2 * GROUP_SIZE + 2 * NAME_SIZE];
        transcript[8..8 + key_bytes].copy_from_slice(&seed);
        let mut at = 8 + key_bytes;
        transcript[at..at + brother_group.len()].copy_from_slice(brother_group.as_bytes());
        at += GROUP_SIZE;
        transcript[at..at + brother_name.len()].copy_from_slice(brother_name.as_bytes());
        at += NAME_SIZE;
        transcript[at..at + self_group.len()].copy_from_slice(self_group.as_bytes());
        at += GROUP_SIZE;
        transcript[at..at + self_name.len()].copy_from_slice(self_name.as_bytes());
        st.in_transcript = transcript;
        st.brother_primary_hash = None;
        st.brother_secondary_hash = None;
        st.stream_msg_in = Some(msg.clone());
        Some(msg.clone())
    }

    fn process_signing(&self, msg: &Message) -> Option<Message> {
        let mut st = self.state.lock().expect("gateway state poisoned");
        if st.current == ESTABLISHED {
            return None;
        }
        if !matches!(st.current, STREAM_ESTABLISHED | SIGNING_STATE | CONFIRM_OLD) {
            self.log_error_locked(
                &mut st,
                CryptoError::custom(
                    "Signing Received Error",
                    "current state cannot receive a signing message",
                ),
                Severity::Basic,
            );
            return None;
        }
        let msg = self.decrypt_locked(&mut st, msg.clone())?;
        let data = msg.data();
        let (timeout, _, _) = self.timeouts();
        let cur_stamp = now();

        let (brother_suite, brother_scheme, brother_key, self_suite) = match (
            &st.brother_suite,
            &st.brother_scheme,
            &st.brother_key,
            &st.self_suite,
        ) {
            (Some(a), Some(b), Some(c), Some(d)) => (a.clone(), b.clone(), c.clone(), d.clone()),
            _ => {
                self.log_error_locked(
                    &mut st,
                    CryptoError::custom("Brother Undefined", "signing requires bound settings"),
                    Severity::Basic,
                );
                return None;
            }
        };
        if st.in_transcript.is_empty() {
            self.log_error_locked(
                &mut st,
                CryptoError::custom("Init Error", "no stream transcript to verify against"),
                Severity::Basic,
            );
            return None;
        }
        st.brother = *data.get(1)?;

        let brother_kb = brother_scheme.key_bytes();
        let self_hash_size = self_suite.hash_size() as usize;
        if data.len() < 2 + 16 + brother_kb + 2 {
            self.log_error_locked(&mut st, CryptoError::BufferTooSmall, Severity::Basic);
            return None;
        }

        // Primary: timestamp window, then transcript hash, then RSA verify.
        let primary_stamp = i64::from_le_bytes(data[2..10].try_into().expect("8 bytes"));
        if primary_stamp + timeout < cur_stamp || primary_stamp > cur_stamp + timeout {
            self.log_error_locked(
                &mut st,
                CryptoError::custom(
                    "Invalid Timestamp",
                    "a cryptographic timestamp which was out of range was received",
                ),
                Severity::Timeout,
            );
            return None;
        }
        st.in_transcript[..8].copy_from_slice(&data[2..10]);
        let primary_hash = brother_suite.hash(&st.in_transcript);
        if st.brother_primary_hash.as_ref() != Some(&primary_hash) {
            let signature = brother_scheme.convert(&data[2 + 16..2 + 16 + brother_kb]);
            let recovered = brother_scheme.encode(&signature, &brother_key).ok();
            let expected = hash_to_value(&primary_hash, brother_scheme.key_words());
            let valid = recovered
                .map(|r| r.cmp_value(&expected) == std::cmp::Ordering::Equal)
                .unwrap_or(false);
            if !valid {
                self.log_error_locked(
                    &mut st,
                    CryptoError::custom(
                        "Signature Failure, Primary",
                        "the brother failed to sign the hash",
                    ),
                    Severity::Timeout,
                );
                return None;
            }
            st.brother_primary_hash = Some(primary_hash);
        }

        // Do we already trust this exact (name, key) binding?
        let (brother_group, brother_name) = {
            let brother = st.brother_settings.as_ref()?;
            (brother.group_id().to_string(), brother.node_name().to_string())
        };
        let bank = self.user.key_bank();
        let node = bank.find_name(&brother_group, &brother_name);
        let key_in_record = match node {
            Some(node) => {
                bank.find_key(&brother_key, brother_scheme.algorithm(), brother_scheme.key_words())
                    == Some(node)
            }
            None => false,
        };

        // Secondary: same window and transcript discipline, verified
        // against a bank-trusted retired key named by its hash.
        let secondary_stamp = i64::from_le_bytes(data[10..18].try_into().expect("8 bytes"));
        if secondary_stamp + timeout < cur_stamp || secondary_stamp > cur_stamp + timeout {
            self.log_error_locked(
                &mut st,
                CryptoError::custom(
                    "Invalid Timestamp",
                    "a cryptographic timestamp which was out of range was received",
                ),
                Severity::Timeout,
            );
            return None;
        }
        st.in_transcript[..8].copy_from_slice(&data[10..18]);
        let secondary_hash = brother_suite.hash(&st.in_transcript);
        let sec_words = u16::from_le_bytes(
            data[2 + 16 + brother_kb..2 + 16 + brother_kb + 2].try_into().expect("2 bytes"),
        );
        let sec_at = 2 + 16 + brother_kb + 2;

        if sec_words > 0
            && !key_in_record
            && st.brother_secondary_hash.as_ref() != Some(&secondary_hash)
        {
            let node = match node {
                Some(node) => node,
                None => {
                    self.log_error_locked(
                        &mut st,
                        CryptoError::custom(
                            "Key Not Found",
                            "a continuity proof arrived for an unknown node",
                        ),
                        Severity::Timeout,
                    );
                    return None;
                }
            };
            let key_id_raw = data.get(sec_at..sec_at + self_hash_size)?;
            let key_id = HashDigest::from_bytes(self_suite.hash_algorithm(), key_id_raw);

            let mut trusted = None;
            for peer_key in bank.keys_by_timestamp(node).iter().take(MAX_ELIGIBLE_KEYS) {
                if self_suite.hash(&peer_key.key.to_bytes_le_trimmed()) == key_id {
                    trusted = Some(peer_key.clone());
                    break;
                }
            }
            let trusted = match trusted {
                Some(k) if k.key_words == sec_words => k,
                _ => {
                    self.log_error_locked(
                        &mut st,
                        CryptoError::custom(
                            "Key Not Found",
                            "the key our brother used to establish identity is not recognized",
                        ),
                        Severity::Timeout,
                    );
                    return None;
                }
            };
            let scheme = match PublicKeyRegistry::global().find(trusted.algorithm) {
                Some(scheme) => scheme.with_key_words(trusted.key_words),
                None => {
                    self.log_error_locked(
                        &mut st,
                        CryptoError::IllegalAlgorithmBind("secondary key algorithm".into()),
                        Severity::Timeout,
                    );
                    return None;
                }
            };
            let sig_at = sec_at + self_hash_size;
            let sig_raw = data.get(sig_at..sig_at + sec_words as usize * 4)?;
            let recovered = scheme.encode(&scheme.convert(sig_raw), &trusted.key).ok();
            let expected = hash_to_value(&secondary_hash, sec_words);
            let valid = recovered
                .map(|r| r.cmp_value(&expected) == std::cmp::Ordering::Equal)
                .unwrap_or(false);
            if !valid {
                self.log_error_locked(
                    &mut st,
                    CryptoError::custom(
                        "Signature Failure, Secondary",
                        "the brother failed to sign the hash",
                    ),
                    Severity::Timeout,
                );
                return None;
            }
            st.brother_secondary_hash = Some(secondary_hash);
        }

        // Eligible-key hashes the brother will accept from us.
        let list_at = sec_at + sec_words as usize * 4 + self_hash_size;
        let count = *data.get(list_at)? as usize;
        if count > MAX_ELIGIBLE_KEYS {
            self.log_error_locked(
                &mut st,
                CryptoError::custom("Malformed Signing Message", "eligible key list too long"),
                Severity::Timeout,
            );
            return None;
        }
        let mut eligible = Vec::with_capacity(count);
        for i in 0..count {
            let off = list_at + 1 + i * self_hash_size;
            let raw = data.get(off..off + self_hash_size)?;
            eligible.push(HashDigest::from_bytes(self_suite.hash_algorithm(), raw));
        }
        st.eligible_keys = eligible;

        // Authentication decision.
        let authenticated =
            node.is_none() || key_in_record || st.brother_secondary_hash.is_some();
        if authenticated {
            if let Err(err) = bank.add_pair(
                &brother_group,
                &brother_name,
                &brother_key,
                brother_scheme.algorithm(),
                brother_scheme.key_words(),
            ) {
                self.log_error_locked(&mut st, err, Severity::Basic);
                return None;
            }
            st.brother_authenticated = true;
            if st.current == CONFIRM_OLD
                && (st.brother == CONFIRM_OLD || st.brother == ESTABLISHED)
            {
                st.current = ESTABLISHED;
            } else {
                st.current = CONFIRM_OLD;
            }
            tracing::debug!(peer = %brother_name, state = st.current, "peer authenticated");
        } else {
            st.current = CONFIRM_OLD;
        }
        Some(msg)
    }

    fn process_secure_exchange(&self, msg: &Message) -> Option<Message> {
        let mut st = self.state.lock().expect("gateway state poisoned");
        if st.current != ESTABLISHED && st.current != CONFIRM_OLD {
            self.log_error_locked(
                &mut st,
                CryptoError::custom(
                    "Invalid State",
                    "cannot receive a data-exchange message when not secured",
                ),
                Severity::Basic,
            );
            return None;
        }
        let msg = self.decrypt_locked(&mut st, msg.clone())?;
        st.brother = *msg.data().get(1)?;
        if st.brother != ESTABLISHED {
            self.log_error_locked(
                &mut st,
                CryptoError::custom(
                    "Invalid Brother State",
                    "cannot send a data-exchange message when not secured",
                ),
                Severity::Basic,
            );
            return None;
        }
        if st.current == CONFIRM_OLD {
            if !st.brother_authenticated {
                self.log_error_locked(
                    &mut st,
                    CryptoError::custom(
                        "Unproven Identity",
                        "the brother opened the channel before proving its identity",
                    ),
                    Severity::Basic,
                );
                return None;
            }
            st.current = ESTABLISHED;
        }
        Some(msg)
    }

    fn process_error(&self, msg: &Message) -> Option<Message> {
        let mut st = self.state.lock().expect("gateway state poisoned");
        let hint = msg.data().get(1).copied().unwrap_or(UNKNOWN_STATE);
        if st.brother == hint {
            return Some(msg.clone());
        }
        st.brother = hint;
        st.current = CONFIRM_ERROR_STATE;
        drop(st);

        if msg.size() == 2 {
            return Some(msg.clone());
        }
        // Parse the peer's diagnostic and log it locally.
        let data = msg.data();
        let title_len = u16::from_le_bytes([*data.get(2)?, *data.get(3)?]) as usize;
        let title_raw = data.get(4..4 + title_len)?;
        let at = 4 + title_len;
        let desc_len = u16::from_le_bytes([*data.get(at)?, *data.get(at + 1)?]) as usize;
        let desc_raw = data.get(at + 2..at + 2 + desc_len)?;
        self.errors.log(CryptoError::custom(
            format!("BrotherError: {}", String::from_utf8_lossy(title_raw)),
            String::from_utf8_lossy(desc_raw).into_owned(),
        ));
        Some(msg.clone())
    }

    // ------------------------------ Timekeeping ------------------------------

    /// Compare registered timestamps with the clock and force state
    /// changes where a window has expired.
    pub fn process_timestamps(&self) {
        let (timeout, _, error_timeout) = self.timeouts();
        let mut st = self.state.lock().expect("gateway state poisoned");
        let stamps = self.stamps.lock().expect("stamp lock poisoned");
        let t = now();

        if st.current == TIMEOUT_ERROR_STATE {
            if stamps.error + error_timeout < t {
                st.current = if st.brother == CONFIRM_ERROR_STATE {
                    UNKNOWN_BROTHER
                } else {
                    BASIC_ERROR_STATE
                };
            }
        } else if st.current != PERMANENT_ERROR_STATE && stamps.received + timeout < t {
            st.current = UNKNOWN_BROTHER;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::key_size;
    use crate::keypair::tests::{test_keypair_128, test_keypair_128_alt};
    use crate::keypair::RsaKeypair;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn user_with(name: &str, keypair: RsaKeypair) -> Arc<User> {
        let user = User::new(name, None, None).unwrap();
        user.add_keypair(Arc::new(keypair));
        user
    }

    /// Alternate get/process until both sides are secure. Returns the
    /// number of exchanges used, or `usize::MAX` on failure.
    fn drive(a: &Gateway, b: &Gateway, rounds: usize) -> usize {
        for round in 1..=rounds {
            if let Some(m) = a.get_message() {
                b.process_message(&m);
            }
            if a.secure() && b.secure() {
                return round;
            }
            if let Some(m) = b.get_message() {
                a.process_message(&m);
            }
            if a.secure() && b.secure() {
                return round;
            }
        }
        usize::MAX
    }

    fn fresh_pair(a_name: &str, b_name: &str) -> (Arc<User>, Arc<User>, Gateway, Gateway) {
        let ua = user_with(a_name, test_keypair_128());
        let ub = user_with(b_name, test_keypair_128_alt());
        let ga = Gateway::new(ua.clone(), "testnet").unwrap();
        let gb = Gateway::new(ub.clone(), "testnet").unwrap();
        (ua, ub, ga, gb)
    }

    #[test]
    fn full_handshake_establishes_within_ten_exchanges() {
        init_tracing();
        let (_ua, _ub, ga, gb) = fresh_pair("alice", "bob");
        assert_eq!(ga.current_state(), UNKNOWN_BROTHER);
        let rounds = drive(&ga, &gb, 10);
        assert!(rounds <= 10, "handshake did not converge");
        assert!(ga.secure());
        assert!(gb.secure());
        assert_eq!(ga.brother_state(), ESTABLISHED);
        assert!(ga.brother_node().is_some());
        assert!(gb.brother_node().is_some());
    }

    #[test]
    fn secured_send_roundtrips_application_bytes() {
        let (_ua, _ub, ga, gb) = fresh_pair("carol", "dan");
        assert!(drive(&ga, &gb, 10) <= 10);

        let mut msg = Message::new(2).unwrap();
        msg.data_mut()[0] = message::SECURE_DATA_EXCHANGE;
        msg.push_string("hello").unwrap();

        let wire = ga.send(msg).unwrap();
        assert!(wire.encrypted());
        let mut received = gb.process_message(&wire).unwrap();
        assert!(!received.encrypted());
        assert_eq!(received.pop_string().unwrap(), "hello");

        // And the reverse direction, twice, to exercise the tag sequence.
        for text in ["one", "two"] {
            let mut msg = Message::new(2).unwrap();
            msg.data_mut()[0] = message::SECURE_DATA_EXCHANGE;
            msg.push_string(text).unwrap();
            let wire = gb.send(msg).unwrap();
            let mut received = ga.process_message(&wire).unwrap();
            assert_eq!(received.pop_string().unwrap(), text);
        }
    }

    #[test]
    fn ping_exchange_walks_the_settings_states() {
        let (_ua, _ub, ga, gb) = fresh_pair("erin", "frank");
        let ping_a = ga.get_message().unwrap();
        assert_eq!(ping_a.message_type(), message::PING);
        gb.process_message(&ping_a);
        assert_eq!(gb.current_state(), SETTINGS_EXCHANGED);
        assert_eq!(gb.brother_settings().unwrap().node_name(), "erin");

        let ping_b = gb.get_message().unwrap();
        ga.process_message(&ping_b);
        assert_eq!(ga.current_state(), ESTABLISHING_STREAM);
    }

    #[test]
    fn inactivity_timeout_returns_to_unknown_brother() {
        let (_ua, _ub, ga, gb) = fresh_pair("gina", "hank");
        assert!(drive(&ga, &gb, 10) <= 10);

        ga.stamps.lock().unwrap().received = now() - 2 * DEFAULT_TIMEOUT;
        ga.process_timestamps();
        assert_eq!(ga.current_state(), UNKNOWN_BROTHER);
    }

    #[test]
    fn permanent_errors_survive_timeouts() {
        let (_ua, _ub, ga, _gb) = fresh_pair("iris", "jack");
        {
            let mut st = ga.state.lock().unwrap();
            let err = CryptoError::custom("Fatal", "unrecoverable");
            ga.log_error_locked(&mut st, err, Severity::Permanent);
        }
        ga.stamps.lock().unwrap().received = now() - 10 * DEFAULT_TIMEOUT;
        ga.process_timestamps();
        assert_eq!(ga.current_state(), PERMANENT_ERROR_STATE);
    }

    #[test]
    fn error_packets_are_confirmed_and_reset() {
        let (_ua, _ub, ga, gb) = fresh_pair("kate", "liam");

        // Application data before establishment drives a basic error.
        let mut stray = Message::new(6).unwrap();
        stray.data_mut()[0] = 42;
        assert!(ga.process_message(&stray).is_none());
        assert_eq!(ga.current_state(), BASIC_ERROR_STATE);
        assert!(!ga.errors().is_empty());

        // The error packet reaches the peer, which acknowledges it.
        let error_packet = ga.get_message().unwrap();
        assert_eq!(error_packet.message_type(), message::BASIC_ERROR);
        gb.process_message(&error_packet);
        assert_eq!(gb.current_state(), CONFIRM_ERROR_STATE);

        let confirm = gb.get_message().unwrap();
        assert_eq!(confirm.message_type(), message::CONFIRM_ERROR);
        ga.process_message(&confirm);
        assert_eq!(ga.current_state(), UNKNOWN_BROTHER);
    }

    #[test]
    fn reconnection_authenticates_on_primary_alone() {
        let (ua, ub, ga, gb) = fresh_pair("mary", "ned");
        assert!(drive(&ga, &gb, 10) <= 10);

        // Second session: both banks already hold the peer's current key.
        let ga2 = Gateway::new(ua.clone(), "testnet").unwrap();
        let gb2 = Gateway::new(ub.clone(), "testnet").unwrap();
        assert!(drive(&ga2, &gb2, 10) <= 10);

        // Still exactly one node per peer.
        assert_eq!(ua.key_bank().node_count(), 1);
        assert_eq!(ub.key_bank().node_count(), 1);
    }

    #[test]
    fn key_rotation_authenticates_through_the_secondary_signature() {
        let (ua, ub, ga, gb) = fresh_pair("olga", "pete");
        assert!(drive(&ga, &gb, 10) <= 10);
        let old_n = ua.default_keypair().unwrap().n();

        // Olga rotates; her old key drops into history.
        let fresh = RsaKeypair::generate_blocking(key_size::PUBLIC128);
        ua.default_keypair()
            .unwrap()
            .add_key_pair(&fresh.n(), &fresh.d(), now());

        let ga2 = Gateway::new(ua.clone(), "testnet").unwrap();
        let gb2 = Gateway::new(ub.clone(), "testnet").unwrap();
        let rounds = drive(&ga2, &gb2, 10);
        assert!(rounds <= 10, "rotated handshake did not converge");
        assert!(ga2.secure() && gb2.secure());

        // Pete's bank clustered both keys under one identity.
        let bank = ub.key_bank();
        let node = bank.find_name("testnet", "olga").unwrap();
        let keys = bank.keys_by_timestamp(node);
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().any(|k| k.key.cmp_value(&old_n) == std::cmp::Ordering::Equal));
        assert!(keys.iter().any(|k| k.key.cmp_value(&fresh.n()) == std::cmp::Ordering::Equal));
        assert_eq!(bank.node_count(), 1);
    }

    #[test]
    fn unknown_key_without_continuity_proof_is_not_established() {
        // A peer reusing a known name under a brand new identity (no
        // shared history) must not reach ESTABLISHED from our side.
        let (ua, ub, ga, gb) = fresh_pair("quinn", "rose");
        assert!(drive(&ga, &gb, 10) <= 10);

        // "quinn" reappears with a totally fresh keypair and no history.
        let imposter = User::new("quinn", None, None).unwrap();
        imposter.add_keypair(Arc::new(RsaKeypair::generate_blocking(key_size::PUBLIC128)));
        let gi = Gateway::new(imposter, "testnet").unwrap();
        let gb2 = Gateway::new(ub.clone(), "testnet").unwrap();

        let rounds = drive(&gi, &gb2, 10);
        assert_eq!(rounds, usize::MAX);
        assert!(!gb2.secure());
        drop(ua);
    }
}
