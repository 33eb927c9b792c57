//! Shared error categories, severity levels, and the bounded error log
//!
//! Fallible I/O and protocol paths surface [`CryptoError`] values. Each
//! long-lived component (keypair, key bank, gateway, user) owns an
//! [`ErrorLog`]: a bounded ring of recent errors plus registered
//! listeners. Gateways additionally classify every logged error with a
//! [`Severity`] that drives the state machine into the matching error
//! state.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Default capacity of a component's error ring.
pub const DEFAULT_LOG_LENGTH: usize = 20;

/// Library-wide error kinds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("password too small")]
    PasswordTooSmall,
    #[error("password too large")]
    PasswordTooLarge,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("buffer too large")]
    BufferTooLarge,
    #[error("cannot open the specified file")]
    FileOpen,
    #[error("file format unrecognized or corrupt")]
    FileFormat,
    #[error("illegal algorithm bind: {0}")]
    IllegalAlgorithmBind(String),
    #[error("hash comparison failed")]
    HashCompare,
    #[error("hash generation failed")]
    HashGeneration,
    #[error("action attempted on a file in an error state")]
    ActionOnFileInError,
    #[error("action attempted on a closed file")]
    ActionOnClosedFile,
    #[error("public key size wrong")]
    PublicKeySizeWrong,
    #[error("key missing")]
    KeyMissing,
    #[error("public key undefined")]
    NullPublicKey,
    #[error("data undefined")]
    NullData,
    #[error("owning structure undefined")]
    NullMaster,
    #[error("owning structures do not match")]
    MasterMismatch,
    #[error("string too large")]
    StringTooLarge,
    #[error("insertion into a data structure unexpectedly failed")]
    InsertionFailed,
    #[error("unknown error type")]
    UnknownErrorType,
    #[error("{title}: {description}")]
    Custom { title: String, description: String },
}

impl CryptoError {
    /// Convenience constructor for ad-hoc errors.
    pub fn custom(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Custom { title: title.into(), description: description.into() }
    }

    /// Short human-readable title, used in error packets.
    pub fn title(&self) -> String {
        match self {
            Self::PasswordTooSmall | Self::PasswordTooLarge => "Password Size Error".into(),
            Self::BufferTooSmall | Self::BufferTooLarge => "Buffer Size Error".into(),
            Self::FileOpen => "File Open Error".into(),
            Self::FileFormat => "File Format Error".into(),
            Self::IllegalAlgorithmBind(_) => "Illegal Algorithm Bind".into(),
            Self::HashCompare => "Hash Compare Error".into(),
            Self::HashGeneration => "Hash Generation Error".into(),
            Self::ActionOnFileInError | Self::ActionOnClosedFile => "File Action Error".into(),
            Self::PublicKeySizeWrong => "Public Key Size Error".into(),
            Self::KeyMissing => "Key Missing".into(),
            Self::NullPublicKey => "NULL Public Key".into(),
            Self::NullData => "NULL Data".into(),
            Self::NullMaster => "NULL Master".into(),
            Self::MasterMismatch => "Master Mismatch".into(),
            Self::StringTooLarge => "String Size Error".into(),
            Self::InsertionFailed => "Insertion Failed".into(),
            Self::UnknownErrorType => "Unknown Error".into(),
            Self::Custom { title, .. } => title.clone(),
        }
    }

    /// Longer description, used in error packets.
    pub fn description(&self) -> String {
        match self {
            Self::Custom { description, .. } => description.clone(),
            other => other.to_string(),
        }
    }
}

/// Severity levels a gateway assigns to logged errors.
///
/// Each maps onto the matching error state: basic errors reset the
/// connection, timeout errors force a dwell before reconnection, and
/// permanent errors are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Basic,
    Timeout,
    Permanent,
}

/// An error together with the moment it was logged.
#[derive(Debug, Clone)]
pub struct LoggedError {
    pub error: CryptoError,
    pub timestamp: i64,
}

/// Callback interface for components interested in another component's
/// errors. Listeners are invoked with the log's lock held and must not
/// re-enter the sender.
pub trait ErrorListener: Send + Sync {
    fn receive_error(&self, error: &LoggedError);
}

struct LogInner {
    ring: VecDeque<LoggedError>,
    capacity: usize,
    listeners: Vec<Arc<dyn ErrorListener>>,
}

/// Bounded ring of recent errors with listener fan-out.
pub struct ErrorLog {
    inner: Mutex<LogInner>,
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_LENGTH)
    }
}

impl ErrorLog {
    /// Log holding at most `capacity` entries; older entries are evicted.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                ring: VecDeque::with_capacity(capacity),
                capacity,
                listeners: Vec::new(),
            }),
        }
    }

    /// Record an error, evicting the oldest entry when full, and fan it
    /// out to listeners.
    pub fn log(&self, error: CryptoError) {
        tracing::warn!(error = %error, "crypto error logged");
        let entry = LoggedError { error, timestamp: chrono::Utc::now().timestamp() };
        let mut inner = self.inner.lock().expect("error log poisoned");
        while inner.ring.len() >= inner.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(entry.clone());
        for listener in &inner.listeners {
            listener.receive_error(&entry);
        }
    }

    /// Remove and return the most recent error.
    pub fn pop(&self) -> Option<LoggedError> {
        self.inner.lock().expect("error log poisoned").ring.pop_back()
    }

    /// Number of retained errors.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("error log poisoned").ring.len()
    }

    /// True when nothing has been logged (or everything was popped).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change the ring capacity, evicting as needed.
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock().expect("error log poisoned");
        inner.capacity = capacity.max(1);
        while inner.ring.len() > inner.capacity {
            inner.ring.pop_front();
        }
    }

    /// Register a listener for future errors.
    pub fn push_listener(&self, listener: Arc<dyn ErrorListener>) {
        self.inner.lock().expect("error log poisoned").listeners.push(listener);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ring_evicts_oldest_beyond_capacity() {
        let log = ErrorLog::new(3);
        for i in 0..5 {
            log.log(CryptoError::custom(format!("e{i}"), "x"));
        }
        assert_eq!(log.len(), 3);
        // Most recent first when popping.
        assert_eq!(log.pop().unwrap().error.title(), "e4");
        assert_eq!(log.pop().unwrap().error.title(), "e3");
        assert_eq!(log.pop().unwrap().error.title(), "e2");
        assert!(log.pop().is_none());
    }

    #[test]
    fn listeners_see_every_log() {
        struct Counter(AtomicUsize);
        impl ErrorListener for Counter {
            fn receive_error(&self, _: &LoggedError) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let log = ErrorLog::default();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        log.push_listener(counter.clone());
        log.log(CryptoError::KeyMissing);
        log.log(CryptoError::HashCompare);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn titles_and_descriptions_are_stable() {
        let err = CryptoError::custom("Signature Failure", "the peer failed to sign");
        assert_eq!(err.title(), "Signature Failure");
        assert_eq!(err.description(), "the peer failed to sign");
        assert_eq!(CryptoError::PasswordTooSmall.title(), "Password Size Error");
    }
}
