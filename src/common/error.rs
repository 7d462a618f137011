//! Error types for fleetsync

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Lock Errors ===
    #[error("Lock {path} is held by {holder}")]
    LockAcquire { holder: String, path: String },

    #[error("Stale lock held by {holder} ({age_secs}s old) on {path}")]
    StaleLock {
        holder: String,
        age_secs: i64,
        path: String,
    },

    #[error("Download lock is no longer held by {holder} (fencing token {token})")]
    LockNotHeld { holder: String, token: u64 },

    // === Role Errors ===
    #[error("Permission denied: {operation} requires the {required} role")]
    Permission {
        operation: &'static str,
        required: &'static str,
    },

    // === Artifact Errors ===
    #[error("Download failed: {0}")]
    Download(String),

    #[error("Binary validation failed: {0}")]
    BinaryValidation(String),

    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    // === Upgrade Errors ===
    #[error("Upgrade already in progress (phase {phase})")]
    UpgradeInProgress { phase: String },

    #[error("Protocol violation: cannot move from {from} to {to}")]
    ProtocolViolation { from: String, to: String },

    // === Service Errors ===
    #[error("Service {service} failed: {reason}")]
    ServiceManagement { service: String, reason: String },

    // === Volume Errors ===
    #[error("Filesystem mismatch on {path}: expected {expected}, found {actual}")]
    FilesystemMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Cannot identify filesystem at {path}: {source}")]
    FilesystemId {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // === Coordination Store Errors ===
    #[error("Coordination store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Lock contention and artifact failures are meant to be retried by the
    /// caller with backoff. Role violations and configuration problems are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockAcquire { .. }
                | Error::StaleLock { .. }
                | Error::Download(_)
                | Error::BinaryValidation(_)
                | Error::ChecksumMismatch { .. }
                | Error::Timeout(_)
                | Error::Store(_)
        )
    }

    /// Is this a fatal configuration problem (as opposed to a transient one)?
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::FilesystemMismatch { .. } | Error::FilesystemId { .. } | Error::InvalidConfig(_)
        )
    }

    pub(crate) fn leader_only(operation: &'static str) -> Self {
        Error::Permission {
            operation,
            required: "leader",
        }
    }

    pub(crate) fn follower_only(operation: &'static str) -> Self {
        Error::Permission {
            operation,
            required: "follower",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
