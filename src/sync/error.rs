use thiserror::Error;

use crate::kobo::NetworkError;
use crate::retry::AttemptTimedOut;
use crate::store::StoreError;

/// Failure of a single sync item.
///
/// `is_retryable()` separates transfer faults worth another download
/// attempt from outcomes a retry cannot change.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("Download of {url} stalled: no data for {idle_ms}ms after {received} bytes")]
    Stalled {
        url: String,
        idle_ms: u128,
        received: u64,
    },

    #[error("Partial download of {url}: received {received} of {expected} bytes")]
    PartialDownload {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("Body error downloading {url} after {received} bytes: {reason}")]
    Body {
        url: String,
        received: u64,
        reason: String,
    },

    #[error("Hash mismatch for {path}: content does not match its manifest, refusing to delete")]
    Integrity { path: String },

    #[error("Manifest {path} is unreadable: {reason}")]
    CorruptManifest { path: String, reason: String },

    #[error("Target name {name} is also claimed by field '{other_field}' of the same submission")]
    DuplicateName { name: String, other_field: String },

    #[error("Expected a file at {0}")]
    NotAFile(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Timeout(#[from] AttemptTimedOut),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Stalled { .. }
            | SyncError::PartialDownload { .. }
            | SyncError::Body { .. }
            | SyncError::Timeout(_) => true,
            // The fetcher already spent its own attempt budget.
            SyncError::Network(_) => false,
            SyncError::Integrity { .. }
            | SyncError::CorruptManifest { .. }
            | SyncError::DuplicateName { .. }
            | SyncError::NotAFile(_)
            | SyncError::Store(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_download_retryable() {
        let e = SyncError::PartialDownload {
            url: "u".into(),
            expected: 10,
            received: 4,
        };
        assert!(e.is_retryable());
        assert_eq!(e.to_string(), "Partial download of u: received 4 of 10 bytes");
    }

    #[test]
    fn test_stall_retryable() {
        let e = SyncError::Stalled {
            url: "u".into(),
            idle_ms: 50,
            received: 3,
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn test_exhausted_fetch_not_retryable() {
        let e = SyncError::Network(NetworkError::Exhausted {
            endpoint: "u".into(),
            attempts: 20,
            last_error: "HTTP status 503".into(),
        });
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_integrity_not_retryable() {
        assert!(!SyncError::Integrity { path: "p".into() }.is_retryable());
    }
}
