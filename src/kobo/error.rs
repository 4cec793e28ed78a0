use thiserror::Error;

use crate::retry::AttemptTimedOut;

/// A single failed transport call.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("no usable content-length header from {0}")]
    MissingContentLength(String),
    #[error("response body is not valid JSON: {0}")]
    Decode(String),
    #[error("{0}")]
    Timeout(#[from] AttemptTimedOut),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl TransportError {
    /// Whether another attempt can change the outcome.
    ///
    /// 4xx answers other than 408/429 are definitive, as is a server that
    /// never declares a body length.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Status { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            TransportError::MissingContentLength(_) => false,
            TransportError::Decode(_) => true,
            TransportError::Timeout(_) => true,
            TransportError::Http(_) => true,
        }
    }
}

/// Terminal failure of a fetch after the retry budget has been spent.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("request to {endpoint} failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },
    #[error("request to {endpoint} aborted: {reason}")]
    Rejected { endpoint: String, reason: String },
    #[error("no usable content-length header from {endpoint}")]
    MissingContentLength { endpoint: String },
}

impl NetworkError {
    pub fn endpoint(&self) -> &str {
        match self {
            NetworkError::Exhausted { endpoint, .. }
            | NetworkError::Rejected { endpoint, .. }
            | NetworkError::MissingContentLength { endpoint } => endpoint,
        }
    }
}

/// Server payload that violates an invariant the pipeline relies on.
/// Never repaired or guessed past.
#[derive(Error, Debug)]
pub enum StructuralError {
    #[error("{context}: expected {expected} in '{field}'")]
    Field {
        context: String,
        field: String,
        expected: &'static str,
    },
    #[error("{context}: expected a JSON object")]
    NotAnObject { context: String },
    #[error(
        "asset {asset_uid}, submission {submission_id}: image field '{field}' maps to {count} values, expected at most one"
    )]
    MultipleValues {
        asset_uid: String,
        submission_id: i64,
        field: String,
        count: usize,
    },
}

impl StructuralError {
    pub(crate) fn field(context: impl Into<String>, field: &str, expected: &'static str) -> Self {
        StructuralError::Field {
            context: context.into(),
            field: field.to_string(),
            expected,
        }
    }
}

#[derive(Error, Debug)]
pub enum ProjectionError {
    #[error("record {index} is not a JSON object")]
    NotAnObject { index: usize },
}

/// Failure to fetch or ingest one asset-scoped resource.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error("{context}: listing stopped after {pages} page(s): {detail}")]
    IncompleteListing {
        context: String,
        pages: u32,
        detail: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn status(code: u16) -> TransportError {
        TransportError::Status {
            status: code,
            url: "x".into(),
        }
    }

    #[test]
    fn test_client_errors_not_retryable() {
        assert!(!status(401).is_retryable());
        assert!(!status(403).is_retryable());
        assert!(!status(404).is_retryable());
    }

    #[test]
    fn test_throttle_and_server_errors_retryable() {
        assert!(status(408).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
    }

    #[test]
    fn test_timeout_retryable() {
        let e = TransportError::from(AttemptTimedOut(Duration::from_millis(10)));
        assert!(e.is_retryable());
        assert_eq!(e.to_string(), "attempt timed out after 10ms");
    }

    #[test]
    fn test_missing_length_not_retryable() {
        assert!(!TransportError::MissingContentLength("u".into()).is_retryable());
    }

    #[test]
    fn test_network_error_endpoint() {
        let e = NetworkError::Exhausted {
            endpoint: "https://kf.example.org/api/v2/assets/".into(),
            attempts: 20,
            last_error: "HTTP status 502".into(),
        };
        assert_eq!(e.endpoint(), "https://kf.example.org/api/v2/assets/");
        assert!(e.to_string().contains("20 attempt(s)"));
    }
}
