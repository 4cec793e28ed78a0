//! Retrying wrapper around [`ApiSession`]: every remote call made by the
//! pipeline goes through here so attempt budgets, connection timeouts and
//! the bearer token are applied uniformly.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::error::{NetworkError, TransportError};
use super::session::{ApiSession, ByteStream};
use crate::retry::{self, RetryAction, RetryConfig, RetryFailure};

/// What to do with a successful response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Json,
    Stream,
}

#[derive(Debug)]
pub enum Fetched {
    Json(Value),
    Stream(ByteStream),
}

#[derive(Clone)]
pub struct Fetcher {
    session: Arc<dyn ApiSession>,
    token: Option<String>,
    retry: RetryConfig,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    pub fn new(
        session: Arc<dyn ApiSession>,
        token: Option<String>,
        max_attempts: u32,
        connection_timeout: Duration,
    ) -> Self {
        Self {
            session,
            token: token.filter(|t| !t.is_empty()),
            retry: RetryConfig::immediate(max_attempts, Some(connection_timeout)),
        }
    }

    /// Anonymous access when no token is configured.
    fn auth_header(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Token {t}"))
    }

    pub async fn fetch(&self, url: &str, kind: FetchKind) -> Result<Fetched, NetworkError> {
        let auth = self.auth_header();
        let session = &self.session;

        let result = retry::retry_with_timeout(
            &self.retry,
            |e: &TransportError| {
                if e.is_retryable() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            |_cancel| {
                let auth = auth.clone();
                async move {
                    let mut headers: Vec<(&str, &str)> = Vec::with_capacity(2);
                    if let Some(auth) = auth.as_deref() {
                        headers.push(("Authorization", auth));
                    }
                    match kind {
                        FetchKind::Json => session.get_json(url, &headers).await.map(Fetched::Json),
                        FetchKind::Stream => {
                            headers.push(("Connection", "keep-alive"));
                            let stream = session.get_stream(url, &headers).await?;
                            if stream.content_length.is_none() {
                                return Err(TransportError::MissingContentLength(url.to_string()));
                            }
                            Ok(Fetched::Stream(stream))
                        }
                    }
                }
            },
        )
        .await;

        result.map_err(|failure| to_network_error(url, failure))
    }

    pub async fn json(&self, url: &str) -> Result<Value, NetworkError> {
        match self.fetch(url, FetchKind::Json).await? {
            Fetched::Json(v) => Ok(v),
            Fetched::Stream(_) => Err(unexpected_kind(url, FetchKind::Json)),
        }
    }

    /// Open a download stream. The returned stream always carries a
    /// declared content length.
    pub async fn stream(&self, url: &str) -> Result<ByteStream, NetworkError> {
        match self.fetch(url, FetchKind::Stream).await? {
            Fetched::Stream(s) => Ok(s),
            Fetched::Json(_) => Err(unexpected_kind(url, FetchKind::Stream)),
        }
    }
}

fn unexpected_kind(url: &str, wanted: FetchKind) -> NetworkError {
    NetworkError::Rejected {
        endpoint: url.to_string(),
        reason: format!("response does not match requested kind {wanted:?}"),
    }
}

fn to_network_error(url: &str, failure: RetryFailure<TransportError>) -> NetworkError {
    let RetryFailure { attempts, error } = failure;
    match error {
        TransportError::MissingContentLength(_) => NetworkError::MissingContentLength {
            endpoint: url.to_string(),
        },
        e if !e.is_retryable() => NetworkError::Rejected {
            endpoint: url.to_string(),
            reason: e.to_string(),
        },
        e => NetworkError::Exhausted {
            endpoint: url.to_string(),
            attempts,
            last_error: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kobo::session::fake::{FakeSession, Reply};
    use serde_json::json;

    const URL: &str = "https://kf.example.org/api/v2/assets/aX/";

    fn fetcher(session: Arc<FakeSession>, token: Option<&str>) -> Fetcher {
        Fetcher::new(
            session,
            token.map(str::to_string),
            3,
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn test_json_success_sends_token() {
        let session = Arc::new(FakeSession::new());
        session.reply(URL, Reply::Json(json!({"uid": "aX"})));
        let f = fetcher(session.clone(), Some("abc"));
        let v = f.json(URL).await.unwrap();
        assert_eq!(v["uid"], "aX");
        assert_eq!(
            session.headers_of_first_call(),
            vec![("Authorization".to_string(), "Token abc".to_string())]
        );
    }

    #[tokio::test]
    async fn test_anonymous_when_token_empty() {
        let session = Arc::new(FakeSession::new());
        session.reply(URL, Reply::Json(json!({})));
        let f = fetcher(session.clone(), Some(""));
        f.json(URL).await.unwrap();
        assert!(session.headers_of_first_call().is_empty());
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let session = Arc::new(FakeSession::new());
        session
            .reply(URL, Reply::Status(502))
            .reply(URL, Reply::Status(503))
            .reply(URL, Reply::Json(json!({"ok": true})));
        let f = fetcher(session.clone(), None);
        assert_eq!(f.json(URL).await.unwrap()["ok"], true);
        assert_eq!(session.calls_to(URL), 3);
    }

    #[tokio::test]
    async fn test_exhausted_reports_endpoint_and_attempts() {
        let session = Arc::new(FakeSession::new());
        session.reply(URL, Reply::Status(500));
        let f = fetcher(session.clone(), None);
        match f.json(URL).await.unwrap_err() {
            NetworkError::Exhausted {
                endpoint, attempts, ..
            } => {
                assert_eq!(endpoint, URL);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(session.calls_to(URL), 3);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let session = Arc::new(FakeSession::new());
        session.reply(URL, Reply::Status(404));
        let f = fetcher(session.clone(), None);
        assert!(matches!(
            f.json(URL).await.unwrap_err(),
            NetworkError::Rejected { .. }
        ));
        assert_eq!(session.calls_to(URL), 1);
    }

    #[tokio::test]
    async fn test_stream_without_length_fails() {
        let session = Arc::new(FakeSession::new());
        session.reply(
            URL,
            Reply::Bytes {
                chunks: vec![b"abc".to_vec()],
                content_length: None,
                stall: false,
            },
        );
        let f = fetcher(session, None);
        assert!(matches!(
            f.stream(URL).await.unwrap_err(),
            NetworkError::MissingContentLength { .. }
        ));
    }

    #[tokio::test]
    async fn test_stream_carries_length() {
        let session = Arc::new(FakeSession::new());
        session.reply(URL, Reply::body(b"hello"));
        let f = fetcher(session, None);
        let s = f.stream(URL).await.unwrap();
        assert_eq!(s.content_length, Some(5));
    }
}
