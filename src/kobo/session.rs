use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;

use super::error::TransportError;

/// Open response body plus its declared length.
pub struct ByteStream {
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Minimal transport used by the fetcher: one GET per call, no retries,
/// no timeouts. Non-2xx answers are errors.
#[async_trait]
pub trait ApiSession: Send + Sync {
    async fn get_json(&self, url: &str, headers: &[(&str, &str)]) -> Result<Value, TransportError>;

    async fn get_stream(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<ByteStream, TransportError>;
}

#[async_trait]
impl ApiSession for reqwest::Client {
    async fn get_json(&self, url: &str, headers: &[(&str, &str)]) -> Result<Value, TransportError> {
        let mut builder = self.get(url);
        for &(k, v) in headers {
            builder = builder.header(k, v);
        }
        let resp = builder.send().await?;
        if !resp.status().is_success() {
            return Err(TransportError::Status {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn get_stream(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<ByteStream, TransportError> {
        let mut builder = self.get(url);
        for &(k, v) in headers {
            builder = builder.header(k, v);
        }
        let resp = builder.send().await?;
        if !resp.status().is_success() {
            return Err(TransportError::Status {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }
        // Read the header directly: `Response::content_length` reports the
        // body size hint, which is absent for compressed transfers.
        let content_length = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::Http))
            .boxed();
        Ok(ByteStream {
            content_length,
            body,
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted in-memory transport for tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use futures_util::stream;

    use super::*;

    pub(crate) enum Reply {
        Json(Value),
        Bytes {
            chunks: Vec<Vec<u8>>,
            content_length: Option<u64>,
            stall: bool,
        },
        Status(u16),
    }

    impl Reply {
        pub(crate) fn body(data: &[u8]) -> Self {
            Reply::Bytes {
                chunks: vec![data.to_vec()],
                content_length: Some(data.len() as u64),
                stall: false,
            }
        }
    }

    /// Replies are queued per URL and consumed in order; the last reply
    /// for a URL is sticky so repeated runs see a stable server.
    #[derive(Default)]
    pub(crate) struct FakeSession {
        replies: Mutex<HashMap<String, VecDeque<Reply>>>,
        calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl FakeSession {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn reply(&self, url: &str, reply: Reply) -> &Self {
            self.replies
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(reply);
            self
        }

        pub(crate) fn calls_to(&self, url: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(u, _)| u == url)
                .count()
        }

        pub(crate) fn headers_of_first_call(&self) -> Vec<(String, String)> {
            self.calls
                .lock()
                .unwrap()
                .first()
                .map(|(_, h)| h.clone())
                .unwrap_or_default()
        }

        fn next_reply(&self, url: &str, headers: &[(&str, &str)]) -> Result<Reply, TransportError> {
            self.calls.lock().unwrap().push((
                url.to_string(),
                headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ));
            let mut replies = self.replies.lock().unwrap();
            let queue = replies.get_mut(url).ok_or(TransportError::Status {
                status: 404,
                url: url.to_string(),
            })?;
            let reply = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().map(Reply::clone_sticky)
            };
            reply.ok_or(TransportError::Status {
                status: 404,
                url: url.to_string(),
            })
        }
    }

    impl Reply {
        fn clone_sticky(&self) -> Reply {
            match self {
                Reply::Json(v) => Reply::Json(v.clone()),
                Reply::Bytes {
                    chunks,
                    content_length,
                    stall,
                } => Reply::Bytes {
                    chunks: chunks.clone(),
                    content_length: *content_length,
                    stall: *stall,
                },
                Reply::Status(s) => Reply::Status(*s),
            }
        }
    }

    #[async_trait]
    impl ApiSession for FakeSession {
        async fn get_json(
            &self,
            url: &str,
            headers: &[(&str, &str)],
        ) -> Result<Value, TransportError> {
            match self.next_reply(url, headers)? {
                Reply::Json(v) => Ok(v),
                Reply::Status(status) => Err(TransportError::Status {
                    status,
                    url: url.to_string(),
                }),
                Reply::Bytes { .. } => Err(TransportError::Decode("binary body".into())),
            }
        }

        async fn get_stream(
            &self,
            url: &str,
            headers: &[(&str, &str)],
        ) -> Result<ByteStream, TransportError> {
            match self.next_reply(url, headers)? {
                Reply::Bytes {
                    chunks,
                    content_length,
                    stall,
                } => {
                    let data = stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))));
                    let body = if stall {
                        data.chain(stream::pending()).boxed()
                    } else {
                        data.boxed()
                    };
                    Ok(ByteStream {
                        content_length,
                        body,
                    })
                }
                Reply::Status(status) => Err(TransportError::Status {
                    status,
                    url: url.to_string(),
                }),
                Reply::Json(_) => Err(TransportError::Decode("json body".into())),
            }
        }
    }
}
