//! Collaborator traits for the change tracker
//!
//! The tracker talks to three collaborators, all injected at construction:
//!
//! ```text
//!  ChangesTransport ──bytes──► ChangeTracker ──records──► ChangeHandler
//!                                     │
//!                                     └──────terminal──► FinishHandler
//! ```
//!
//! - **Async-first**: opening a connection and delivering a record may suspend
//! - **Stream-based**: response bodies are async byte streams
//! - **Swappable**: transports are selected by configuration, not inheritance

use crate::error::{Result, TrackerError};
use crate::message::ChangeRecord;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use url::Url;

/// Type alias for boxed async streams of response body chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

// ============================================================================
// Transport
// ============================================================================

/// One request for the change feed
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRequest {
    /// Full URL including query parameters
    pub url: Url,
    /// Headers to send, in order
    pub headers: Vec<(String, String)>,
}

impl FeedRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
        }
    }

    /// Builder: add header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Look up a header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Look up a query parameter
    pub fn query(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }
}

/// Response head plus body stream
pub struct FeedResponse {
    /// HTTP status code
    pub status: u16,
    /// Challenge header value for 401/407 responses
    pub challenge: Option<String>,
    /// Body chunks as they arrive
    pub body: ByteStream,
}

impl FeedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 401 or 407
    pub fn is_auth_challenge(&self) -> bool {
        self.status == 401 || self.status == 407
    }
}

impl fmt::Debug for FeedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedResponse")
            .field("status", &self.status)
            .field("challenge", &self.challenge)
            .finish_non_exhaustive()
    }
}

/// Byte stream source strategy
///
/// Implementations:
/// - `HttpTransport`: reqwest client
/// - `ScriptedTransport`: in-memory responses for tests
#[async_trait]
pub trait ChangesTransport: Send + Sync {
    /// Open a connection and return once status and headers are known
    ///
    /// Connection-level failures are returned as `TrackerError::Transport`.
    /// Any HTTP status, including errors, is returned as a `FeedResponse`.
    async fn open(&self, request: FeedRequest) -> Result<FeedResponse>;

    /// Transport name for logs
    fn name(&self) -> &'static str;
}

// ============================================================================
// Consumer
// ============================================================================

/// Receives change records, one at a time, in feed order
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// Take ownership of one record
    ///
    /// Returning an error stops the session; the record's sequence is not
    /// acknowledged.
    async fn on_change(&self, record: ChangeRecord) -> Result<()>;
}

/// Told once when a session ends
pub trait FinishHandler: Send + Sync {
    /// `None` means the session ended normally or was stopped
    fn on_finished(&self, error: Option<TrackerError>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_lookup() {
        let url = Url::parse("http://h/db/_changes?feed=longpoll&since=5").unwrap();
        let request = FeedRequest::new(url).with_header("Authorization", "Basic x");
        assert_eq!(request.query("since").as_deref(), Some("5"));
        assert_eq!(request.query("filter"), None);
        assert_eq!(request.header("authorization"), Some("Basic x"));
    }

    #[test]
    fn test_response_classification() {
        let response = FeedResponse {
            status: 407,
            challenge: Some("Basic realm=\"proxy\"".to_string()),
            body: Box::pin(futures::stream::empty()),
        };
        assert!(response.is_auth_challenge());
        assert!(!response.is_success());
    }
}
