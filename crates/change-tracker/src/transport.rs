//! Byte stream transports for the change tracker
//!
//! Implements the `ChangesTransport` strategy trait with multiple backends:
//! - HttpTransport: reqwest client, streaming the response body
//! - ScriptedTransport: canned responses, for testing

use async_trait::async_trait;
use bytes::Bytes;
use changes_core::prelude::*;
use changes_core::{ByteStream, TransportConfig, TransportKind};
use futures::{stream, StreamExt};
use reqwest::header::{ACCEPT, PROXY_AUTHENTICATE, WWW_AUTHENTICATE};
use reqwest::Client;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Build the transport selected by configuration
pub fn build_transport(config: &TransportConfig) -> Result<Arc<dyn ChangesTransport>> {
    match config.kind {
        TransportKind::Http => Ok(Arc::new(HttpTransport::new(config)?)),
    }
}

// ============================================================================
// HTTP Transport
// ============================================================================

/// reqwest-backed transport
///
/// No overall request timeout is set: continuous feeds never end on their
/// own, and silence is policed by the tracker's heartbeat timeout.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create new HTTP transport
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(!config.verify_certs)
            .build()
            .map_err(|e| TrackerError::transport_with_source("Failed to create client", e))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ChangesTransport for HttpTransport {
    async fn open(&self, request: FeedRequest) -> Result<FeedResponse> {
        let mut builder = self
            .client
            .get(request.url.clone())
            .header(ACCEPT, "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| TrackerError::transport_with_source("Changes request failed", e))?;

        let status = resp.status().as_u16();
        let challenge_header = match status {
            401 => Some(WWW_AUTHENTICATE),
            407 => Some(PROXY_AUTHENTICATE),
            _ => None,
        };
        let challenge = challenge_header
            .and_then(|name| resp.headers().get(name))
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        debug!(status, url = %request.url.path(), "Changes response received");

        let body = resp.bytes_stream().map(|chunk| {
            chunk.map_err(|e| TrackerError::transport_with_source("Failed reading changes body", e))
        });

        Ok(FeedResponse {
            status,
            challenge,
            body: Box::pin(body),
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

// ============================================================================
// Scripted Transport (for testing)
// ============================================================================

/// How a scripted body ends after its chunks
#[derive(Debug, Clone)]
pub enum BodyEnd {
    /// Clean end of body
    Close,
    /// Transport error mid-body
    Error(String),
    /// Never ends; the connection stays open
    Hang,
}

/// One canned response
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub status: u16,
    pub challenge: Option<String>,
    pub chunks: Vec<Bytes>,
    pub end: BodyEnd,
}

impl ScriptedResponse {
    /// 200 with the given body chunks, then close
    pub fn ok<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            status: 200,
            challenge: None,
            chunks: chunks.into_iter().map(Into::into).collect(),
            end: BodyEnd::Close,
        }
    }

    /// 200 with a JSON body in one chunk
    pub fn json(body: Value) -> Self {
        Self::ok([body.to_string()])
    }

    /// Bare status with empty body
    pub fn status(status: u16) -> Self {
        Self {
            status,
            challenge: None,
            chunks: Vec::new(),
            end: BodyEnd::Close,
        }
    }

    /// 401 (or 407) advertising `challenge`
    pub fn challenge(status: u16, challenge: impl Into<String>) -> Self {
        Self {
            challenge: Some(challenge.into()),
            ..Self::status(status)
        }
    }

    /// Builder: fail the body after the chunks
    pub fn then_error(mut self, message: impl Into<String>) -> Self {
        self.end = BodyEnd::Error(message.into());
        self
    }

    /// Builder: keep the body open after the chunks
    pub fn then_hang(mut self) -> Self {
        self.end = BodyEnd::Hang;
        self
    }

    fn into_response(self) -> FeedResponse {
        let chunks = stream::iter(self.chunks.into_iter().map(Ok::<Bytes, TrackerError>));
        let body: ByteStream = match self.end {
            BodyEnd::Close => Box::pin(chunks),
            BodyEnd::Error(message) => Box::pin(
                chunks.chain(stream::once(async move { Err(TrackerError::transport(message)) })),
            ),
            BodyEnd::Hang => Box::pin(chunks.chain(stream::pending())),
        };
        FeedResponse {
            status: self.status,
            challenge: self.challenge,
            body,
        }
    }
}

/// One scripted reaction to `open`
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(ScriptedResponse),
    /// Connection-level failure
    Fail(String),
}

/// Transport that replays a script and records every request
///
/// Once the script runs out, `open` never completes.
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<FeedRequest>>,
}

impl ScriptedTransport {
    /// Create new scripted transport
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create with steps
    pub fn with_steps(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Append a response
    pub async fn respond(&self, response: ScriptedResponse) {
        self.steps.lock().await.push_back(ScriptStep::Respond(response));
    }

    /// Append a connection failure
    pub async fn fail(&self, message: impl Into<String>) {
        self.steps.lock().await.push_back(ScriptStep::Fail(message.into()));
    }

    /// Requests seen so far
    pub async fn requests(&self) -> Vec<FeedRequest> {
        self.requests.lock().await.clone()
    }

    /// Steps not yet consumed
    pub async fn remaining(&self) -> usize {
        self.steps.lock().await.len()
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangesTransport for ScriptedTransport {
    async fn open(&self, request: FeedRequest) -> Result<FeedResponse> {
        trace!(url = %request.url, "Scripted open");
        self.requests.lock().await.push(request);
        let step = self.steps.lock().await.pop_front();
        match step {
            Some(ScriptStep::Respond(response)) => Ok(response.into_response()),
            Some(ScriptStep::Fail(message)) => Err(TrackerError::transport(message)),
            None => futures::future::pending().await,
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
