//! Tracking session worker
//!
//! One `TrackerSession` runs on its own task per `start`. It owns the
//! acknowledged sequence and the backoff state; the outside world only sees
//! them through the status channel.

use crate::auth::{AuthHeader, Challenge, ChallengeHandler};
use crate::backoff::Backoff;
use crate::decoder::decode_item;
use crate::framer::{Frame, Framer};
use bytes::Bytes;
use changes_core::prelude::*;
use changes_core::{ByteStream, ConnectionMetrics, LatencyTimer, TrackerMetrics};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Where the state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    #[default]
    Stopped,
    Connecting,
    ChallengedAuth,
    Streaming,
    Retrying,
}

impl fmt::Display for TrackerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Connecting => "connecting",
            Self::ChallengedAuth => "challenged_auth",
            Self::Streaming => "streaming",
            Self::Retrying => "retrying",
        };
        f.write_str(name)
    }
}

/// Diagnostics snapshot of a tracker
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerStatus {
    pub state: TrackerState,
    /// Last sequence acknowledged by the consumer (or a `last_seq` marker)
    pub last_sequence: Option<Sequence>,
    /// Failures since the last healthy attempt
    pub consecutive_failures: u32,
    /// Records delivered during the current session
    pub delivered: u64,
    /// Connection attempts during the current session
    pub attempts: u64,
    /// When the current stream started
    pub connected_since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// One physical connection lifetime
struct ConnectionAttempt {
    started_at: Instant,
    last_activity: Instant,
    challenge_answered: bool,
    framer: Framer,
    delivered: usize,
    orderly_close: bool,
    resumed_from: Option<Sequence>,
}

impl ConnectionAttempt {
    fn new(mode: FeedMode, resumed_from: Option<Sequence>) -> Self {
        let now = Instant::now();
        Self {
            started_at: now,
            last_activity: now,
            challenge_answered: false,
            framer: Framer::for_mode(mode),
            delivered: 0,
            orderly_close: false,
            resumed_from,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

enum AttemptOutcome {
    /// Body ended normally
    Completed { healthy: bool, progressed: bool },
    /// Retryable failure
    Failed { error: TrackerError, healthy: bool },
    /// Session must end with this error
    Fatal(TrackerError),
    /// Stop requested
    Cancelled,
}

/// Everything one tracking run owns
pub(crate) struct TrackerSession {
    config: TrackerConfig,
    transport: Arc<dyn ChangesTransport>,
    handler: Arc<dyn ChangeHandler>,
    finisher: Arc<dyn FinishHandler>,
    status: Arc<watch::Sender<TrackerStatus>>,
    cancel: CancellationToken,
    /// Fired once the session has reached `Stopped`, before the hook runs
    done: CancellationToken,
    since: Option<Sequence>,
    auth: ChallengeHandler,
    auth_header: Option<AuthHeader>,
    backoff: Backoff,
    metrics: TrackerMetrics,
    connection: ConnectionMetrics,
}

impl TrackerSession {
    pub(crate) fn new(
        config: TrackerConfig,
        transport: Arc<dyn ChangesTransport>,
        handler: Arc<dyn ChangeHandler>,
        finisher: Arc<dyn FinishHandler>,
        status: Arc<watch::Sender<TrackerStatus>>,
        cancel: CancellationToken,
        done: CancellationToken,
    ) -> Self {
        Self {
            since: config.since.clone(),
            auth: ChallengeHandler::new(config.credentials.clone()),
            backoff: Backoff::new(config.backoff.clone()),
            metrics: TrackerMetrics::new(config.name.clone()),
            connection: ConnectionMetrics::new(format!("changes:{}", config.name)),
            auth_header: None,
            config,
            transport,
            handler,
            finisher,
            status,
            cancel,
            done,
        }
    }

    /// Build the `_changes` request for the current position
    pub(crate) fn feed_request(&self) -> Result<FeedRequest> {
        let mut url = self.config.database_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                TrackerError::config(format!(
                    "database_url {} cannot be a base",
                    self.config.database_url
                ))
            })?
            .pop_if_empty()
            .push("_changes");

        {
            let mut query = url.query_pairs_mut();
            let mode = self.config.mode;
            query.append_pair("feed", mode.as_query_value());
            if mode != FeedMode::OneShot && !self.config.heartbeat.is_zero() {
                query.append_pair("heartbeat", &self.config.heartbeat.as_millis().to_string());
            }
            if let Some(since) = self.since.as_ref().filter(|s| !s.is_origin()) {
                query.append_pair("since", &since.to_query_value());
            }
            if self.config.include_conflicts {
                query.append_pair("style", "all_docs");
            }
            if self.config.include_docs {
                query.append_pair("include_docs", "true");
            }
            if let Some(limit) = self.config.limit {
                query.append_pair("limit", &limit.to_string());
            }

            let filter = &self.config.filter;
            if let Some(doc_ids) = &filter.doc_ids {
                query.append_pair("filter", "_doc_ids");
                query.append_pair("doc_ids", &serde_json::to_string(doc_ids)?);
            } else if let Some(name) = &filter.name {
                query.append_pair("filter", name);
                for (key, value) in &filter.params {
                    query.append_pair(key, value);
                }
            }
        }

        let mut request = FeedRequest::new(url);
        for (name, value) in &self.config.request_headers {
            request = request.with_header(name.clone(), value.clone());
        }
        if let Some(auth) = &self.auth_header {
            request = request.with_header(auth.name, auth.value.clone());
        }
        Ok(request)
    }

    /// Run until stopped or a fatal error, then fire the termination hook
    ///
    /// The status channel is final before `done` fires, so the hook may start
    /// a new session on the same tracker.
    pub(crate) async fn run(mut self) {
        info!(
            tracker = %self.config.name,
            mode = %self.config.mode,
            since = ?self.since.as_ref().map(Sequence::to_query_value),
            transport = self.transport.name(),
            "Change tracker started"
        );

        let outcome = self.run_loop().await;

        self.connection.set_connected(false);
        self.status.send_modify(|s| {
            s.state = TrackerState::Stopped;
            s.connected_since = None;
            if let Some(e) = &outcome {
                s.last_error = Some(e.to_string());
            }
        });

        match &outcome {
            Some(e) => error!(tracker = %self.config.name, error = %e, "Change tracker stopped with error"),
            None => info!(
                tracker = %self.config.name,
                last_seq = ?self.since.as_ref().map(Sequence::to_query_value),
                "Change tracker stopped"
            ),
        }

        self.done.cancel();
        self.finisher.on_finished(outcome);
    }

    async fn run_loop(&mut self) -> Option<TrackerError> {
        loop {
            match self.run_attempt().await {
                AttemptOutcome::Cancelled => return None,
                AttemptOutcome::Fatal(e) => {
                    self.metrics.record_error(e.kind());
                    return Some(e);
                }
                AttemptOutcome::Completed {
                    healthy,
                    progressed,
                } => match self.config.mode {
                    FeedMode::OneShot => return None,
                    FeedMode::LongPoll => {
                        self.note_success();
                        if !progressed {
                            // Nothing new; don't hammer a server that answers instantly
                            let pause = self.backoff.delay(1);
                            if !self.pause(pause).await {
                                return None;
                            }
                        }
                    }
                    FeedMode::Continuous if healthy => self.note_success(),
                    FeedMode::Continuous => {
                        let error = TrackerError::transport("continuous feed closed by server");
                        if let Some(e) = self.retry_after_failure(error).await {
                            return e;
                        }
                    }
                },
                AttemptOutcome::Failed { error, .. } if !error.is_retryable() => {
                    self.metrics.record_error(error.kind());
                    return Some(error);
                }
                AttemptOutcome::Failed { error, healthy } => {
                    if healthy {
                        self.backoff.reset();
                    }
                    if let Some(e) = self.retry_after_failure(error).await {
                        return e;
                    }
                }
            }
        }
    }

    /// Count a failure and wait out the backoff
    ///
    /// Returns `Some(outcome)` when the session must end instead.
    async fn retry_after_failure(&mut self, error: TrackerError) -> Option<Option<TrackerError>> {
        self.metrics.record_error(error.kind());
        let message = error.to_string();

        let Some(delay) = self.backoff.record_failure() else {
            let attempts = self.backoff.failures();
            self.metrics.record_error("retries_exhausted");
            return Some(Some(TrackerError::RetriesExhausted { attempts, message }));
        };

        warn!(
            tracker = %self.config.name,
            error = %error,
            failures = self.backoff.failures(),
            delay_ms = delay.as_millis() as u64,
            "Changes feed attempt failed, retrying"
        );
        self.metrics.record_backoff(delay);
        let failures = self.backoff.failures();
        self.status.send_modify(|s| {
            s.state = TrackerState::Retrying;
            s.consecutive_failures = failures;
            s.connected_since = None;
            s.last_error = Some(message);
        });

        if !self.pause(delay).await {
            return Some(None);
        }
        self.connection.record_reconnect();
        None
    }

    /// Sleep unless cancelled; false means stop was requested
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn note_success(&mut self) {
        self.backoff.reset();
        self.status.send_modify(|s| s.consecutive_failures = 0);
    }

    fn set_state(&self, state: TrackerState) {
        self.status.send_modify(|s| s.state = state);
    }

    async fn run_attempt(&mut self) -> AttemptOutcome {
        let mut attempt = ConnectionAttempt::new(self.config.mode, self.since.clone());
        let metrics = self.metrics.clone();
        let _timer = LatencyTimer::start(move |d| metrics.record_attempt_duration(d));
        let mut number = 0;
        self.status.send_modify(|s| {
            s.attempts += 1;
            number = s.attempts;
        });

        let response = loop {
            if self.cancel.is_cancelled() {
                return AttemptOutcome::Cancelled;
            }
            self.set_state(TrackerState::Connecting);

            let request = match self.feed_request() {
                Ok(request) => request,
                Err(e) => return AttemptOutcome::Fatal(e),
            };
            debug!(
                tracker = %self.config.name,
                attempt = number,
                url = %request.url,
                challenge_answered = attempt.challenge_answered,
                "Opening changes feed"
            );

            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return AttemptOutcome::Cancelled,
                opened = self.transport.open(request) => opened,
            };
            let response = match opened {
                Ok(response) => response,
                Err(error) => {
                    return AttemptOutcome::Failed {
                        error,
                        healthy: false,
                    }
                }
            };

            if response.is_success() {
                break response;
            }

            let status = response.status;
            if !response.is_auth_challenge() {
                return AttemptOutcome::Failed {
                    error: TrackerError::HttpStatus {
                        status,
                        message: "changes feed request rejected".to_string(),
                    },
                    healthy: false,
                };
            }

            let challenge = Challenge::parse(status, response.challenge.as_deref());
            drop(response);

            if attempt.challenge_answered {
                return AttemptOutcome::Fatal(TrackerError::auth_failed(format!(
                    "credentials rejected (status {})",
                    status
                )));
            }

            self.set_state(TrackerState::ChallengedAuth);
            match self.auth.respond(&challenge) {
                Ok(header) => {
                    info!(
                        tracker = %self.config.name,
                        status,
                        scheme = header.scheme,
                        "Answering authentication challenge"
                    );
                    self.metrics.record_auth_challenge(header.scheme);
                    self.auth_header = Some(header);
                    attempt.challenge_answered = true;
                }
                Err(e) => return AttemptOutcome::Fatal(TrackerError::auth_failed(e.to_string())),
            }
        };

        self.status.send_modify(|s| {
            s.state = TrackerState::Streaming;
            s.connected_since = Some(Utc::now());
        });
        self.connection.set_connected(true);

        let outcome = self.stream_body(response.body, &mut attempt).await;
        self.connection.set_connected(false);

        let lifetime = attempt.started_at.elapsed();
        let healthy = self.backoff.is_healthy(attempt.delivered, lifetime);
        match outcome {
            Ok(()) => {
                let progressed = attempt.delivered > 0 || self.since != attempt.resumed_from;
                debug!(
                    tracker = %self.config.name,
                    delivered = attempt.delivered,
                    lifetime_ms = lifetime.as_millis() as u64,
                    "Changes response complete"
                );
                AttemptOutcome::Completed {
                    healthy: healthy || attempt.orderly_close,
                    progressed,
                }
            }
            Err(AttemptOutcome::Failed { error, .. }) => AttemptOutcome::Failed { error, healthy },
            Err(other) => other,
        }
    }

    /// Feed body chunks through the framer until the body ends
    ///
    /// The body stream is dropped, closing the connection, before this returns.
    async fn stream_body(
        &mut self,
        mut body: ByteStream,
        attempt: &mut ConnectionAttempt,
    ) -> std::result::Result<(), AttemptOutcome> {
        let idle_timeout = self.config.idle_timeout();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(AttemptOutcome::Cancelled),
                next = next_chunk(&mut body, idle_timeout) => next,
            };

            let chunk = match next {
                Err(silence) => {
                    debug!(
                        tracker = %self.config.name,
                        idle_ms = attempt.last_activity.elapsed().as_millis() as u64,
                        "No data or heartbeat from server"
                    );
                    return Err(AttemptOutcome::Failed {
                        error: TrackerError::timeout(
                            "heartbeat",
                            silence.as_millis() as u64,
                        ),
                        healthy: false,
                    })
                }
                Ok(None) => break,
                Ok(Some(Err(error))) => {
                    return Err(AttemptOutcome::Failed {
                        error,
                        healthy: false,
                    })
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            attempt.touch();
            trace!(bytes = chunk.len(), "Received changes chunk");
            for frame in attempt.framer.push(&chunk) {
                match frame {
                    Frame::Heartbeat => {
                        trace!(tracker = %self.config.name, "Heartbeat");
                        self.metrics.record_heartbeat();
                    }
                    Frame::Malformed(e) => {
                        warn!(tracker = %self.config.name, error = %e, "Skipping malformed feed line");
                        self.metrics.record_decode_error();
                    }
                    Frame::Value(value) => self.handle_value(value, attempt).await?,
                }
            }
        }

        let document = attempt.framer.finish().map_err(|error| AttemptOutcome::Failed {
            error,
            healthy: false,
        })?;
        drop(body);

        if let Some(document) = document {
            for value in document.results {
                self.handle_value(value, attempt).await?;
            }
            if let Some(last_seq) = document.last_seq {
                self.acknowledge(last_seq);
            }
        }

        Ok(())
    }

    async fn handle_value(
        &mut self,
        value: Value,
        attempt: &mut ConnectionAttempt,
    ) -> std::result::Result<(), AttemptOutcome> {
        let record = match decode_item(value) {
            Ok(FeedItem::Change(record)) => record,
            Ok(FeedItem::LastSequence(seq)) => {
                debug!(tracker = %self.config.name, last_seq = %seq, "Feed end marker");
                attempt.orderly_close = true;
                self.acknowledge(seq);
                return Ok(());
            }
            Err(e) => {
                warn!(tracker = %self.config.name, error = %e, "Skipping invalid change entry");
                self.metrics.record_decode_error();
                return Ok(());
            }
        };

        if self.cancel.is_cancelled() {
            return Err(AttemptOutcome::Cancelled);
        }

        let seq = record.sequence.clone();
        trace!(seq = %seq, doc_id = %record.doc_id, deleted = record.deleted, "Delivering change");

        if let Err(e) = self.handler.on_change(record).await {
            return Err(AttemptOutcome::Fatal(TrackerError::Delivery {
                message: format!("consumer rejected change at seq {}", seq),
                source: Some(Box::new(e)),
            }));
        }

        attempt.delivered += 1;
        self.metrics.record_change(&self.config.mode.to_string());
        self.status.send_modify(|s| s.delivered += 1);
        self.acknowledge(seq);
        Ok(())
    }

    fn acknowledge(&mut self, seq: Sequence) {
        self.status
            .send_modify(|s| s.last_sequence = Some(seq.clone()));
        self.since = Some(seq);
    }
}

/// Next body chunk, or the idle limit if the server went quiet
async fn next_chunk(
    body: &mut ByteStream,
    idle_timeout: Option<Duration>,
) -> std::result::Result<Option<Result<Bytes>>, Duration> {
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, body.next())
            .await
            .map_err(|_| limit),
        None => Ok(body.next().await),
    }
}
