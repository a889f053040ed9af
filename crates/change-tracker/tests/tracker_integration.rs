//! End-to-end tracker behaviour over a scripted transport

use async_trait::async_trait;
use change_tracker::{
    ChangeTracker, ScriptStep, ScriptedResponse, ScriptedTransport, TrackerEvent, TrackerState,
};
use changes_core::prelude::*;
use changes_core::{BackoffConfig, CredentialsConfig};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

const WAIT: Duration = Duration::from_secs(5);

fn config(mode: FeedMode) -> TrackerConfig {
    let mut config = TrackerConfig::for_database(Url::parse("http://couch.test/db").unwrap());
    config.mode = mode;
    config.heartbeat = Duration::from_secs(30);
    config.backoff = BackoffConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
        max_retries: Some(3),
        healthy_after: Duration::from_secs(60),
    };
    config
}

async fn next_event(events: &mut UnboundedReceiver<TrackerEvent>) -> TrackerEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for tracker event")
        .expect("event channel closed")
}

async fn next_change(events: &mut UnboundedReceiver<TrackerEvent>) -> ChangeRecord {
    match next_event(events).await {
        TrackerEvent::Change(record) => record,
        other => panic!("expected change, got {other:?}"),
    }
}

async fn finished(events: &mut UnboundedReceiver<TrackerEvent>) -> Option<TrackerError> {
    match next_event(events).await {
        TrackerEvent::Finished(error) => error,
        other => panic!("expected finish, got {other:?}"),
    }
}

async fn wait_for_requests(transport: &ScriptedTransport, count: usize) -> Vec<FeedRequest> {
    tokio::time::timeout(WAIT, async {
        loop {
            let requests = transport.requests().await;
            if requests.len() >= count {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for requests")
}

const TWO_LINES: &str = concat!(
    r#"{"seq":1,"id":"a","changes":[{"rev":"1-x"}]}"#,
    "\n",
    r#"{"seq":2,"id":"b","changes":[{"rev":"2-y"}],"deleted":true}"#,
    "\n",
);

/// Records deliveries and termination calls, optionally slow or failing
#[derive(Default)]
struct Recorder {
    delivered: Mutex<Vec<ChangeRecord>>,
    finished: Mutex<Vec<Option<String>>>,
    delay: Option<Duration>,
    reject: bool,
}

#[async_trait]
impl ChangeHandler for Recorder {
    async fn on_change(&self, record: ChangeRecord) -> Result<()> {
        if self.reject {
            return Err(TrackerError::delivery("disk full"));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.delivered.lock().unwrap().push(record);
        Ok(())
    }
}

impl FinishHandler for Recorder {
    fn on_finished(&self, error: Option<TrackerError>) {
        self.finished
            .lock()
            .unwrap()
            .push(error.map(|e| e.kind().to_string()));
    }
}

impl Recorder {
    fn delivered(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_continuous_delivers_each_line_in_order() {
    let transport = Arc::new(ScriptedTransport::with_steps([ScriptStep::Respond(
        ScriptedResponse::ok([TWO_LINES]).then_hang(),
    )]));
    let (tracker, mut events) = ChangeTracker::with_channel(transport.clone());
    tracker.start(config(FeedMode::Continuous)).unwrap();

    let first = next_change(&mut events).await;
    assert_eq!(first.sequence, Sequence::from(1));
    assert_eq!(first.doc_id, "a");
    assert_eq!(first.revisions, vec!["1-x"]);
    assert!(!first.deleted);

    let second = next_change(&mut events).await;
    assert_eq!(second.sequence, Sequence::from(2));
    assert_eq!(second.doc_id, "b");
    assert!(second.deleted);

    assert_eq!(tracker.last_sequence(), Some(Sequence::from(2)));
    assert_eq!(tracker.status().state, TrackerState::Streaming);

    let requests = transport.requests().await;
    assert_eq!(requests[0].url.path(), "/db/_changes");
    assert_eq!(requests[0].query("feed").as_deref(), Some("continuous"));
    assert_eq!(requests[0].query("heartbeat").as_deref(), Some("30000"));

    tracker.stop().await;
    assert!(finished(&mut events).await.is_none());
}

#[tokio::test]
async fn test_chunk_boundaries_do_not_change_records() {
    let mut runs = Vec::new();
    for chunk_size in [1, 3, 7, TWO_LINES.len()] {
        let chunks: Vec<Vec<u8>> = TWO_LINES
            .as_bytes()
            .chunks(chunk_size)
            .map(<[u8]>::to_vec)
            .collect();
        let transport = Arc::new(ScriptedTransport::with_steps([ScriptStep::Respond(
            ScriptedResponse::ok(chunks).then_hang(),
        )]));
        let (tracker, mut events) = ChangeTracker::with_channel(transport);
        tracker.start(config(FeedMode::Continuous)).unwrap();

        let records = vec![next_change(&mut events).await, next_change(&mut events).await];
        tracker.stop().await;
        runs.push(records);
    }

    for run in &runs[1..] {
        assert_eq!(run, &runs[0]);
    }
}

#[tokio::test]
async fn test_oneshot_delivers_results_then_finishes() {
    let transport = Arc::new(ScriptedTransport::with_steps([ScriptStep::Respond(
        ScriptedResponse::json(json!({
            "results": [
                {"seq": "1-a", "id": "a", "changes": [{"rev": "1-x"}]},
                {"seq": "2-b", "id": "b", "changes": [{"rev": "1-y"}]},
                {"seq": "3-c", "id": "c", "changes": [{"rev": "1-z"}]}
            ],
            "last_seq": "9-z"
        })),
    )]));
    let (tracker, mut events) = ChangeTracker::with_channel(transport.clone());
    tracker.start(config(FeedMode::OneShot)).unwrap();

    let ids = vec![
        next_change(&mut events).await.doc_id,
        next_change(&mut events).await.doc_id,
        next_change(&mut events).await.doc_id,
    ];
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert!(finished(&mut events).await.is_none());

    tracker.wait().await;
    assert!(!tracker.is_running());
    assert_eq!(tracker.last_sequence(), Some(Sequence::from("9-z")));
    assert_eq!(tracker.status().state, TrackerState::Stopped);

    let requests = transport.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].query("feed").as_deref(), Some("normal"));
    assert_eq!(requests[0].query("heartbeat"), None);
}

#[tokio::test]
async fn test_invalid_entries_are_skipped() {
    let body = concat!(
        r#"{"seq":1,"id":"a"}"#,
        "\n",
        "not json at all\n",
        r#"{"seq":2,"changes":[]}"#,
        "\n",
        r#"{"seq":3,"id":"c"}"#,
        "\n",
    );
    let transport = Arc::new(ScriptedTransport::with_steps([ScriptStep::Respond(
        ScriptedResponse::ok([body]).then_hang(),
    )]));
    let (tracker, mut events) = ChangeTracker::with_channel(transport);
    tracker.start(config(FeedMode::Continuous)).unwrap();

    assert_eq!(next_change(&mut events).await.doc_id, "a");
    assert_eq!(next_change(&mut events).await.doc_id, "c");
    assert!(tracker.is_running());

    tracker.stop().await;
    assert!(finished(&mut events).await.is_none());
}

#[tokio::test]
async fn test_consumer_error_ends_session_without_acknowledging() {
    let transport = Arc::new(ScriptedTransport::with_steps([ScriptStep::Respond(
        ScriptedResponse::ok([TWO_LINES]).then_hang(),
    )]));
    let recorder = Arc::new(Recorder {
        reject: true,
        ..Default::default()
    });
    let tracker = ChangeTracker::new(transport, recorder.clone(), recorder.clone());
    tracker.start(config(FeedMode::Continuous)).unwrap();
    tokio::time::timeout(WAIT, tracker.wait()).await.unwrap();

    assert_eq!(
        *recorder.finished.lock().unwrap(),
        vec![Some("delivery".to_string())]
    );
    assert_eq!(tracker.last_sequence(), None);
}

// ============================================================================
// Reconnects and backoff
// ============================================================================

#[tokio::test]
async fn test_reconnect_resumes_after_last_delivered() {
    let body = concat!(
        r#"{"seq":1,"id":"a"}"#,
        "\n",
        r#"{"seq":2,"id":"b"}"#,
        "\n",
        r#"{"seq":3,"id":"c"}"#,
        "\n",
    );
    let transport = Arc::new(ScriptedTransport::with_steps([
        ScriptStep::Respond(ScriptedResponse::ok([body]).then_error("connection reset")),
        ScriptStep::Respond(ScriptedResponse::ok([r#"{"seq":4,"id":"d"}"#, "\n"]).then_hang()),
    ]));
    let (tracker, mut events) = ChangeTracker::with_channel(transport.clone());
    tracker.start(config(FeedMode::Continuous)).unwrap();

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(next_change(&mut events).await.doc_id);
    }
    assert_eq!(ids, vec!["a", "b", "c", "d"]);

    let requests = transport.requests().await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].query("since"), None);
    assert_eq!(requests[1].query("since").as_deref(), Some("3"));
    assert_eq!(tracker.status().consecutive_failures, 1);

    tracker.stop().await;
    assert!(finished(&mut events).await.is_none());
}

#[tokio::test]
async fn test_configured_since_is_sent() {
    let transport = Arc::new(ScriptedTransport::new());
    let (tracker, mut events) = ChangeTracker::with_channel(transport.clone());
    let mut cfg = config(FeedMode::LongPoll);
    cfg.since = Some(Sequence::from("17-g1AAA"));
    tracker.start(cfg).unwrap();

    let requests = wait_for_requests(&transport, 1).await;
    assert_eq!(requests[0].query("since").as_deref(), Some("17-g1AAA"));
    assert_eq!(tracker.last_sequence(), Some(Sequence::from("17-g1AAA")));

    tracker.stop().await;
    assert!(finished(&mut events).await.is_none());
}

#[tokio::test]
async fn test_longpoll_reconnects_from_last_seq() {
    let transport = Arc::new(ScriptedTransport::with_steps([
        ScriptStep::Respond(ScriptedResponse::json(json!({
            "results": [{"seq": 1, "id": "a"}],
            "last_seq": 1
        }))),
        ScriptStep::Respond(ScriptedResponse::json(json!({
            "results": [{"seq": 2, "id": "b"}],
            "last_seq": 2
        }))),
    ]));
    let (tracker, mut events) = ChangeTracker::with_channel(transport.clone());
    tracker.start(config(FeedMode::LongPoll)).unwrap();

    assert_eq!(next_change(&mut events).await.doc_id, "a");
    assert_eq!(next_change(&mut events).await.doc_id, "b");

    let requests = wait_for_requests(&transport, 3).await;
    assert_eq!(requests[0].query("feed").as_deref(), Some("longpoll"));
    assert_eq!(requests[1].query("since").as_deref(), Some("1"));
    assert_eq!(requests[2].query("since").as_deref(), Some("2"));
    assert_eq!(tracker.status().consecutive_failures, 0);

    tracker.stop().await;
    assert!(finished(&mut events).await.is_none());
}

#[tokio::test]
async fn test_continuous_end_marker_reconnects_from_it() {
    let body = concat!(r#"{"seq":1,"id":"a"}"#, "\n", r#"{"last_seq":5}"#, "\n");
    let transport = Arc::new(ScriptedTransport::with_steps([ScriptStep::Respond(
        ScriptedResponse::ok([body]),
    )]));
    let (tracker, mut events) = ChangeTracker::with_channel(transport.clone());
    tracker.start(config(FeedMode::Continuous)).unwrap();

    assert_eq!(next_change(&mut events).await.doc_id, "a");
    let requests = wait_for_requests(&transport, 2).await;
    assert_eq!(requests[1].query("since").as_deref(), Some("5"));

    tracker.stop().await;
    assert!(finished(&mut events).await.is_none());
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let transport = Arc::new(ScriptedTransport::with_steps([
        ScriptStep::Respond(ScriptedResponse::status(503)),
        ScriptStep::Fail("connection refused".to_string()),
        ScriptStep::Respond(ScriptedResponse::json(json!({
            "results": [{"seq": 1, "id": "a"}],
            "last_seq": 1
        }))),
    ]));
    let (tracker, mut events) = ChangeTracker::with_channel(transport.clone());
    tracker.start(config(FeedMode::OneShot)).unwrap();

    assert_eq!(next_change(&mut events).await.doc_id, "a");
    assert!(finished(&mut events).await.is_none());
    assert_eq!(transport.requests().await.len(), 3);
}

#[tokio::test]
async fn test_retry_cap_ends_session() {
    let transport = Arc::new(ScriptedTransport::with_steps([
        ScriptStep::Fail("refused".to_string()),
        ScriptStep::Fail("refused".to_string()),
        ScriptStep::Fail("refused".to_string()),
        ScriptStep::Fail("refused".to_string()),
        ScriptStep::Fail("refused".to_string()),
    ]));
    let (tracker, mut events) = ChangeTracker::with_channel(transport.clone());
    let mut cfg = config(FeedMode::LongPoll);
    cfg.backoff.max_retries = Some(2);
    tracker.start(cfg).unwrap();

    match finished(&mut events).await {
        Some(TrackerError::RetriesExhausted { attempts, message }) => {
            assert_eq!(attempts, 3);
            assert!(message.contains("refused"));
        }
        other => panic!("expected retries exhausted, got {other:?}"),
    }
    assert_eq!(transport.requests().await.len(), 3);
    assert_eq!(transport.remaining().await, 2);
}

#[tokio::test]
async fn test_silent_server_triggers_reconnect() {
    let transport = Arc::new(ScriptedTransport::with_steps([
        ScriptStep::Respond(ScriptedResponse::ok([r#"{"seq":1,"id":"a"}"#, "\n"]).then_hang()),
        ScriptStep::Respond(ScriptedResponse::ok([r#"{"seq":2,"id":"b"}"#, "\n"]).then_hang()),
    ]));
    let (tracker, mut events) = ChangeTracker::with_channel(transport.clone());
    let mut cfg = config(FeedMode::Continuous);
    cfg.heartbeat = Duration::from_millis(20);
    tracker.start(cfg).unwrap();

    assert_eq!(next_change(&mut events).await.doc_id, "a");
    assert_eq!(next_change(&mut events).await.doc_id, "b");

    let requests = transport.requests().await;
    assert_eq!(requests[1].query("since").as_deref(), Some("1"));
    assert_eq!(requests[1].query("heartbeat").as_deref(), Some("20"));

    tracker.stop().await;
    assert!(finished(&mut events).await.is_none());
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_challenge_is_answered_once() {
    let transport = Arc::new(ScriptedTransport::with_steps([
        ScriptStep::Respond(ScriptedResponse::challenge(401, r#"Basic realm="couchdb""#)),
        ScriptStep::Respond(ScriptedResponse::ok([TWO_LINES]).then_hang()),
    ]));
    let (tracker, mut events) = ChangeTracker::with_channel(transport.clone());
    let mut cfg = config(FeedMode::Continuous);
    cfg.credentials = CredentialsConfig::basic("Aladdin", "open sesame");
    tracker.start(cfg).unwrap();

    assert_eq!(next_change(&mut events).await.doc_id, "a");

    let requests = transport.requests().await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].header("authorization"), None);
    assert_eq!(
        requests[1].header("authorization"),
        Some("Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==")
    );

    tracker.stop().await;
}

#[tokio::test]
async fn test_second_challenge_in_attempt_is_fatal() {
    let transport = Arc::new(ScriptedTransport::with_steps([
        ScriptStep::Respond(ScriptedResponse::challenge(401, "Basic")),
        ScriptStep::Respond(ScriptedResponse::challenge(401, "Basic")),
        ScriptStep::Respond(ScriptedResponse::ok([TWO_LINES])),
    ]));
    let (tracker, mut events) = ChangeTracker::with_channel(transport.clone());
    let mut cfg = config(FeedMode::Continuous);
    cfg.credentials = CredentialsConfig::basic("user", "wrong");
    tracker.start(cfg).unwrap();

    assert!(matches!(
        finished(&mut events).await,
        Some(TrackerError::AuthenticationFailed { .. })
    ));
    assert_eq!(transport.requests().await.len(), 2);
    assert_eq!(transport.remaining().await, 1);
}

#[tokio::test]
async fn test_challenge_without_credentials_is_fatal() {
    let transport = Arc::new(ScriptedTransport::with_steps([ScriptStep::Respond(
        ScriptedResponse::challenge(407, r#"Basic realm="proxy""#),
    )]));
    let (tracker, mut events) = ChangeTracker::with_channel(transport.clone());
    tracker.start(config(FeedMode::LongPoll)).unwrap();

    match finished(&mut events).await {
        Some(TrackerError::AuthenticationFailed { message }) => {
            assert!(message.contains("proxy"));
        }
        other => panic!("expected authentication failure, got {other:?}"),
    }
    assert_eq!(transport.requests().await.len(), 1);
}

#[tokio::test]
async fn test_truncated_document_is_retried() {
    let transport = Arc::new(ScriptedTransport::with_steps([
        ScriptStep::Respond(ScriptedResponse::ok([r#"{"results":[{"seq":1,"id":"a"}"#])),
        ScriptStep::Respond(ScriptedResponse::json(json!({
            "results": [{"seq": 1, "id": "a"}],
            "last_seq": 1
        }))),
    ]));
    let (tracker, mut events) = ChangeTracker::with_channel(transport.clone());
    tracker.start(config(FeedMode::OneShot)).unwrap();

    assert_eq!(next_change(&mut events).await.doc_id, "a");
    assert!(finished(&mut events).await.is_none());
    assert_eq!(transport.requests().await.len(), 2);
    assert_eq!(tracker.last_sequence(), Some(Sequence::from(1)));
}

/// Fails every open with an error no reconnect can fix
struct Misconfigured;

#[async_trait]
impl ChangesTransport for Misconfigured {
    async fn open(&self, _request: FeedRequest) -> Result<FeedResponse> {
        Err(TrackerError::config("no route to database"))
    }

    fn name(&self) -> &'static str {
        "misconfigured"
    }
}

#[tokio::test]
async fn test_non_retryable_open_error_ends_session() {
    let (tracker, mut events) = ChangeTracker::with_channel(Arc::new(Misconfigured));
    tracker.start(config(FeedMode::Continuous)).unwrap();

    let error = finished(&mut events).await;
    assert!(matches!(error, Some(TrackerError::Configuration { .. })));
    tracker.wait().await;
    assert_eq!(tracker.status().consecutive_failures, 0);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_start_while_running_is_rejected() {
    let transport = Arc::new(ScriptedTransport::new());
    let (tracker, mut events) = ChangeTracker::with_channel(transport);
    tracker.start(config(FeedMode::LongPoll)).unwrap();

    assert!(matches!(
        tracker.start(config(FeedMode::LongPoll)),
        Err(TrackerError::AlreadyRunning)
    ));

    tracker.stop().await;
    assert!(finished(&mut events).await.is_none());

    // Restart after stop
    tracker.start(config(FeedMode::LongPoll)).unwrap();
    assert!(tracker.is_running());
    tracker.stop().await;
    assert!(finished(&mut events).await.is_none());
}

#[tokio::test]
async fn test_invalid_config_is_rejected_synchronously() {
    let transport = Arc::new(ScriptedTransport::new());
    let (tracker, _events) = ChangeTracker::with_channel(transport.clone());
    let mut cfg = config(FeedMode::LongPoll);
    cfg.limit = Some(0);

    assert!(matches!(
        tracker.start(cfg),
        Err(TrackerError::Configuration { .. })
    ));
    assert!(!tracker.is_running());
    assert!(transport.requests().await.is_empty());
}

#[tokio::test]
async fn test_stop_halts_delivery_and_finishes_once() {
    let body: String = (1..=5)
        .map(|n| format!("{{\"seq\":{n},\"id\":\"doc-{n}\"}}\n"))
        .collect();
    let transport = Arc::new(ScriptedTransport::with_steps([ScriptStep::Respond(
        ScriptedResponse::ok([body]).then_hang(),
    )]));
    let recorder = Arc::new(Recorder {
        delay: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let tracker = ChangeTracker::new(transport, recorder.clone(), recorder.clone());
    tracker.start(config(FeedMode::Continuous)).unwrap();

    tokio::time::timeout(WAIT, async {
        while recorder.delivered() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    tracker.stop().await;
    let delivered = recorder.delivered();
    assert!(delivered < 5);

    tracker.stop().await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(recorder.delivered(), delivered);
    assert_eq!(*recorder.finished.lock().unwrap(), vec![None]);
    assert_eq!(tracker.status().state, TrackerState::Stopped);
}

#[tokio::test]
async fn test_stop_during_backoff() {
    let transport = Arc::new(ScriptedTransport::with_steps([ScriptStep::Fail(
        "refused".to_string(),
    )]));
    let finishes = Arc::new(AtomicUsize::new(0));

    struct CountFinish(Arc<AtomicUsize>);
    impl FinishHandler for CountFinish {
        fn on_finished(&self, error: Option<TrackerError>) {
            assert!(error.is_none());
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let tracker = ChangeTracker::new(
        transport.clone(),
        Arc::new(Recorder::default()),
        Arc::new(CountFinish(finishes.clone())),
    );
    let mut cfg = config(FeedMode::LongPoll);
    cfg.backoff.initial_delay = Duration::from_secs(30);
    cfg.backoff.max_delay = Duration::from_secs(30);
    tracker.start(cfg).unwrap();

    let mut status = tracker.subscribe();
    tokio::time::timeout(WAIT, status.wait_for(|s| s.state == TrackerState::Retrying))
        .await
        .unwrap()
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), tracker.stop())
        .await
        .unwrap();
    assert_eq!(finishes.load(Ordering::SeqCst), 1);
    assert_eq!(transport.requests().await.len(), 1);
}

#[tokio::test]
async fn test_start_during_stop_is_rejected() {
    let transport = Arc::new(ScriptedTransport::with_steps([ScriptStep::Respond(
        ScriptedResponse::ok([TWO_LINES]).then_hang(),
    )]));
    let recorder = Arc::new(Recorder {
        delay: Some(Duration::from_millis(200)),
        ..Default::default()
    });
    let tracker = Arc::new(ChangeTracker::new(
        transport.clone(),
        recorder.clone(),
        recorder.clone(),
    ));
    tracker.start(config(FeedMode::Continuous)).unwrap();
    wait_for_requests(&transport, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The worker is inside a slow delivery, so the stop cannot finish yet
    let stopping = tokio::spawn({
        let tracker = tracker.clone();
        async move { tracker.stop().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(tracker.is_running());
    assert!(matches!(
        tracker.start(config(FeedMode::Continuous)),
        Err(TrackerError::AlreadyRunning)
    ));

    tokio::time::timeout(WAIT, stopping).await.unwrap().unwrap();
    assert!(!tracker.is_running());
    assert_eq!(tracker.status().state, TrackerState::Stopped);
    assert_eq!(*recorder.finished.lock().unwrap(), vec![None]);
    assert_eq!(transport.requests().await.len(), 1);

    tracker.start(config(FeedMode::Continuous)).unwrap();
    assert!(tracker.is_running());
    tracker.stop().await;
    assert_eq!(recorder.finished.lock().unwrap().len(), 2);
}

/// Starts the tracker again from its own termination hook, once
#[derive(Default)]
struct RestartOnFinish {
    tracker: OnceLock<Weak<ChangeTracker>>,
    restarts: Mutex<Vec<std::result::Result<(), String>>>,
    finishes: AtomicUsize,
}

impl FinishHandler for RestartOnFinish {
    fn on_finished(&self, _error: Option<TrackerError>) {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        let Some(tracker) = self.tracker.get().and_then(Weak::upgrade) else {
            return;
        };
        let mut restarts = self.restarts.lock().unwrap();
        if restarts.is_empty() {
            let result = tracker.start(config(FeedMode::OneShot));
            restarts.push(result.map_err(|e| e.kind().to_string()));
        }
    }
}

#[tokio::test]
async fn test_termination_hook_can_restart() {
    let body = json!({"results": [{"seq": 1, "id": "a"}], "last_seq": 1});
    let transport = Arc::new(ScriptedTransport::with_steps([
        ScriptStep::Respond(ScriptedResponse::json(body.clone())),
        ScriptStep::Respond(ScriptedResponse::json(body)),
    ]));
    let recorder = Arc::new(Recorder::default());
    let finisher = Arc::new(RestartOnFinish::default());
    let tracker = Arc::new(ChangeTracker::new(
        transport.clone(),
        recorder.clone(),
        finisher.clone(),
    ));
    finisher.tracker.set(Arc::downgrade(&tracker)).unwrap();

    tracker.start(config(FeedMode::OneShot)).unwrap();

    tokio::time::timeout(WAIT, async {
        while finisher.finishes.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(*finisher.restarts.lock().unwrap(), vec![Ok(())]);
    assert_eq!(transport.requests().await.len(), 2);
    assert_eq!(recorder.delivered(), 2);

    tracker.wait().await;
    assert!(!tracker.is_running());
    assert_eq!(tracker.status().state, TrackerState::Stopped);
}
