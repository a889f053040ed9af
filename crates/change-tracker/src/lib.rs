//! # Change Tracker
//!
//! Follows a remote database's `_changes` feed and hands each change to a
//! consumer, in order, exactly once per connection.
//!
//! ## Components
//!
//! - `Framer`: splits the response body into JSON values
//! - `decode_item`: turns a value into a `ChangeRecord` or end marker
//! - `ChallengeHandler`: answers 401/407 challenges once per attempt
//! - `Backoff`: reconnect delays with reset and retry cap
//! - `HttpTransport` / `ScriptedTransport`: byte stream sources
//!
//! ## Usage
//!
//! ```rust,ignore
//! let transport = build_transport(&config.transport)?;
//! let (tracker, mut events) = ChangeTracker::with_channel(transport);
//!
//! tracker.start(config)?;
//! while let Some(event) = events.recv().await {
//!     match event {
//!         TrackerEvent::Change(record) => println!("{}", record.doc_id),
//!         TrackerEvent::Finished(error) => break,
//!     }
//! }
//! ```

pub mod auth;
pub mod backoff;
pub mod checkpoint;
pub mod decoder;
pub mod framer;
pub mod handler;
pub mod session;
pub mod transport;

pub use auth::*;
pub use backoff::*;
pub use checkpoint::*;
pub use decoder::*;
pub use framer::*;
pub use handler::*;
pub use session::{TrackerState, TrackerStatus};
pub use transport::*;

use changes_core::prelude::*;
use session::TrackerSession;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

struct RunningSession {
    generation: u64,
    cancel: CancellationToken,
    /// Fires when the session reaches `Stopped`, before the termination hook
    done: CancellationToken,
    /// Fires when the worker task exits
    exited: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningSession {
    fn is_active(&self) -> bool {
        !self.done.is_cancelled()
    }
}

/// Handle to a change tracking session
///
/// At most one session runs per tracker. The session runs on its own task;
/// records reach the `ChangeHandler` from that task, and the `FinishHandler`
/// is told exactly once when the session ends. The termination hook may call
/// `start` again; the previous session no longer counts as active by then.
pub struct ChangeTracker {
    transport: Arc<dyn ChangesTransport>,
    handler: Arc<dyn ChangeHandler>,
    finisher: Arc<dyn FinishHandler>,
    status: Arc<watch::Sender<TrackerStatus>>,
    session: Mutex<Option<RunningSession>>,
    generation: AtomicU64,
}

impl ChangeTracker {
    /// Create a stopped tracker
    pub fn new(
        transport: Arc<dyn ChangesTransport>,
        handler: Arc<dyn ChangeHandler>,
        finisher: Arc<dyn FinishHandler>,
    ) -> Self {
        let (status, _) = watch::channel(TrackerStatus::default());
        Self {
            transport,
            handler,
            finisher,
            status: Arc::new(status),
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Create a tracker whose hooks feed a channel
    pub fn with_channel(
        transport: Arc<dyn ChangesTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<TrackerEvent>) {
        let (handler, events) = ChannelHandler::new();
        let tracker = Self::new(transport, handler.clone(), handler);
        (tracker, events)
    }

    /// Begin a session
    ///
    /// Fails immediately with `AlreadyRunning` if a session is active, or
    /// with a configuration error. Must be called within a Tokio runtime.
    pub fn start(&self, config: TrackerConfig) -> Result<()> {
        config.validate()?;

        let mut slot = self.lock_session();
        if slot.as_ref().is_some_and(RunningSession::is_active) {
            return Err(TrackerError::AlreadyRunning);
        }

        self.status.send_replace(TrackerStatus {
            last_sequence: config.since.clone(),
            ..Default::default()
        });

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let exited = CancellationToken::new();
        let worker = TrackerSession::new(
            config,
            self.transport.clone(),
            self.handler.clone(),
            self.finisher.clone(),
            self.status.clone(),
            cancel.clone(),
            done.clone(),
        );
        let done_guard = done.clone().drop_guard();
        let exited_guard = exited.clone().drop_guard();
        let task = tokio::spawn(async move {
            let _exited = exited_guard;
            let _done = done_guard;
            worker.run().await;
        });

        *slot = Some(RunningSession {
            generation,
            cancel,
            done,
            exited,
            task,
        });
        Ok(())
    }

    /// Stop the session and wait for it to wind down
    ///
    /// Idempotent. Once this returns no further records from the stopped
    /// session are delivered and its termination hook has run. The session
    /// stays in place until then, so a concurrent `start` gets
    /// `AlreadyRunning`. Calling this from inside a hook would wait on itself;
    /// use `request_stop` there.
    pub async fn stop(&self) {
        let observed = self
            .lock_session()
            .as_ref()
            .map(|s| (s.generation, s.cancel.clone(), s.exited.clone()));
        let Some((generation, cancel, exited)) = observed else {
            return;
        };

        debug!(generation, "Stopping change tracker");
        cancel.cancel();
        exited.cancelled().await;

        // The hook may already have started a successor; leave that one alone
        let finished = {
            let mut slot = self.lock_session();
            if slot.as_ref().is_some_and(|s| s.generation == generation) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(session) = finished {
            if let Err(e) = session.task.await {
                error!(error = %e, "Change tracker task failed");
            }
        }
    }

    /// Ask the session to stop without waiting
    pub fn request_stop(&self) {
        if let Some(session) = self.lock_session().as_ref() {
            session.cancel.cancel();
        }
    }

    /// Wait until the current session ends on its own or is stopped
    ///
    /// Returns after the termination hook has run.
    pub async fn wait(&self) {
        let exited = self.lock_session().as_ref().map(|s| s.exited.clone());
        if let Some(exited) = exited {
            exited.cancelled().await;
        }
    }

    /// Whether a session is active
    pub fn is_running(&self) -> bool {
        self.lock_session()
            .as_ref()
            .is_some_and(RunningSession::is_active)
    }

    /// Diagnostics snapshot
    pub fn status(&self) -> TrackerStatus {
        self.status.borrow().clone()
    }

    /// Last acknowledged sequence
    pub fn last_sequence(&self) -> Option<Sequence> {
        self.status.borrow().last_sequence.clone()
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<TrackerStatus> {
        self.status.subscribe()
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<RunningSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ChangeTracker {
    fn drop(&mut self) {
        if let Some(session) = self.lock_session().take() {
            session.cancel.cancel();
        }
    }
}
