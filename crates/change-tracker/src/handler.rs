//! Channel-backed consumer
//!
//! Bridges the tracker's hooks onto an mpsc channel so a consumer can read
//! records and the termination outcome from one place.

use async_trait::async_trait;
use changes_core::prelude::*;
use futures::Stream;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// What the tracker reported
#[derive(Debug)]
pub enum TrackerEvent {
    Change(ChangeRecord),
    /// Always the last event of a session
    Finished(Option<TrackerError>),
}

/// Forwards both hooks to an unbounded channel
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<TrackerEvent>,
}

impl ChannelHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TrackerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl ChangeHandler for ChannelHandler {
    async fn on_change(&self, record: ChangeRecord) -> Result<()> {
        self.tx
            .send(TrackerEvent::Change(record))
            .map_err(|_| TrackerError::delivery("event receiver dropped"))
    }
}

impl FinishHandler for ChannelHandler {
    fn on_finished(&self, error: Option<TrackerError>) {
        if self.tx.send(TrackerEvent::Finished(error)).is_err() {
            debug!("Event receiver dropped before session finished");
        }
    }
}

/// Records as a stream
///
/// Ends after the session's `Finished` event, yielding its error last.
pub fn record_stream(
    mut events: mpsc::UnboundedReceiver<TrackerEvent>,
) -> impl Stream<Item = Result<ChangeRecord>> {
    async_stream::stream! {
        while let Some(event) = events.recv().await {
            match event {
                TrackerEvent::Change(record) => yield Ok(record),
                TrackerEvent::Finished(Some(error)) => {
                    yield Err(error);
                    break;
                }
                TrackerEvent::Finished(None) => break,
            }
        }
    }
}
