//! # Changes Core
//!
//! Core types, configuration and collaborator traits for the change tracker.
//!
//! This crate defines what the tracker exchanges with the outside world:
//! - Configuration for one tracking session
//! - The opaque `Sequence` and the `ChangeRecord` delivered to consumers
//! - The error taxonomy shared by every component
//! - Transport and consumer traits
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌───────────────┐     ┌───────────────┐
//! │ ChangesTransport │────►│ ChangeTracker │────►│ ChangeHandler │
//! │    Strategy      │     │ state machine │     │   (consumer)  │
//! └──────────────────┘     └───────┬───────┘     └───────────────┘
//!                                  │
//!                          ┌───────┴───────┐
//!                          │ FinishHandler │
//!                          └───────────────┘
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod strategy;

pub use self::config::*;
pub use error::*;
pub use message::*;
pub use metrics::*;
pub use strategy::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{FeedMode, TrackerConfig};
    pub use crate::error::{Result, TrackerError};
    pub use crate::message::{ChangeRecord, FeedItem, Sequence};
    pub use crate::strategy::{
        ChangeHandler, ChangesTransport, FeedRequest, FeedResponse, FinishHandler,
    };
}
