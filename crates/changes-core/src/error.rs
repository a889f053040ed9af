//! Error types for the change tracker
//!
//! Uses `thiserror` for ergonomic error handling with full context preservation.

use std::fmt;
use thiserror::Error;

/// Result type alias for tracker operations
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Primary error type for all tracker operations
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Connection refused, reset, or broken body stream
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Non-success HTTP status that is not an authentication challenge
    #[error("HTTP status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// No activity from the server within the allowed window
    #[error("Timeout: {operation} exceeded {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Malformed top-level body or streaming segment
    #[error("Framing error: {message}")]
    Framing {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Framed value that is not a valid change entry
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Challenge rejected twice, or no usable credential
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// Retry limit exceeded
    #[error("Retries exhausted after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    /// `start` called on a tracker that is already running
    #[error("Change tracker is already running")]
    AlreadyRunning,

    /// Consumer refused a delivered record
    #[error("Delivery error: {message}")]
    Delivery {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Checkpoint/resume errors
    #[error("Checkpoint error: {message}")]
    Checkpoint {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Message serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TrackerError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with source
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a framing error
    pub fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
            source: None,
        }
    }

    /// Create a framing error with source
    pub fn framing_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Framing {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create an authentication failure
    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            message: message.into(),
        }
    }

    /// Create a delivery error
    pub fn delivery(message: impl Into<String>) -> Self {
        Self::Delivery {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a checkpoint error with source
    pub fn checkpoint_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Check if a fresh connection attempt may recover from this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::HttpStatus { .. }
                | Self::Timeout { .. }
                | Self::Framing { .. }
        )
    }

    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::HttpStatus { .. } => "http_status",
            Self::Timeout { .. } => "timeout",
            Self::Framing { .. } => "framing",
            Self::Decode { .. } => "decode",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::AlreadyRunning => "already_running",
            Self::Delivery { .. } => "delivery",
            Self::Configuration { .. } => "configuration",
            Self::Checkpoint { .. } => "checkpoint",
            Self::Serialization(_) => "serialization",
        }
    }
}

/// Error context for enhanced debugging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: &'static str,
    pub operation: String,
    pub database: Option<String>,
    pub document_id: Option<String>,
    pub sequence: Option<String>,
}

impl ErrorContext {
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        Self {
            component,
            operation: operation.into(),
            database: None,
            document_id: None,
            sequence: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn with_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.sequence = Some(sequence.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}]", self.component, self.operation)?;
        if let Some(ref db) = self.database {
            write!(f, " db={}", db)?;
        }
        if let Some(ref id) = self.document_id {
            write!(f, " doc={}", id)?;
        }
        if let Some(ref seq) = self.sequence {
            write!(f, " seq={}", seq)?;
        }
        Ok(())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContextExt<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T>;
}

impl<T> ErrorContextExt<T> for Result<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| {
            tracing::error!(
                error = %e,
                component = ctx.component,
                operation = %ctx.operation,
                database = ?ctx.database,
                document_id = ?ctx.document_id,
                sequence = ?ctx.sequence,
                "Operation failed"
            );
            e
        })
    }
}
