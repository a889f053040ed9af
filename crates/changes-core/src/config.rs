//! Configuration types for the change tracker
//!
//! Uses the `config` crate for layered configuration from files and environment.

use crate::error::{Result, TrackerError};
use crate::message::Sequence;
use http::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use url::Url;

/// How the server is asked to deliver the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    /// Single request, finishes after the first complete response
    #[serde(alias = "normal")]
    OneShot,
    /// Server holds the request until a change exists, then closes it
    #[default]
    LongPoll,
    /// Server keeps the connection open and streams one object per line
    Continuous,
}

impl FeedMode {
    /// Value of the `feed` query parameter
    pub fn as_query_value(&self) -> &'static str {
        match self {
            Self::OneShot => "normal",
            Self::LongPoll => "longpoll",
            Self::Continuous => "continuous",
        }
    }

    /// Whether the body arrives as one JSON document
    pub fn is_whole_document(&self) -> bool {
        !matches!(self, Self::Continuous)
    }
}

impl fmt::Display for FeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OneShot => "oneshot",
            Self::LongPoll => "longpoll",
            Self::Continuous => "continuous",
        };
        f.write_str(name)
    }
}

/// Root configuration for one tracking session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Label of the owning database or replication, used in logs and metrics
    #[serde(default = "default_name")]
    pub name: String,

    /// Remote database URL; the feed lives at `{database_url}/_changes`
    #[serde(default = "default_database_url")]
    pub database_url: Url,

    /// Feed mode
    #[serde(default)]
    pub mode: FeedMode,

    /// Position to resume from; absent means from the beginning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<Sequence>,

    /// Server-side filtering
    #[serde(default)]
    pub filter: FilterConfig,

    /// Ask for all conflicting leaf revisions (`style=all_docs`)
    #[serde(default)]
    pub include_conflicts: bool,

    /// Ask for document bodies (`include_docs=true`)
    #[serde(default)]
    pub include_docs: bool,

    /// Maximum number of changes per response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Heartbeat interval requested from the server; zero disables it
    #[serde(with = "humantime_serde", default = "default_heartbeat")]
    pub heartbeat: Duration,

    /// Credentials used to answer authentication challenges
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Extra headers sent with every request
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,

    /// Reconnect policy
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Transport selection
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_database_url() -> Url {
    Url::parse("http://localhost:5984/db").expect("static URL is valid")
}

fn default_heartbeat() -> Duration {
    Duration::from_secs(300)
}

fn default_true() -> bool {
    true
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            database_url: default_database_url(),
            mode: FeedMode::default(),
            since: None,
            filter: FilterConfig::default(),
            include_conflicts: false,
            include_docs: false,
            limit: None,
            heartbeat: default_heartbeat(),
            credentials: CredentialsConfig::default(),
            request_headers: BTreeMap::new(),
            backoff: BackoffConfig::default(),
            transport: TransportConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

// ============================================================================
// Filter Configuration
// ============================================================================

/// Server-side filter selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Named filter function, e.g. `design/by_owner`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Parameters passed to the named filter as query parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,

    /// Restrict the feed to these document IDs (`filter=_doc_ids`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_ids: Option<Vec<String>>,
}

impl FilterConfig {
    /// Filter on a named server-side function
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Filter on an explicit document ID set
    pub fn doc_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            doc_ids: Some(ids.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Builder: add a filter parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Credentials for answering authentication challenges
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Username for `Basic`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password for `Basic`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Token for `Bearer`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl CredentialsConfig {
    /// Username/password pair
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            token: None,
        }
    }

    /// Bearer token
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Default::default()
        }
    }
}

impl fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ============================================================================
// Backoff Configuration
// ============================================================================

/// Reconnect backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Ceiling for the retry delay
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Growth factor per consecutive failure
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Consecutive failures tolerated before giving up; absent means forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// An attempt that stays up this long counts as healthy
    #[serde(with = "humantime_serde", default = "default_healthy_after")]
    pub healthy_after: Duration,
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(600)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_healthy_after() -> Duration {
    Duration::from_secs(60)
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            max_retries: None,
            healthy_after: default_healthy_after(),
        }
    }
}

// ============================================================================
// Transport Configuration
// ============================================================================

/// Which byte-stream implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// reqwest-backed HTTP client
    #[default]
    Http,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Implementation
    #[serde(default)]
    pub kind: TransportKind,

    /// Connection timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// User-Agent header
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Verify TLS certificates
    #[serde(default = "default_true")]
    pub verify_certs: bool,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_user_agent() -> String {
    format!("change-tracker/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            connect_timeout: default_connect_timeout(),
            user_agent: default_user_agent(),
            verify_certs: true,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl TrackerConfig {
    /// Create a configuration for a database URL with defaults elsewhere
    pub fn for_database(database_url: Url) -> Self {
        Self {
            database_url,
            ..Default::default()
        }
    }

    /// Load configuration from file and environment
    pub fn load(path: Option<&str>) -> std::result::Result<Self, ::config::ConfigError> {
        let mut builder = ::config::Config::builder();

        // Add default values
        builder = builder.add_source(::config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }

        // Environment variables with prefix CHANGE_TRACKER__
        builder = builder.add_source(
            ::config::Environment::with_prefix("CHANGE_TRACKER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Reject combinations the tracker cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.database_url.cannot_be_a_base() {
            return Err(TrackerError::config(format!(
                "database_url {} cannot be used as a base URL",
                self.database_url
            )));
        }

        if self.filter.name.is_some() && self.filter.doc_ids.is_some() {
            return Err(TrackerError::config(
                "filter.name and filter.doc_ids are mutually exclusive",
            ));
        }

        if self.filter.name.as_deref() == Some("") {
            return Err(TrackerError::config("filter.name must not be empty"));
        }

        if self.credentials.username.is_some() != self.credentials.password.is_some() {
            return Err(TrackerError::config(
                "credentials.username and credentials.password must be given together",
            ));
        }

        let backoff = &self.backoff;
        if !(backoff.multiplier >= 1.0) {
            return Err(TrackerError::config("backoff.multiplier must be >= 1.0"));
        }
        if backoff.initial_delay > backoff.max_delay {
            return Err(TrackerError::config(
                "backoff.initial_delay must not exceed backoff.max_delay",
            ));
        }

        if self.limit == Some(0) {
            return Err(TrackerError::config("limit must be positive"));
        }

        for (name, value) in &self.request_headers {
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TrackerError::config(format!("request_headers: invalid name {name:?}: {e}"))
            })?;
            HeaderValue::from_str(value).map_err(|e| {
                TrackerError::config(format!("request_headers: invalid value for {name}: {e}"))
            })?;
        }

        Ok(())
    }

    /// Longest silence tolerated from the server before reconnecting
    ///
    /// Twice the heartbeat, and only for modes where the server sends one.
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.mode == FeedMode::OneShot || self.heartbeat.is_zero() {
            return None;
        }
        Some(self.heartbeat.saturating_mul(2))
    }
}
