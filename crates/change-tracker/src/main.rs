//! Change Tracker CLI
//!
//! Follows a database's `_changes` feed and prints each change as a JSON line.

use change_tracker::{build_transport, record_stream, ChangeTracker, CheckpointStore, FileCheckpoint};
use changes_core::prelude::*;
use changes_core::{CredentialsConfig, ErrorContext, ErrorContextExt, FilterConfig};
use clap::Parser;
use futures::StreamExt;
use std::io::Write;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "change-tracker")]
#[command(about = "Follow a database change feed and print changes as JSON lines")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "CHANGE_TRACKER_CONFIG")]
    config: Option<String>,

    /// Database URL, e.g. http://localhost:5984/mydb
    #[arg(long, env = "CHANGE_TRACKER_URL")]
    url: Option<Url>,

    /// Feed mode: oneshot, longpoll or continuous
    #[arg(long, value_parser = parse_mode)]
    mode: Option<FeedMode>,

    /// Start after this sequence (JSON or bare string)
    #[arg(long)]
    since: Option<String>,

    /// Server-side filter function
    #[arg(long, conflicts_with = "doc_ids")]
    filter: Option<String>,

    /// Only follow these document ids (comma-separated)
    #[arg(long, value_delimiter = ',')]
    doc_ids: Option<Vec<String>>,

    /// Embed document bodies
    #[arg(long)]
    include_docs: bool,

    /// Heartbeat interval, e.g. 30s
    #[arg(long, value_parser = humantime::parse_duration)]
    heartbeat: Option<Duration>,

    /// Basic auth user
    #[arg(long, env = "CHANGE_TRACKER_USERNAME", requires = "password")]
    username: Option<String>,

    /// Basic auth password
    #[arg(long, env = "CHANGE_TRACKER_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Bearer token
    #[arg(long, env = "CHANGE_TRACKER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Resume from and save progress to this file
    #[arg(long, env = "CHANGE_TRACKER_CHECKPOINT")]
    checkpoint: Option<String>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: json or pretty
    #[arg(long, env = "LOG_FORMAT")]
    log_format: Option<String>,
}

fn parse_mode(raw: &str) -> std::result::Result<FeedMode, String> {
    match raw.to_ascii_lowercase().as_str() {
        "oneshot" | "normal" => Ok(FeedMode::OneShot),
        "longpoll" => Ok(FeedMode::LongPoll),
        "continuous" => Ok(FeedMode::Continuous),
        other => Err(format!("unknown feed mode '{}'", other)),
    }
}

impl Args {
    /// Layer command line flags over file/env configuration
    fn apply(&self, config: &mut TrackerConfig) {
        if let Some(url) = &self.url {
            config.database_url = url.clone();
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(since) = &self.since {
            config.since = Some(Sequence::parse(since));
        }
        if let Some(name) = &self.filter {
            config.filter = FilterConfig::named(name);
        }
        if let Some(ids) = &self.doc_ids {
            config.filter = FilterConfig::doc_ids(ids.iter().cloned());
        }
        if self.include_docs {
            config.include_docs = true;
        }
        if let Some(heartbeat) = self.heartbeat {
            config.heartbeat = heartbeat;
        }
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            config.credentials = CredentialsConfig {
                token: config.credentials.token.clone(),
                ..CredentialsConfig::basic(user, pass)
            };
        }
        if let Some(token) = &self.token {
            config.credentials.token = Some(token.clone());
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.observability.log_format = format.clone();
        }
    }
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    // Logs go to stderr; stdout carries the change lines
    if format.eq_ignore_ascii_case("pretty") {
        registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TrackerConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    init_tracing(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %config.database_url,
        mode = %config.mode,
        "Starting change-tracker"
    );

    // Resume from checkpoint unless --since was given
    let checkpoint = args.checkpoint.as_ref().map(FileCheckpoint::new);
    if let (Some(store), None) = (&checkpoint, &args.since) {
        if let Some(seq) = store.load().await? {
            config.since = Some(seq);
        }
    }

    let transport = build_transport(&config.transport)?;
    let (tracker, events) = ChangeTracker::with_channel(transport);
    let mut records = Box::pin(record_stream(events));

    let context = ErrorContext::new("change-tracker", "save_checkpoint")
        .with_database(config.database_url.as_str());
    tracker.start(config)?;

    let mut stopping = false;
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !stopping => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Shutdown requested");
                stopping = true;
                tracker.request_stop();
            }
            next = records.next() => match next {
                Some(Ok(record)) => {
                    serde_json::to_writer(&mut stdout, &record)?;
                    writeln!(stdout)?;
                    if let Some(store) = &checkpoint {
                        store
                            .save(&record.sequence)
                            .await
                            .with_context(context.clone().with_sequence(record.sequence.to_string()))?;
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "Change tracker failed");
                    return Err(e.into());
                }
                None => break,
            },
        }
    }

    // A final last_seq marker may have moved past the last record
    if let (Some(store), Some(seq)) = (&checkpoint, tracker.last_sequence()) {
        store.save(&seq).await?;
    }

    let status = tracker.status();
    info!(
        delivered = status.delivered,
        last_seq = ?status.last_sequence.map(|s| s.to_query_value()),
        "Change tracker stopped gracefully"
    );
    Ok(())
}
