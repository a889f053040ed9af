//! Checkpoint storage strategies
//!
//! Persists the last acknowledged sequence so a later session can resume
//! with `since`. Sequences are stored as JSON, so opaque tokens round-trip
//! untouched.

use async_trait::async_trait;
use changes_core::prelude::*;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Checkpoint storage trait (Strategy pattern)
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the last checkpoint; `None` when nothing was saved yet
    async fn load(&self) -> Result<Option<Sequence>>;

    /// Save checkpoint
    async fn save(&self, sequence: &Sequence) -> Result<()>;

    /// Get store name
    fn name(&self) -> &'static str;
}

// ============================================================================
// File-based Checkpoint
// ============================================================================

/// File-based checkpoint storage
pub struct FileCheckpoint {
    path: PathBuf,
    cached: RwLock<Option<Sequence>>,
}

impl FileCheckpoint {
    /// Create new file checkpoint
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: RwLock::new(None),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpoint {
    async fn load(&self) -> Result<Option<Sequence>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => {
                let seq: Sequence = serde_json::from_str(content.trim()).map_err(|e| {
                    TrackerError::checkpoint_with_source(
                        format!("Failed to parse checkpoint {}", self.path.display()),
                        e,
                    )
                })?;
                info!(checkpoint = %seq, path = ?self.path, "Loaded checkpoint");
                *self.cached.write().await = Some(seq.clone());
                Ok(Some(seq))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = ?self.path, "No checkpoint file, starting from the beginning");
                Ok(None)
            }
            Err(e) => Err(TrackerError::checkpoint_with_source("Failed to read checkpoint", e)),
        }
    }

    async fn save(&self, sequence: &Sequence) -> Result<()> {
        // Only write if changed
        if self.cached.read().await.as_ref() == Some(sequence) {
            return Ok(());
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                TrackerError::checkpoint_with_source("Failed to create checkpoint directory", e)
            })?;
        }

        // Write atomically via temp file
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, serde_json::to_string(sequence)?)
            .await
            .map_err(|e| TrackerError::checkpoint_with_source("Failed to write checkpoint", e))?;

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| TrackerError::checkpoint_with_source("Failed to rename checkpoint", e))?;

        *self.cached.write().await = Some(sequence.clone());
        debug!(checkpoint = %sequence, "Saved checkpoint");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file_checkpoint"
    }
}

// ============================================================================
// Memory Checkpoint (for testing)
// ============================================================================

/// In-memory checkpoint storage
#[derive(Default)]
pub struct MemoryCheckpoint {
    sequence: RwLock<Option<Sequence>>,
}

impl MemoryCheckpoint {
    /// Create new memory checkpoint
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoint {
    async fn load(&self) -> Result<Option<Sequence>> {
        Ok(self.sequence.read().await.clone())
    }

    async fn save(&self, sequence: &Sequence) -> Result<()> {
        *self.sequence.write().await = Some(sequence.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory_checkpoint"
    }
}
