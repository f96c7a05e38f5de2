//! Registry snapshot persistence
//!
//! Task metadata is periodically serialised to a JSON file so terminal-state
//! results survive a restart. Session buffers are memory-only and are never
//! persisted.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{CancelToken, Task};
use crate::router::TaskRouter;

/// Error types for snapshot operations
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// On-disk snapshot shape
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
}

const SNAPSHOT_VERSION: u32 = 1;

/// Writes and reads registry snapshots
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the given tasks
    ///
    /// Write-then-rename so a crash mid-write never corrupts the previous
    /// snapshot.
    pub async fn save(&self, tasks: Vec<Task>) -> Result<(), SnapshotError> {
        debug!(count = tasks.len(), path = %self.path.display(), "SnapshotStore::save: called");

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            tasks,
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        Ok(())
    }

    /// Load the snapshot, or an empty list when none exists
    pub async fn load(&self) -> Result<Vec<Task>, SnapshotError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "SnapshotStore::load: no snapshot found");
            return Ok(Vec::new());
        }

        let content = tokio::fs::read(&self.path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&content)?;

        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                found = snapshot.version,
                expected = SNAPSHOT_VERSION,
                "Snapshot version mismatch, ignoring"
            );
            return Ok(Vec::new());
        }

        info!(count = snapshot.tasks.len(), "Loaded registry snapshot");
        Ok(snapshot.tasks)
    }
}

/// Periodically snapshot the router's task table until cancelled
///
/// One final snapshot is written on the way out so shutdown never loses
/// terminal results.
pub async fn snapshot_loop(store: SnapshotStore, router: TaskRouter, interval_secs: u64, cancel: CancelToken) {
    let interval = std::time::Duration::from_secs(interval_secs.max(1));

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }
        if let Err(e) = store.save(router.list_tasks().await).await {
            warn!(error = %e, "Snapshot write failed");
        }
    }

    if let Err(e) = store.save(router.list_tasks().await).await {
        warn!(error = %e, "Final snapshot write failed");
    } else {
        info!("Final registry snapshot written");
    }
}
