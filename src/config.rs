//! Start-up parameters for a [`Memory`](crate::Memory) instance.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};

/// Configuration for the store, the emission pool and the permission layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Directory holding the saved snapshot. `None` keeps the graph in memory only.
    pub repo_path: Option<PathBuf>,
    /// Ignore any snapshot found at start-up.
    pub clear: bool,
    /// Ceiling on the number of segments.
    pub max_segments: u16,
    /// Slots per segment.
    pub segment_capacity: u16,
    /// Requested number of event workers.
    pub max_event_threads: usize,
    /// Clamp the worker count to the available hardware threads.
    pub limit_threads_by_cores: bool,
    /// Enforce context permissions. When false every context acts as a system context.
    pub user_mode: bool,
    /// Attempts made by try-lock before giving up.
    pub try_lock_attempts: u32,
    /// Link contents larger than this are stored but not indexed for lookup.
    pub max_searchable_content: usize,
    /// Threads applying committed transactions.
    pub transaction_threads: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            repo_path: None,
            clear: false,
            max_segments: 1024,
            segment_capacity: u16::MAX,
            max_event_threads: 8,
            limit_threads_by_cores: true,
            user_mode: false,
            try_lock_attempts: 16,
            max_searchable_content: 64 * 1024,
            transaction_threads: 2,
        }
    }
}

impl MemoryConfig {
    /// Loads a configuration from a JSON file. Missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> GraphResult<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| GraphError::invalid_params(format!("config parse failed: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the value ranges.
    pub fn validate(&self) -> GraphResult<()> {
        if self.max_segments == 0 {
            return Err(GraphError::invalid_params("max_segments must be at least 1"));
        }
        if self.segment_capacity < 2 {
            return Err(GraphError::invalid_params("segment_capacity must be at least 2"));
        }
        if self.try_lock_attempts == 0 {
            return Err(GraphError::invalid_params("try_lock_attempts must be at least 1"));
        }
        if self.transaction_threads == 0 {
            return Err(GraphError::invalid_params("transaction_threads must be at least 1"));
        }
        Ok(())
    }

    /// Number of event workers to start.
    #[must_use]
    pub fn event_workers(&self) -> usize {
        let requested = self.max_event_threads.max(1);
        if !self.limit_threads_by_cores {
            return requested;
        }
        let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        requested.clamp(1, cores)
    }

    /// Path of the snapshot file, if persistence is enabled.
    #[must_use]
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.repo_path.as_ref().map(|dir| dir.join("graph.snapshot"))
    }
}
