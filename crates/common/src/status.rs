//! Worker status snapshots.

use serde::{Deserialize, Serialize};

/// Snapshot of one mirror's sandbox pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorStatus {
    /// Exported root this mirror serves.
    pub root: String,
    /// Maximum number of sandboxes in use at once.
    pub granted: usize,
    /// Task labels of the sandboxes currently in use.
    pub running: Vec<String>,
    pub idle_fses: usize,
    pub waiting_tasks: usize,
    pub shutting_down: bool,
}

/// Snapshot of a worker and all its mirrors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub mirrors: Vec<MirrorStatus>,
    pub version: String,
    pub max_job_count: usize,
    pub shutting_down: bool,
}

impl WorkerStatus {
    /// Tasks running across every mirror.
    pub fn running_count(&self) -> usize {
        self.mirrors.iter().map(|m| m.running.len()).sum()
    }
}
