//! Supervisor configuration and spawn options.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::queue::{OverflowPolicy, DEFAULT_QUEUE_CAPACITY};

/// Configuration for a [`Supervisor`](crate::supervisor::Supervisor).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Explicit worker binary path; skips discovery when set.
    pub worker_binary: Option<PathBuf>,
    /// Capacity of the pre-ready message queue.
    pub queue_capacity: usize,
    /// Overflow behavior of the pre-ready queue.
    pub overflow_policy: OverflowPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_binary: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

/// Options passed through unmodified to the worker process spawn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnOptions {
    /// Working directory for the worker.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables for the worker.
    pub envs: Vec<(String, String)>,
}
