/// Configuration shared by the toolkit's clients.
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default lock acquisition timeout, in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECS: f64 = 5.0;

/// Tunables for the scan workers that use the toolkit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a ranked lock waits before giving up, in (fractional)
    /// seconds.
    pub lock_timeout_secs: f64,

    /// Number of worker threads sharing the toolkit's primitives.
    ///
    /// Also the number of processes a worker-slot allocator is sized for.
    pub worker_threads: usize,

    /// Verbose diagnostics (debug-level logging, coherence instrumentation).
    pub detailed: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            worker_threads: num_cpus::get().max(1),
            detailed: false,
        }
    }
}

impl SyncConfig {
    /// Create a config with a custom lock timeout.
    pub fn with_lock_timeout_secs(lock_timeout_secs: f64) -> Self {
        Self {
            lock_timeout_secs,
            ..Default::default()
        }
    }

    /// Create a config with a custom worker count.
    pub fn with_worker_threads(worker_threads: usize) -> Self {
        Self {
            worker_threads,
            ..Default::default()
        }
    }

    /// The lock timeout as a `Duration`, rejecting zero, negative and
    /// non-finite values.
    pub fn lock_timeout(&self) -> Result<Duration> {
        let secs = self.lock_timeout_secs;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(SyncError::InvalidConfig {
                reason: format!("lock_timeout_secs must be a positive number, got {secs}"),
            });
        }
        Duration::try_from_secs_f64(secs).map_err(|e| SyncError::InvalidConfig {
            reason: format!("lock_timeout_secs {secs}: {e}"),
        })
    }

    /// Check every field.
    pub fn validate(&self) -> Result<()> {
        self.lock_timeout()?;
        if self.worker_threads == 0 {
            return Err(SyncError::InvalidConfig {
                reason: "worker_threads must be at least 1".into(),
            });
        }
        Ok(())
    }
}
