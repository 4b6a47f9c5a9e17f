/// Error type shared by every toolkit component.
///
/// Capacity and safety outcomes of the allocator are *not* errors: they are
/// returned as plain `bool` so callers can back off and retry. Only invalid
/// construction, lock timeouts on the scoped/ordered paths, and detected
/// data races surface here.
use crate::coherence::{AccessorId, CoherenceState};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// A `RankedLock` could not be built from the given parameters.
    #[error("invalid ranked lock: {reason}")]
    InvalidLock { reason: String },

    /// A `ResourceAllocator` could not be built from the given matrices.
    #[error("invalid resource allocator: {reason}")]
    InvalidAllocator { reason: String },

    /// A configuration value is out of range.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Acquisition did not complete within the lock's timeout.
    #[error("timed out after {timeout:?} acquiring lock '{name}' (rank {rank})")]
    LockTimeout {
        name: String,
        rank: i64,
        timeout: Duration,
    },

    /// A write was observed under an access pattern that indicates
    /// unsynchronized concurrent modification.
    #[error("data race on '{variable}': write by {accessor} moved it to {state}")]
    DataRace {
        variable: String,
        accessor: AccessorId,
        state: CoherenceState,
    },

    /// `read`/`write` was called on a name that was never registered.
    #[error("variable '{variable}' is not registered")]
    UnregisteredVariable { variable: String },
}

impl SyncError {
    /// True for the locking-timeout condition raised by scoped and ordered
    /// acquisition.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// True for a race-condition fault raised by the coherence tracker.
    pub fn is_data_race(&self) -> bool {
        matches!(self, Self::DataRace { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_message_names_lock_and_rank() {
        let err = SyncError::LockTimeout {
            name: "totals".into(),
            rank: 3,
            timeout: Duration::from_millis(250),
        };
        let msg = err.to_string();
        assert!(msg.contains("'totals'"));
        assert!(msg.contains("rank 3"));
        assert!(err.is_lock_timeout());
        assert!(!err.is_data_race());
    }

    #[test]
    fn test_data_race_message() {
        let err = SyncError::DataRace {
            variable: "file_count".into(),
            accessor: AccessorId::new(7),
            state: CoherenceState::SharedModified,
        };
        assert_eq!(
            err.to_string(),
            "data race on 'file_count': write by accessor#7 moved it to Shared-Modified"
        );
        assert!(err.is_data_race());
    }
}
