/// DirGuard Core — concurrency-safety toolkit for the scanner's workers.
///
/// This crate performs no I/O. Scan workers, monitor callbacks and cleanup
/// routines call into it around their own critical sections.
///
/// # Modules
///
/// - [`allocator`] — Banker's-algorithm resource allocator (deadlock avoidance).
/// - [`lock`] — Timeout-capable reentrant locks tagged with a global rank,
///   plus the ordered multi-lock protocol.
/// - [`coherence`] — Per-variable sharing-state tracker that flags
///   unsynchronized writes.
/// - [`config`] — Tunables shared by the toolkit's clients.
/// - [`error`] — The crate-wide error type.
pub mod allocator;
pub mod coherence;
pub mod config;
pub mod error;
pub mod lock;

pub use allocator::{AllocatorSnapshot, ResourceAllocator};
pub use coherence::{AccessorId, CoherenceState, CoherenceTracker, VariableReport};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use lock::{
    ordered_acquire, ordered_release, LockSet, LockSetGuard, LockStats, RankedGuard, RankedLock,
};
