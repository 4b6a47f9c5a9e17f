/// Ranked locks — reentrant mutual exclusion with bounded waits.
///
/// Every [`RankedLock`] carries a rank from one program-wide total order.
/// Code that needs several locks at once goes through [`LockSet`], which
/// always acquires in ascending rank and releases in descending rank, so no
/// circular wait can form regardless of thread timing.
///
/// # Ownership model
///
/// The lock is reentrant: the owning thread may acquire it again without
/// blocking on itself and must release it the same number of times. Only
/// the owning thread may release. Releasing from any other thread is logged
/// as misuse and otherwise ignored.
///
/// Two styles are supported:
/// - explicit [`RankedLock::acquire`] / [`RankedLock::release`] pairs, where
///   a timeout is reported as `false`;
/// - scoped [`RankedLock::lock`], returning a [`RankedGuard`] that releases
///   on every exit path and reporting a timeout as
///   [`SyncError::LockTimeout`].
pub mod ordered;

pub use ordered::{ordered_acquire, ordered_release, LockSet, LockSetGuard};

use crate::error::{Result, SyncError};
use compact_str::CompactString;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Diagnostic counters for one lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStats {
    /// Successful acquisitions, reentrant ones included.
    pub acquisitions: u64,
    /// Blocking acquisitions that gave up after the timeout.
    pub timeouts: u64,
    /// Releases attempted by a thread that did not hold the lock.
    pub misuses: u64,
}

/// Current owner and reentrancy depth.
#[derive(Debug, Default)]
struct Holder {
    owner: Option<ThreadId>,
    depth: usize,
}

impl Holder {
    /// Take (or re-enter) the lock for `me` if nobody else owns it.
    fn try_take(&mut self, me: ThreadId) -> bool {
        match self.owner {
            None => {
                self.owner = Some(me);
                self.depth = 1;
                true
            }
            Some(owner) if owner == me => {
                self.depth += 1;
                true
            }
            Some(_) => false,
        }
    }
}

/// A reentrant mutex with a rank and an acquisition timeout.
///
/// One instance per protected structure, created once and reused for the
/// life of the process.
#[derive(Debug)]
pub struct RankedLock {
    name: CompactString,
    rank: i64,
    timeout: Mutex<Duration>,
    holder: Mutex<Holder>,
    released: Condvar,
    acquisitions: AtomicU64,
    timeouts: AtomicU64,
    misuses: AtomicU64,
}

impl RankedLock {
    /// Create a lock. The name must be non-empty and the timeout non-zero.
    pub fn new(name: &str, rank: i64, timeout: Duration) -> Result<Self> {
        if name.is_empty() {
            return Err(SyncError::InvalidLock {
                reason: "name must not be empty".into(),
            });
        }
        if timeout.is_zero() {
            return Err(SyncError::InvalidLock {
                reason: format!("lock '{name}' needs a positive timeout"),
            });
        }

        Ok(Self {
            name: CompactString::new(name),
            rank,
            timeout: Mutex::new(timeout),
            holder: Mutex::new(Holder::default()),
            released: Condvar::new(),
            acquisitions: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            misuses: AtomicU64::new(0),
        })
    }

    /// Create a lock whose timeout is given in (fractional) seconds.
    pub fn from_secs(name: &str, rank: i64, timeout_secs: f64) -> Result<Self> {
        if !timeout_secs.is_finite() || timeout_secs <= 0.0 {
            return Err(SyncError::InvalidLock {
                reason: format!(
                    "lock '{name}' timeout must be a positive number, got {timeout_secs}"
                ),
            });
        }
        let timeout =
            Duration::try_from_secs_f64(timeout_secs).map_err(|e| SyncError::InvalidLock {
                reason: format!("lock '{name}' timeout {timeout_secs}s: {e}"),
            })?;
        Self::new(name, rank, timeout)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rank(&self) -> i64 {
        self.rank
    }

    /// Timeout applied to blocking acquisitions.
    pub fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    /// Acquire the lock.
    ///
    /// With `blocking == false` this is a single non-waiting attempt and the
    /// timeout is not consulted. Otherwise waits up to the lock's timeout,
    /// or `timeout_override` if given; an override also replaces the stored
    /// timeout for later calls. Returns whether the lock is now held.
    pub fn acquire(&self, blocking: bool, timeout_override: Option<Duration>) -> bool {
        let me = thread::current().id();

        if !blocking {
            let taken = self.holder.lock().try_take(me);
            if taken {
                self.acquisitions.fetch_add(1, Ordering::Relaxed);
            }
            return taken;
        }

        let timeout = match timeout_override {
            Some(t) => {
                *self.timeout.lock() = t;
                t
            }
            None => self.timeout(),
        };

        // A deadline past the end of `Instant` means wait indefinitely.
        let deadline = Instant::now().checked_add(timeout);

        let mut holder = self.holder.lock();
        loop {
            if holder.try_take(me) {
                self.acquisitions.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            let timed_out = match deadline {
                Some(deadline) => self.released.wait_until(&mut holder, deadline).timed_out(),
                None => {
                    self.released.wait(&mut holder);
                    false
                }
            };
            if timed_out {
                // Last chance: the release may have raced the deadline.
                if holder.try_take(me) {
                    self.acquisitions.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                drop(holder);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    lock = %self.name,
                    rank = self.rank,
                    ?timeout,
                    "timed out acquiring ranked lock"
                );
                return false;
            }
        }
    }

    /// Release one level of holding.
    ///
    /// A release by a thread that does not own the lock is reported and
    /// ignored.
    pub fn release(&self) {
        let me = thread::current().id();
        let mut holder = self.holder.lock();

        if holder.owner != Some(me) {
            drop(holder);
            self.misuses.fetch_add(1, Ordering::Relaxed);
            error!(
                lock = %self.name,
                rank = self.rank,
                "release of ranked lock not held by the current thread"
            );
            return;
        }

        holder.depth -= 1;
        if holder.depth == 0 {
            holder.owner = None;
            drop(holder);
            self.released.notify_one();
        }
    }

    /// Scoped acquisition: waits up to the timeout and returns a guard that
    /// releases on drop.
    pub fn lock(&self) -> Result<RankedGuard<'_>> {
        if self.acquire(true, None) {
            Ok(RankedGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            Err(self.timeout_error())
        }
    }

    /// True if the calling thread owns the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.holder.lock().owner == Some(thread::current().id())
    }

    /// Reentrancy depth of the calling thread (0 if it does not own the lock).
    pub fn hold_depth(&self) -> usize {
        let holder = self.holder.lock();
        if holder.owner == Some(thread::current().id()) {
            holder.depth
        } else {
            0
        }
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            misuses: self.misuses.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn timeout_error(&self) -> SyncError {
        SyncError::LockTimeout {
            name: self.name.to_string(),
            rank: self.rank,
            timeout: self.timeout(),
        }
    }
}

/// Holds one level of a [`RankedLock`]; releases it when dropped.
///
/// Not `Send`: the release must happen on the acquiring thread.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RankedGuard<'a> {
    lock: &'a RankedLock,
    _not_send: PhantomData<*const ()>,
}

impl RankedGuard<'_> {
    pub fn lock(&self) -> &RankedLock {
        self.lock
    }
}

impl Drop for RankedGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
