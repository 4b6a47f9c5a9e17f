/// Ordered multi-lock protocol.
///
/// A [`LockSet`] is the only sanctioned way to hold several ranked locks at
/// once. It stores its locks sorted ascending by rank, acquires them in
/// that order and releases them in the mirror order, so the call-site
/// argument order never matters. Equal ranks keep the caller's order.
///
/// Acquisition is all-or-nothing: if any lock times out, every lock already
/// taken by this call is released (most recent first) before the timeout is
/// reported, and the locks ranked above the failing one are never touched.
use super::RankedLock;
use crate::error::Result;
use std::marker::PhantomData;
use tracing::debug;

/// A fixed group of ranked locks acquired together.
#[derive(Debug, Clone)]
pub struct LockSet<'a> {
    /// Ascending by rank.
    locks: Vec<&'a RankedLock>,
}

impl<'a> LockSet<'a> {
    pub fn new(locks: &[&'a RankedLock]) -> Self {
        let mut locks = locks.to_vec();
        locks.sort_by_key(|lock| lock.rank());
        Self { locks }
    }

    /// Ranks in acquisition order.
    pub fn ranks(&self) -> Vec<i64> {
        self.locks.iter().map(|lock| lock.rank()).collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Acquire every lock, lowest rank first.
    ///
    /// On failure nothing acquired by this call is left held and the
    /// returned [`SyncError::LockTimeout`](crate::SyncError::LockTimeout)
    /// names the lock that could not be taken.
    pub fn ordered_acquire(&self) -> Result<()> {
        for (taken, lock) in self.locks.iter().enumerate() {
            if lock.acquire(true, None) {
                continue;
            }

            for held in self.locks[..taken].iter().rev() {
                held.release();
            }
            debug!(
                failed = lock.name(),
                rank = lock.rank(),
                rolled_back = taken,
                "ordered acquire rolled back"
            );
            return Err(lock.timeout_error());
        }
        Ok(())
    }

    /// Release every lock, highest rank first.
    pub fn ordered_release(&self) {
        for lock in self.locks.iter().rev() {
            lock.release();
        }
    }

    /// Scoped form of [`ordered_acquire`](Self::ordered_acquire): the
    /// returned guard calls [`ordered_release`](Self::ordered_release) when
    /// dropped.
    pub fn lock(&self) -> Result<LockSetGuard<'_, 'a>> {
        self.ordered_acquire()?;
        Ok(LockSetGuard {
            set: self,
            _not_send: PhantomData,
        })
    }
}

/// Holds every lock of a [`LockSet`]; releases them in descending rank on
/// drop.
#[must_use = "the locks are released as soon as the guard is dropped"]
pub struct LockSetGuard<'s, 'a> {
    set: &'s LockSet<'a>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for LockSetGuard<'_, '_> {
    fn drop(&mut self) {
        self.set.ordered_release();
    }
}

/// Acquire `locks` in ascending rank order, all or nothing.
pub fn ordered_acquire(locks: &[&RankedLock]) -> Result<()> {
    LockSet::new(locks).ordered_acquire()
}

/// Release `locks` in descending rank order, whatever order they are
/// passed in.
pub fn ordered_release(locks: &[&RankedLock]) {
    LockSet::new(locks).ordered_release()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::lock::LockStats;
    use crossbeam_channel::bounded;
    use std::thread;
    use std::time::Duration;

    const SHORT: Duration = Duration::from_millis(50);

    fn lock(name: &str, rank: i64) -> RankedLock {
        RankedLock::new(name, rank, SHORT).unwrap()
    }

    /// Run `check` while another thread holds `busy`.
    fn while_held_elsewhere(busy: &RankedLock, check: impl FnOnce()) {
        let (held_tx, held_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded::<()>(0);
        thread::scope(|s| {
            s.spawn(|| {
                assert!(busy.acquire(false, None));
                held_tx.send(()).unwrap();
                done_rx.recv().unwrap();
                busy.release();
            });
            held_rx.recv().unwrap();
            check();
            done_tx.send(()).unwrap();
        });
    }

    #[test]
    fn test_lock_set_sorts_by_rank() {
        let (a, b, c) = (lock("c", 3), lock("a", 1), lock("b", 2));
        let set = LockSet::new(&[&a, &b, &c]);
        assert_eq!(set.ranks(), vec![1, 2, 3]);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_equal_ranks_keep_caller_order() {
        let (x, y) = (lock("x", 5), lock("y", 5));
        let set = LockSet::new(&[&y, &x]);
        let names: Vec<&str> = set.locks.iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["y", "x"]);
    }

    #[test]
    fn test_ordered_acquire_and_release() {
        let (three, one, two) = (lock("three", 3), lock("one", 1), lock("two", 2));
        ordered_acquire(&[&three, &one, &two]).unwrap();
        assert!(one.is_held_by_current_thread());
        assert!(two.is_held_by_current_thread());
        assert!(three.is_held_by_current_thread());

        // Release order is independent of argument order.
        ordered_release(&[&two, &three, &one]);
        assert_eq!(one.hold_depth() + two.hold_depth() + three.hold_depth(), 0);
    }

    #[test]
    fn test_lowest_rank_is_attempted_first() {
        let (three, one, two) = (lock("three", 3), lock("one", 1), lock("two", 2));
        while_held_elsewhere(&one, || {
            let err = ordered_acquire(&[&three, &two, &one]).unwrap_err();
            assert!(matches!(err, SyncError::LockTimeout { rank: 1, .. }));
        });
        assert_eq!(two.stats().acquisitions, 0);
        assert_eq!(three.stats().acquisitions, 0);
    }

    #[test]
    fn test_timeout_rolls_back_and_skips_higher_ranks() {
        let (three, one, two) = (lock("three", 3), lock("one", 1), lock("two", 2));
        while_held_elsewhere(&two, || {
            let err = ordered_acquire(&[&three, &one, &two]).unwrap_err();
            assert!(err.is_lock_timeout());
            assert!(matches!(err, SyncError::LockTimeout { rank: 2, .. }));
            assert!(!one.is_held_by_current_thread());
        });
        assert_eq!(one.stats().acquisitions, 1);
        assert_eq!(two.stats().timeouts, 1);
        assert_eq!(three.stats(), LockStats::default());
    }

    #[test]
    fn test_guard_releases_all_in_reverse() {
        let (one, two) = (lock("one", 1), lock("two", 2));
        let set = LockSet::new(&[&two, &one]);
        {
            let _guard = set.lock().unwrap();
            assert!(one.is_held_by_current_thread());
            assert!(two.is_held_by_current_thread());
        }
        assert!(!one.is_held_by_current_thread());
        assert!(!two.is_held_by_current_thread());
        assert_eq!(one.stats().misuses + two.stats().misuses, 0);
    }

    #[test]
    fn test_set_nests_with_single_lock_already_held() {
        let (one, two) = (lock("one", 1), lock("two", 2));
        let _outer = one.lock().unwrap();
        let set = LockSet::new(&[&one, &two]);
        {
            let _both = set.lock().unwrap();
            assert_eq!(one.hold_depth(), 2);
        }
        assert_eq!(one.hold_depth(), 1);
        assert_eq!(two.hold_depth(), 0);
    }
}
