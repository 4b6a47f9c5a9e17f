/// Directory tally — a scan worker built on the DirGuard toolkit.
///
/// The walk itself is a plain `jwalk` traversal. What matters here is how
/// the workers that stat each file share state:
///
/// - a [`ResourceAllocator`] bounds how many `stat` calls are in flight
///   (one slot type, one process per worker thread);
/// - the running totals and the per-extension tally are each owned by a
///   [`RankedLock`]. Their data is only reachable while the owning lock is
///   held by the calling thread, and every update goes through one
///   [`LockSet`] so both change together;
/// - with `detailed` set, a [`CoherenceTracker`] instruments the scan root
///   (read by every worker) and each worker's own file counter, so a
///   counter touched by two workers would show up as a race in the report.
use anyhow::{ensure, Context};
use dirguard_core::{
    AccessorId, AllocatorSnapshot, CoherenceTracker, LockSet, RankedLock, ResourceAllocator,
    SyncConfig, VariableReport,
};
use parking_lot::{Mutex, MutexGuard};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Ranks of the shared structures, lowest acquired first.
const RANK_TOTALS: i64 = 10;
const RANK_TYPE_TALLY: i64 = 20;

/// Pause between denied slot requests.
const SLOT_BACKOFF: Duration = Duration::from_micros(200);

const SCAN_ROOT: &str = "scan_root";

/// Result of one tally run.
#[derive(Debug, Serialize)]
pub struct TallySummary {
    pub root: String,
    pub files: u64,
    pub dirs: u64,
    pub total_bytes: u64,
    pub errors: u64,
    /// File count per lowercase extension (`""` for none).
    pub by_extension: BTreeMap<String, u64>,
    /// Files recorded by each worker, indexed by worker.
    pub per_worker: Vec<u64>,
    pub elapsed_ms: u128,
    pub allocator: AllocatorSnapshot,
    /// Empty unless the run was `detailed`.
    pub coherence: Vec<VariableReport>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    files: u64,
    bytes: u64,
}

/// Data owned by a [`RankedLock`].
///
/// The inner mutex never waits: it is taken with `try_lock` only after the
/// owning ranked lock has been confirmed held by this thread, so the ranked
/// lock is what provides exclusion.
struct Owned<T> {
    owner: RankedLock,
    data: Mutex<T>,
}

impl<T> Owned<T> {
    fn new(owner: RankedLock, data: T) -> Self {
        Self {
            owner,
            data: Mutex::new(data),
        }
    }

    fn get(&self) -> anyhow::Result<MutexGuard<'_, T>> {
        ensure!(
            self.owner.is_held_by_current_thread(),
            "'{}' accessed without holding its lock",
            self.owner.name()
        );
        self.data
            .try_lock()
            .with_context(|| format!("'{}' data already borrowed", self.owner.name()))
    }
}

/// State shared by all stat workers.
struct Shared {
    totals: Owned<Totals>,
    by_extension: Owned<BTreeMap<String, u64>>,
    errors: AtomicU64,
    worker_files: Vec<AtomicU64>,
    slots: ResourceAllocator,
    tracker: Option<CoherenceTracker>,
}

impl Shared {
    fn new(config: &SyncConfig) -> anyhow::Result<Self> {
        let timeout = config.lock_timeout()?;
        let workers = config.worker_threads;
        // Half the workers may stat at once; each holds at most one slot.
        let slots = (workers as u32).div_ceil(2);

        let tracker = config.detailed.then(|| {
            let tracker = CoherenceTracker::new();
            tracker.register(SCAN_ROOT);
            for pid in 0..workers {
                tracker.register(&worker_counter(pid));
            }
            tracker
        });

        Ok(Self {
            totals: Owned::new(
                RankedLock::new("totals", RANK_TOTALS, timeout)?,
                Totals::default(),
            ),
            by_extension: Owned::new(
                RankedLock::new("type_tally", RANK_TYPE_TALLY, timeout)?,
                BTreeMap::new(),
            ),
            errors: AtomicU64::new(0),
            worker_files: (0..workers).map(|_| AtomicU64::new(0)).collect(),
            slots: ResourceAllocator::new(vec![slots], vec![vec![1]; workers])?,
            tracker,
        })
    }

    /// Wait for a stat slot. The allocator never blocks, so back off here.
    fn take_slot(&self, pid: usize) {
        while !self.slots.request(pid, &[1]) {
            std::thread::sleep(SLOT_BACKOFF);
        }
    }

    fn record_file(&self, pid: usize, path: &Path, size: u64) -> anyhow::Result<()> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        {
            let set = LockSet::new(&[&self.by_extension.owner, &self.totals.owner]);
            let _guard = set.lock()?;
            let mut totals = self.totals.get()?;
            totals.files += 1;
            totals.bytes += size;
            *self.by_extension.get()?.entry(ext).or_insert(0) += 1;
        }

        let counter = &self.worker_files[pid];
        match &self.tracker {
            Some(tracker) => {
                let name = worker_counter(pid);
                let me = AccessorId::new(pid as u64);
                tracker.read(&name, me)?;
                let seen = counter.load(Ordering::Relaxed);
                tracker.write(&name, me)?;
                counter.store(seen + 1, Ordering::Relaxed);
            }
            None => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn summary_totals(&self) -> anyhow::Result<(Totals, BTreeMap<String, u64>)> {
        let set = LockSet::new(&[&self.totals.owner, &self.by_extension.owner]);
        let _guard = set.lock()?;
        let totals = *self.totals.get()?;
        let by_extension = self.by_extension.get()?.clone();
        Ok((totals, by_extension))
    }
}

fn worker_counter(pid: usize) -> String {
    format!("worker_{pid}_files")
}

/// Walk `root` and tally every regular file.
pub fn tally_directory(root: &Path, config: &SyncConfig) -> anyhow::Result<TallySummary> {
    config.validate()?;
    let start = Instant::now();
    let shared = Shared::new(config)?;

    // Phase 1: collect files.
    let mut files: Vec<PathBuf> = Vec::new();
    let mut dirs: u64 = 0;
    let walker = jwalk::WalkDir::new(root)
        .skip_hidden(false)
        .follow_links(false)
        .parallelism(jwalk::Parallelism::RayonNewPool(config.worker_threads));
    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_dir() => dirs += 1,
            Ok(entry) if entry.file_type().is_file() => files.push(entry.path()),
            Ok(_) => {}
            Err(err) => {
                debug!("walk error: {err}");
                shared.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    info!("Found {} files in {} directories", files.len(), dirs);

    // Phase 2: stat under the toolkit's protection.
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_threads)
        .thread_name(|i| format!("dirguard-worker-{i}"))
        .build()
        .context("failed to build worker pool")?;

    pool.install(|| {
        files.par_iter().try_for_each(|path| -> anyhow::Result<()> {
            let pid = rayon::current_thread_index().unwrap_or(0);
            if let Some(tracker) = &shared.tracker {
                tracker.read(SCAN_ROOT, AccessorId::new(pid as u64))?;
            }

            shared.take_slot(pid);
            let meta = std::fs::symlink_metadata(path);
            shared.slots.release(pid, &[1]);

            match meta {
                Ok(meta) => shared.record_file(pid, path, meta.len()),
                Err(err) => {
                    debug!("stat failed for {}: {err}", path.display());
                    shared.errors.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
            }
        })
    })?;

    let (totals, by_extension) = shared.summary_totals()?;
    let summary = TallySummary {
        root: root.display().to_string(),
        files: totals.files,
        dirs,
        total_bytes: totals.bytes,
        errors: shared.errors.load(Ordering::Relaxed),
        by_extension,
        per_worker: shared
            .worker_files
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect(),
        elapsed_ms: start.elapsed().as_millis(),
        allocator: shared.slots.snapshot(),
        coherence: shared
            .tracker
            .as_ref()
            .map(CoherenceTracker::report)
            .unwrap_or_default(),
    };
    info!(
        "Tally complete: {} files, {} bytes in {} ms",
        summary.files, summary.total_bytes, summary.elapsed_ms
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirguard_core::CoherenceState;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    /// ```text
    /// root/
    ///   alpha/
    ///     a.txt   (100 bytes)
    ///     b.rs    (200 bytes)
    ///   beta/
    ///     c.PNG   (300 bytes)
    ///   d.zip     (400 bytes)
    /// ```
    fn build_test_tree(root: &Path) {
        let alpha = root.join("alpha");
        let beta = root.join("beta");
        fs::create_dir_all(&alpha).unwrap();
        fs::create_dir_all(&beta).unwrap();

        write_bytes(&alpha.join("a.txt"), 100);
        write_bytes(&alpha.join("b.rs"), 200);
        write_bytes(&beta.join("c.PNG"), 300);
        write_bytes(&root.join("d.zip"), 400);
    }

    fn write_bytes(path: &Path, n: usize) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(&vec![0u8; n]).unwrap();
    }

    fn detailed(workers: usize) -> SyncConfig {
        SyncConfig {
            detailed: true,
            ..SyncConfig::with_worker_threads(workers)
        }
    }

    #[test]
    fn test_tally_counts_files_and_bytes() {
        let tmp = TempDir::new().unwrap();
        build_test_tree(tmp.path());

        let config = SyncConfig::with_worker_threads(4);
        let summary = tally_directory(tmp.path(), &config).unwrap();

        assert_eq!(summary.files, 4);
        assert_eq!(summary.dirs, 3); // root, alpha, beta
        assert_eq!(summary.total_bytes, 1_000);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.by_extension.get("png"), Some(&1));
        assert_eq!(summary.by_extension.get("rs"), Some(&1));
        assert_eq!(summary.per_worker.len(), 4);
        assert_eq!(summary.per_worker.iter().sum::<u64>(), 4);
    }

    #[test]
    fn test_tally_returns_every_slot() {
        let tmp = TempDir::new().unwrap();
        build_test_tree(tmp.path());

        let summary = tally_directory(tmp.path(), &SyncConfig::with_worker_threads(3)).unwrap();
        assert_eq!(summary.allocator.available, summary.allocator.total);
        assert_eq!(summary.allocator.total, vec![2]);
    }

    #[test]
    fn test_single_slot_many_files_completes() {
        let tmp = TempDir::new().unwrap();
        for i in 0..200 {
            write_bytes(&tmp.path().join(format!("f{i}.dat")), 10);
        }

        // Two workers share one slot, so most requests are denied at first.
        let summary = tally_directory(tmp.path(), &SyncConfig::with_worker_threads(2)).unwrap();
        assert_eq!(summary.allocator.total, vec![1]);
        assert_eq!(summary.files, 200);
        assert_eq!(summary.total_bytes, 2_000);
        assert_eq!(summary.allocator.available, vec![1]);
    }

    #[test]
    fn test_coherence_only_when_detailed() {
        let tmp = TempDir::new().unwrap();
        build_test_tree(tmp.path());

        let plain = tally_directory(tmp.path(), &SyncConfig::with_worker_threads(2)).unwrap();
        assert!(plain.coherence.is_empty());

        let verbose = tally_directory(tmp.path(), &detailed(2)).unwrap();
        assert_eq!(verbose.coherence.len(), 3); // scan_root + one counter per worker
    }

    #[test]
    fn test_detailed_tally_tracks_worker_counters() {
        let tmp = TempDir::new().unwrap();
        build_test_tree(tmp.path());

        let summary = tally_directory(tmp.path(), &detailed(3)).unwrap();
        assert!(summary.coherence.iter().all(|v| v.races == 0));
        assert!(summary.coherence.iter().any(|v| v.name == SCAN_ROOT));

        for (pid, &count) in summary.per_worker.iter().enumerate() {
            let name = worker_counter(pid);
            let report = summary
                .coherence
                .iter()
                .find(|v| v.name == name)
                .unwrap();
            if count == 0 {
                assert_eq!(report.state, CoherenceState::Virgin);
            } else {
                assert_eq!(report.state, CoherenceState::Exclusive);
                assert_eq!(report.owners, vec![AccessorId::new(pid as u64)]);
            }
        }
    }

    #[test]
    fn test_owned_data_requires_its_lock() {
        let shared = Shared::new(&SyncConfig::with_worker_threads(1)).unwrap();
        assert!(shared.totals.get().is_err());

        let _guard = shared.totals.owner.lock().unwrap();
        shared.totals.get().unwrap().files += 1;
        assert!(shared.by_extension.get().is_err());
        assert_eq!(shared.totals.get().unwrap().files, 1);
    }

    #[test]
    fn test_nested_borrow_is_an_error_not_a_deadlock() {
        let shared = Shared::new(&SyncConfig::with_worker_threads(1)).unwrap();
        let _guard = shared.totals.owner.lock().unwrap();
        let _first = shared.totals.get().unwrap();
        assert!(shared.totals.get().is_err());
    }

    #[test]
    fn test_tally_rejects_invalid_config() {
        let tmp = TempDir::new().unwrap();
        let config = SyncConfig::with_lock_timeout_secs(0.0);
        assert!(tally_directory(tmp.path(), &config).is_err());
    }
}
