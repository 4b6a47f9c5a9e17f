/// Resource allocator — Banker's-algorithm deadlock avoidance.
///
/// Tracks a fixed number of countable resource types (worker slots, open
/// file handles, ...) shared by a fixed set of numbered processes. Every
/// process declares up front the most units of each type it may ever hold
/// at once. A request is granted only if, after granting it, some order
/// still exists in which every process could obtain its full declared
/// ceiling and finish. The system therefore never enters a state from
/// which deadlock on these resources is possible.
///
/// The allocator never blocks beyond its own short critical section: a
/// request that cannot be granted right now returns `false` and the caller
/// decides how to back off.
///
/// # Panics
///
/// Passing a process id that was not declared at construction, or a vector
/// whose length differs from the number of resource types, is a programming
/// error and panics.
pub mod safety;

use crate::error::{Result, SyncError};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

/// Mutable half of the allocator. Only ever touched under the mutex.
#[derive(Debug, Clone)]
struct Ledger {
    /// Units of each type not held by any process.
    available: Vec<u32>,
    /// `allocated[p][r]` — units of type `r` held by process `p`.
    allocated: Vec<Vec<u32>>,
}

impl Ledger {
    /// Move up to `rel[r]` units of each type from `pid` back to the pool.
    fn give_back(&mut self, pid: usize, rel: &[u32]) {
        for ((free, held), &r) in self
            .available
            .iter_mut()
            .zip(self.allocated[pid].iter_mut())
            .zip(rel)
        {
            let returned = r.min(*held);
            *held -= returned;
            *free += returned;
        }
    }
}

/// Point-in-time copy of the allocator matrices, taken under one lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorSnapshot {
    pub total: Vec<u32>,
    pub available: Vec<u32>,
    pub max_claim: Vec<Vec<u32>>,
    pub allocated: Vec<Vec<u32>>,
    pub need: Vec<Vec<u32>>,
}

/// Deadlock-avoiding allocator for countable resources.
///
/// Construct one per logical scope and share it by reference (or `Arc`)
/// with the workers that draw from it.
#[derive(Debug)]
pub struct ResourceAllocator {
    /// Original total of each resource type, fixed at construction.
    total: Vec<u32>,
    /// `max_claim[p][r]` — ceiling declared by process `p` for type `r`.
    max_claim: Vec<Vec<u32>>,
    ledger: Mutex<Ledger>,
}

impl ResourceAllocator {
    /// Build an allocator with every unit available and nothing allocated.
    ///
    /// Rejects ragged ceilings and any ceiling larger than the total of its
    /// resource type.
    pub fn new(total: Vec<u32>, max_claim: Vec<Vec<u32>>) -> Result<Self> {
        for (pid, ceiling) in max_claim.iter().enumerate() {
            if ceiling.len() != total.len() {
                return Err(SyncError::InvalidAllocator {
                    reason: format!(
                        "process {pid} declares {} resource types, expected {}",
                        ceiling.len(),
                        total.len()
                    ),
                });
            }
            if let Some(r) = (0..total.len()).find(|&r| ceiling[r] > total[r]) {
                return Err(SyncError::InvalidAllocator {
                    reason: format!(
                        "process {pid} claims {} units of resource {r}, only {} exist",
                        ceiling[r], total[r]
                    ),
                });
            }
        }

        let ledger = Ledger {
            available: total.clone(),
            allocated: vec![vec![0; total.len()]; max_claim.len()],
        };

        Ok(Self {
            total,
            max_claim,
            ledger: Mutex::new(ledger),
        })
    }

    /// Number of processes declared at construction.
    pub fn process_count(&self) -> usize {
        self.max_claim.len()
    }

    /// Number of resource types.
    pub fn resource_count(&self) -> usize {
        self.total.len()
    }

    /// Original total of each resource type.
    pub fn total(&self) -> &[u32] {
        &self.total
    }

    /// Declared ceiling of `pid`.
    pub fn max_claim(&self, pid: usize) -> &[u32] {
        self.assert_pid(pid);
        &self.max_claim[pid]
    }

    /// Units currently free.
    pub fn available(&self) -> Vec<u32> {
        self.ledger.lock().available.clone()
    }

    /// Units currently held by `pid`.
    pub fn allocated(&self, pid: usize) -> Vec<u32> {
        self.assert_pid(pid);
        self.ledger.lock().allocated[pid].clone()
    }

    /// Units `pid` may still request before reaching its ceiling.
    pub fn need(&self, pid: usize) -> Vec<u32> {
        self.assert_pid(pid);
        let ledger = self.ledger.lock();
        self.max_claim[pid]
            .iter()
            .zip(&ledger.allocated[pid])
            .map(|(&m, &a)| m - a)
            .collect()
    }

    /// Try to allocate `req` to process `pid`.
    ///
    /// Returns `false` without changing anything if the request exceeds the
    /// process's remaining ceiling, exceeds the free units, or would leave
    /// the system in an unsafe state. Callers cannot (and should not) tell
    /// these cases apart.
    pub fn request(&self, pid: usize, req: &[u32]) -> bool {
        self.assert_vector(pid, req, "request");

        let mut ledger = self.ledger.lock();

        let over_ceiling = req
            .iter()
            .zip(&self.max_claim[pid])
            .zip(&ledger.allocated[pid])
            .any(|((&r, &m), &a)| r > m - a);
        if over_ceiling {
            debug!(pid, ?req, "request denied: exceeds declared ceiling");
            return false;
        }

        let over_capacity = req.iter().zip(&ledger.available).any(|(&r, &a)| r > a);
        if over_capacity {
            debug!(
                pid,
                ?req,
                available = ?ledger.available,
                "request denied: insufficient free units"
            );
            return false;
        }

        // Tentative state lives in scratch copies; the ledger only changes
        // once the scan has found a completion order.
        let available: Vec<u32> = ledger
            .available
            .iter()
            .zip(req)
            .map(|(a, r)| a - r)
            .collect();
        let mut allocated = ledger.allocated.clone();
        for (held, &r) in allocated[pid].iter_mut().zip(req) {
            *held += r;
        }

        if !safety::is_safe(&available, &allocated, &self.max_claim) {
            debug!(pid, ?req, "request denied: resulting state is unsafe");
            return false;
        }

        ledger.available = available;
        ledger.allocated = allocated;
        debug!(pid, ?req, "request granted");
        true
    }

    /// Return units held by `pid`.
    ///
    /// Each component is capped at what the process actually holds, so a
    /// release can never drive an allocation negative. Over-release is not
    /// an error.
    pub fn release(&self, pid: usize, rel: &[u32]) {
        self.assert_vector(pid, rel, "release");
        self.ledger.lock().give_back(pid, rel);
        debug!(pid, ?rel, "released");
    }

    /// Return everything `pid` holds (the process has finished).
    pub fn release_all(&self, pid: usize) {
        self.assert_pid(pid);
        let mut ledger = self.ledger.lock();
        let held = ledger.allocated[pid].clone();
        ledger.give_back(pid, &held);
        debug!(pid, ?held, "released all");
    }

    /// A completion order witnessing that the current state is safe.
    ///
    /// Every state reachable through `request`/`release` is safe, so this
    /// only returns `None` for an allocator whose invariants were broken.
    pub fn safe_sequence(&self) -> Option<Vec<usize>> {
        let ledger = self.ledger.lock();
        safety::safe_sequence(&ledger.available, &ledger.allocated, &self.max_claim)
    }

    /// Consistent copy of every matrix.
    pub fn snapshot(&self) -> AllocatorSnapshot {
        let ledger = self.ledger.lock();
        AllocatorSnapshot {
            total: self.total.clone(),
            available: ledger.available.clone(),
            max_claim: self.max_claim.clone(),
            allocated: ledger.allocated.clone(),
            need: safety::need(&self.max_claim, &ledger.allocated),
        }
    }

    fn assert_pid(&self, pid: usize) {
        assert!(
            pid < self.max_claim.len(),
            "process id {pid} out of range ({} processes declared)",
            self.max_claim.len()
        );
    }

    fn assert_vector(&self, pid: usize, v: &[u32], op: &str) {
        self.assert_pid(pid);
        assert_eq!(
            v.len(),
            self.total.len(),
            "{op} vector has {} entries, allocator tracks {} resource types",
            v.len(),
            self.total.len()
        );
    }
}
