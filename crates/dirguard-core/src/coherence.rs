/// Coherence tracker — heuristic detection of unsynchronized shared writes.
///
/// Each registered variable carries a sharing state modelled on a
/// cache-coherence protocol:
///
/// ```text
/// Virgin ──read/write──▶ Exclusive ──read by 2nd accessor──▶ Shared
///                            │                                 │
///                            └──write by new accessor──┐       │ write
///                                                      ▼       ▼
///                                                  Shared-Modified
/// ```
///
/// Clients call [`CoherenceTracker::read`] / [`CoherenceTracker::write`]
/// around every touch of a shared variable. A write that moves the variable
/// into (or adds a new writer to) `Shared-Modified` is reported as
/// [`SyncError::DataRace`]. The tracker only sees the calls it is told
/// about; it cannot observe unmediated memory access.
///
/// Every entry has its own guard, so traffic on one variable never blocks
/// another. The accessor set of an entry only grows.
use crate::error::{Result, SyncError};
use compact_str::CompactString;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Identifies the thread or process touching a variable.
///
/// Use either explicit ids ([`AccessorId::new`]) or per-thread ids
/// ([`AccessorId::current`]) within one tracker, not both: the two are
/// drawn from the same number space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct AccessorId(u64);

static NEXT_ACCESSOR: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_ACCESSOR: AccessorId =
        AccessorId(NEXT_ACCESSOR.fetch_add(1, Ordering::Relaxed));
}

impl AccessorId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Stable id of the calling thread, assigned on first use.
    pub fn current() -> Self {
        CURRENT_ACCESSOR.with(|id| *id)
    }
}

impl fmt::Display for AccessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "accessor#{}", self.0)
    }
}

/// Sharing state of one tracked variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum CoherenceState {
    /// Never accessed.
    #[default]
    Virgin,
    /// Accessed by exactly one accessor so far.
    Exclusive,
    /// Read by several accessors, not yet written by a second one.
    Shared,
    /// Written by more than one accessor without an observed handoff.
    #[serde(rename = "Shared-Modified")]
    SharedModified,
}

impl CoherenceState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Virgin => "Virgin",
            Self::Exclusive => "Exclusive",
            Self::Shared => "Shared",
            Self::SharedModified => "Shared-Modified",
        }
    }
}

impl fmt::Display for CoherenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Summary of one variable, as returned by [`CoherenceTracker::report`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableReport {
    pub name: String,
    pub state: CoherenceState,
    pub owners: Vec<AccessorId>,
    pub races: u64,
}

#[derive(Debug, Default)]
struct Entry {
    state: CoherenceState,
    owners: BTreeSet<AccessorId>,
    races: u64,
}

impl Entry {
    fn on_read(&mut self, who: AccessorId) {
        self.owners.insert(who);
        match self.state {
            CoherenceState::Virgin => self.state = CoherenceState::Exclusive,
            CoherenceState::Exclusive if self.owners.len() > 1 => {
                self.state = CoherenceState::Shared
            }
            _ => {}
        }
    }

    /// Apply a write; returns true if it constitutes a race.
    fn on_write(&mut self, who: AccessorId) -> bool {
        match self.state {
            CoherenceState::Virgin => {
                self.state = CoherenceState::Exclusive;
                self.owners.clear();
                self.owners.insert(who);
                false
            }
            CoherenceState::Exclusive => {
                if self.owners.contains(&who) {
                    return false;
                }
                self.state = CoherenceState::SharedModified;
                self.owners.insert(who);
                true
            }
            CoherenceState::Shared => {
                self.state = CoherenceState::SharedModified;
                self.owners.insert(who);
                true
            }
            // Already flagged; only a writer we have not seen before is new.
            CoherenceState::SharedModified => self.owners.insert(who),
        }
    }
}

/// Registry of tracked variables.
///
/// One instance per logical scope, constructed by the client and handed to
/// its workers by reference.
#[derive(Debug, Default)]
pub struct CoherenceTracker {
    entries: RwLock<HashMap<CompactString, Arc<Mutex<Entry>>>>,
    races: AtomicU64,
}

impl CoherenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `name` in the `Virgin` state.
    ///
    /// Registering a name twice is a no-op and leaves its state untouched.
    /// Returns true if the name was newly registered.
    pub fn register(&self, name: &str) -> bool {
        if self.entries.read().contains_key(name) {
            return false;
        }
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return false;
        }
        entries.insert(CompactString::new(name), Arc::default());
        true
    }

    /// Record a read of `name` by `who`. Reads never signal a race.
    pub fn read(&self, name: &str, who: AccessorId) -> Result<()> {
        let entry = self.entry(name)?;
        entry.lock().on_read(who);
        Ok(())
    }

    /// Record a write of `name` by `who`.
    ///
    /// The state transition is applied before the race, if any, is
    /// returned as [`SyncError::DataRace`].
    pub fn write(&self, name: &str, who: AccessorId) -> Result<()> {
        let entry = self.entry(name)?;
        let mut guard = entry.lock();
        let previous = guard.state;
        if !guard.on_write(who) {
            return Ok(());
        }
        guard.races += 1;
        let state = guard.state;
        drop(guard);

        self.races.fetch_add(1, Ordering::Relaxed);
        warn!(
            variable = name,
            accessor = %who,
            from = %previous,
            to = %state,
            "data race detected"
        );
        Err(SyncError::DataRace {
            variable: name.to_string(),
            accessor: who,
            state,
        })
    }

    pub fn state(&self, name: &str) -> Option<CoherenceState> {
        let entry = self.entries.read().get(name).cloned()?;
        let state = entry.lock().state;
        Some(state)
    }

    /// Accessors recorded for `name`, ascending.
    pub fn owners(&self, name: &str) -> Option<Vec<AccessorId>> {
        let entry = self.entries.read().get(name).cloned()?;
        let owners = entry.lock().owners.iter().copied().collect();
        Some(owners)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Total races signalled across every variable.
    pub fn races_detected(&self) -> u64 {
        self.races.load(Ordering::Relaxed)
    }

    /// Per-variable summary, sorted by name.
    pub fn report(&self) -> Vec<VariableReport> {
        let entries: Vec<(CompactString, Arc<Mutex<Entry>>)> = self
            .entries
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
            .collect();

        let mut report: Vec<VariableReport> = entries
            .into_iter()
            .map(|(name, entry)| {
                let entry = entry.lock();
                VariableReport {
                    name: name.to_string(),
                    state: entry.state,
                    owners: entry.owners.iter().copied().collect(),
                    races: entry.races,
                }
            })
            .collect();
        report.sort_by(|a, b| a.name.cmp(&b.name));
        report
    }

    fn entry(&self, name: &str) -> Result<Arc<Mutex<Entry>>> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::UnregisteredVariable {
                variable: name.to_string(),
            })
    }
}
