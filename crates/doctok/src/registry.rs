//! Process-wide registry of records that are being tokenized on the fast path.
//!
//! A single-record request registers its record before it starts. The bulk
//! pipeline checks the registry for every record it is about to tokenize and,
//! if the record is present, removes the entry and skips the record. Whichever
//! side loses the race still produces at most one duplicate blob, which the
//! dedup sweep at the end of every bulk run removes.

use crate::{ProjectId, RecordId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Shared set of `(project, record)` pairs claimed by the fast path.
///
/// Implementations must be safe to call from many tasks at once; every method
/// is atomic with respect to the others.
pub trait PriorityRegistry: Send + Sync {
    /// Marks a record as claimed. Registering twice is a no-op.
    fn register(&self, project_id: ProjectId, record_id: RecordId);

    /// Removes the entry and reports whether it was present.
    fn take(&self, project_id: ProjectId, record_id: RecordId) -> bool;

    fn contains(&self, project_id: ProjectId, record_id: RecordId) -> bool;

    /// Number of claimed records for a project.
    fn pending(&self, project_id: ProjectId) -> usize;
}

/// [`PriorityRegistry`] backed by a mutex-guarded map of sets.
///
/// Empty per-project sets are dropped so that the map does not grow with the
/// number of projects ever seen.
#[derive(Debug, Default)]
pub struct InProcessRegistry {
    entries: Mutex<HashMap<ProjectId, HashSet<RecordId>>>,
}

impl InProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PriorityRegistry for InProcessRegistry {
    fn register(&self, project_id: ProjectId, record_id: RecordId) {
        self.entries
            .lock()
            .entry(project_id)
            .or_default()
            .insert(record_id);
    }

    fn take(&self, project_id: ProjectId, record_id: RecordId) -> bool {
        let mut entries = self.entries.lock();
        let Some(records) = entries.get_mut(&project_id) else {
            return false;
        };
        let removed = records.remove(&record_id);
        if records.is_empty() {
            entries.remove(&project_id);
        }
        removed
    }

    fn contains(&self, project_id: ProjectId, record_id: RecordId) -> bool {
        self.entries
            .lock()
            .get(&project_id)
            .is_some_and(|records| records.contains(&record_id))
    }

    fn pending(&self, project_id: ProjectId) -> usize {
        self.entries.lock().get(&project_id).map_or(0, HashSet::len)
    }
}
