//! Dirty-state tracking between flushes.

use crate::types::ResourceId;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// What changed since the last flush.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirtySet {
    /// Nodes whose value changed.
    pub values: BTreeSet<ResourceId>,
    /// Nodes removed from the tree.
    pub removed: BTreeSet<ResourceId>,
    /// Whether the tree shape, flags or ownership changed.
    pub structure: bool,
}

impl DirtySet {
    /// Returns `true` if there is nothing to flush.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.removed.is_empty() && !self.structure
    }
}

/// Collects changes for the next flush.
///
/// Marking happens while the index is write-locked; taking happens while it
/// is only read-locked by the flush thread, so the sets carry their own lock.
#[derive(Debug, Default)]
pub struct DirtyTracker {
    values: Mutex<BTreeSet<ResourceId>>,
    removed: Mutex<BTreeSet<ResourceId>>,
    structure: AtomicBool,
}

impl DirtyTracker {
    /// Marks a node's value as changed.
    pub fn mark_value(&self, id: ResourceId) {
        self.values.lock().insert(id);
    }

    /// Marks the tree structure as changed.
    pub fn mark_structure(&self) {
        self.structure.store(true, Ordering::Release);
    }

    /// Marks a node as removed. Removal also changes the structure.
    pub fn mark_removed(&self, id: ResourceId) {
        self.values.lock().remove(&id);
        self.removed.lock().insert(id);
        self.mark_structure();
    }

    /// Takes everything marked so far, leaving the tracker clean.
    pub fn take(&self) -> DirtySet {
        DirtySet {
            values: std::mem::take(&mut *self.values.lock()),
            removed: std::mem::take(&mut *self.removed.lock()),
            structure: self.structure.swap(false, Ordering::AcqRel),
        }
    }

    /// Puts back a set whose flush failed.
    pub fn restore(&self, set: DirtySet) {
        self.values.lock().extend(set.values);
        self.removed.lock().extend(set.removed);
        if set.structure {
            self.mark_structure();
        }
    }

    /// Returns `true` if nothing is pending.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.values.lock().is_empty()
            && self.removed.lock().is_empty()
            && !self.structure.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_leaves_tracker_clean() {
        let tracker = DirtyTracker::default();
        tracker.mark_value(ResourceId::new(1));
        tracker.mark_structure();

        let set = tracker.take();
        assert_eq!(set.values.len(), 1);
        assert!(set.structure);
        assert!(tracker.is_clean());
        assert!(tracker.take().is_empty());
    }

    #[test]
    fn removal_supersedes_value_change() {
        let tracker = DirtyTracker::default();
        tracker.mark_value(ResourceId::new(3));
        tracker.mark_removed(ResourceId::new(3));

        let set = tracker.take();
        assert!(set.values.is_empty());
        assert!(set.removed.contains(&ResourceId::new(3)));
        assert!(set.structure);
    }

    #[test]
    fn restore_after_failed_flush() {
        let tracker = DirtyTracker::default();
        tracker.mark_value(ResourceId::new(2));
        let set = tracker.take();
        tracker.mark_value(ResourceId::new(4));
        tracker.restore(set);

        let again = tracker.take();
        assert_eq!(
            again.values.into_iter().collect::<Vec<_>>(),
            vec![ResourceId::new(2), ResourceId::new(4)]
        );
    }
}
