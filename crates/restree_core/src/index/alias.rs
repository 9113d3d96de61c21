//! Reverse alias index: which reference nodes point at a target.

use crate::types::ResourceId;
use std::collections::{BTreeSet, HashMap};

/// Maps each referenced node to the reference nodes aliasing it.
///
/// Deleting a subtree asks this index for every alias into the subtree
/// instead of scanning all reference nodes.
#[derive(Debug, Default, Clone)]
pub struct AliasIndex {
    by_target: HashMap<ResourceId, BTreeSet<ResourceId>>,
}

impl AliasIndex {
    /// Records that `reference` aliases `target`.
    pub fn add(&mut self, target: ResourceId, reference: ResourceId) {
        self.by_target.entry(target).or_default().insert(reference);
    }

    /// Forgets one alias.
    pub fn remove(&mut self, target: ResourceId, reference: ResourceId) {
        if let Some(refs) = self.by_target.get_mut(&target) {
            refs.remove(&reference);
            if refs.is_empty() {
                self.by_target.remove(&target);
            }
        }
    }

    /// Reference nodes aliasing `target`, in id order.
    #[must_use]
    pub fn references_to(&self, target: ResourceId) -> Vec<ResourceId> {
        self.by_target
            .get(&target)
            .map(|refs| refs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns `true` if anything aliases `target`.
    #[must_use]
    pub fn is_referenced(&self, target: ResourceId) -> bool {
        self.by_target.contains_key(&target)
    }

    /// Number of aliased targets.
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.by_target.len()
    }
}
