//! Store-owned resource id sequence.

use crate::types::ResourceId;

/// Hands out resource ids.
///
/// The next value is written into every structure generation and restored on
/// recovery, so ids stay unique across restarts without any global counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdSequence {
    next: u32,
}

impl Default for IdSequence {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IdSequence {
    /// Restores a sequence whose next id is `next`.
    #[must_use]
    pub fn starting_at(next: u32) -> Self {
        Self { next: next.max(1) }
    }

    /// Allocates the next id.
    pub fn allocate(&mut self) -> ResourceId {
        let id = ResourceId::new(self.next);
        self.next += 1;
        id
    }

    /// Makes sure `id` will never be handed out.
    pub fn observe(&mut self, id: ResourceId) {
        if id.as_u32() >= self.next {
            self.next = id.as_u32() + 1;
        }
    }

    /// The id the next allocation returns.
    #[must_use]
    pub fn peek(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_monotonically() {
        let mut seq = IdSequence::default();
        assert_eq!(seq.allocate(), ResourceId::new(1));
        assert_eq!(seq.allocate(), ResourceId::new(2));
        assert_eq!(seq.peek(), 3);
    }

    #[test]
    fn observe_skips_past_seen_ids() {
        let mut seq = IdSequence::starting_at(5);
        seq.observe(ResourceId::new(3));
        assert_eq!(seq.peek(), 5);
        seq.observe(ResourceId::new(9));
        assert_eq!(seq.allocate(), ResourceId::new(10));
    }
}
