//! The real resource tree and the indices maintained alongside it.
//!
//! - [`ResourceIndex`]: id → node, toplevel names, type and application maps
//! - [`AliasIndex`]: which references point at a node
//! - [`DirtyTracker`]: what the next flush has to write
//! - [`IdSequence`]: store-owned id allocation
//!
//! Everything here is single-threaded; [`crate::overlay`] wraps the index in
//! a lock and makes it visible to handles.

mod alias;
mod dirty;
mod sequence;
mod tree;

pub use alias::AliasIndex;
pub use dirty::{DirtySet, DirtyTracker};
pub use sequence::IdSequence;
pub use tree::{Deletion, RemovedElement, ResourceIndex};

pub(crate) use tree::validate_name;
