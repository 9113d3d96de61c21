//! Path-bound node handles.

use crate::index::ResourceIndex;
use crate::types::{ResourceId, NO_TIMESTAMP};
use crate::value::Value;
use parking_lot::RwLock;
use std::sync::Arc;

/// What a handle currently stands for.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// A real node of the index.
    Real(ResourceId),
    /// Nothing real lives at the path.
    Virtual {
        /// Value the node had when it was last real.
        last_value: Option<Value>,
        /// Its last write time.
        last_modified: i64,
    },
}

impl Binding {
    pub(crate) fn fresh_virtual() -> Self {
        Binding::Virtual {
            last_value: None,
            last_modified: NO_TIMESTAMP,
        }
    }

    /// The bound id of a real handle.
    #[must_use]
    pub fn id(&self) -> Option<ResourceId> {
        match self {
            Binding::Real(id) => Some(*id),
            Binding::Virtual { .. } => None,
        }
    }
}

#[derive(Debug)]
struct HandleState {
    binding: Binding,
    type_name: String,
    decorator: bool,
}

/// The one logical node living at a path.
///
/// A handle outlives the real node it was bound to: deleting the node turns
/// the handle virtual, creating it again rebinds it. Paths are the paths the
/// caller navigated, so the same real node can have several handles when it
/// is reachable through references.
#[derive(Debug)]
pub struct NodeHandle {
    path: String,
    name: String,
    parent: Option<Arc<NodeHandle>>,
    state: RwLock<HandleState>,
}

impl NodeHandle {
    pub(crate) fn new(
        path: String,
        name: &str,
        parent: Option<Arc<NodeHandle>>,
        type_name: &str,
        decorator: bool,
        binding: Binding,
    ) -> Self {
        Self {
            path,
            name: name.to_string(),
            parent,
            state: RwLock::new(HandleState {
                binding,
                type_name: type_name.to_string(),
                decorator,
            }),
        }
    }

    /// Navigated path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path segment.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle of the parent path; `None` for toplevel handles.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<NodeHandle>> {
        self.parent.as_ref()
    }

    /// Current binding. Call [`Self::refresh`] first to see the latest
    /// state of the index.
    #[must_use]
    pub fn binding(&self) -> Binding {
        self.state.read().binding.clone()
    }

    /// Declared type.
    #[must_use]
    pub fn type_name(&self) -> String {
        self.state.read().type_name.clone()
    }

    /// Whether the handle stands for a decorator.
    #[must_use]
    pub fn is_decorator(&self) -> bool {
        self.state.read().decorator
    }

    /// Rebinds the handle to whatever lives at its path now and returns the
    /// new binding.
    ///
    /// A real node found at the path wins, even if it is not the node the
    /// handle was bound to before. A handle whose node vanished becomes
    /// virtual.
    pub(crate) fn refresh(&self, index: &ResourceIndex) -> Binding {
        let found = index.resolve_path(&self.path);
        let mut state = self.state.write();
        match found {
            Some(id) => {
                if state.binding != Binding::Real(id) {
                    if let Some(el) = index.get(id) {
                        state.type_name = el.type_name().to_string();
                        state.decorator = el.is_decorator();
                    }
                    state.binding = Binding::Real(id);
                }
            }
            None => {
                if matches!(state.binding, Binding::Real(_)) {
                    state.binding = Binding::fresh_virtual();
                }
            }
        }
        state.binding.clone()
    }

    /// Turns the handle virtual, remembering the value it had.
    pub(crate) fn make_virtual(&self, last_value: Option<Value>, last_modified: i64) {
        self.state.write().binding = Binding::Virtual {
            last_value,
            last_modified,
        };
    }

    pub(crate) fn set_declared(&self, type_name: &str, decorator: bool) {
        let mut state = self.state.write();
        state.type_name = type_name.to_string();
        state.decorator = decorator;
    }
}
