//! Tree elements as stored in the in-memory index.

use crate::types::{ResourceId, TypeKey, NO_TIMESTAMP};
use crate::value::Value;
use std::collections::HashMap;

/// What a node holds: its own value, or an alias to another node.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementKind {
    /// A node owning its value (and, if complex, its children).
    Data(Value),
    /// An alias. Reads, writes and child lookups go to the target.
    Reference(ResourceId),
}

/// Ordered name → id map of a node's children.
///
/// Lookup is by name; listing preserves insertion order.
#[derive(Debug, Clone, Default)]
pub struct Children {
    order: Vec<String>,
    by_name: HashMap<String, ResourceId>,
}

impl Children {
    /// Returns the child id under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ResourceId> {
        self.by_name.get(name).copied()
    }

    /// Inserts or replaces a child, keeping the original position on replace.
    pub(crate) fn insert(&mut self, name: &str, id: ResourceId) {
        if self.by_name.insert(name.to_string(), id).is_none() {
            self.order.push(name.to_string());
        }
    }

    /// Removes a child by name.
    pub(crate) fn remove(&mut self, name: &str) -> Option<ResourceId> {
        let id = self.by_name.remove(name)?;
        self.order.retain(|n| n != name);
        Some(id)
    }

    /// Iterates `(name, id)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ResourceId)> + '_ {
        self.order
            .iter()
            .filter_map(|name| self.by_name.get(name).map(|id| (name.as_str(), *id)))
    }

    /// Child ids in insertion order.
    #[must_use]
    pub fn ids(&self) -> Vec<ResourceId> {
        self.iter().map(|(_, id)| id).collect()
    }

    /// Number of children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if there are no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// A real node of the resource tree.
#[derive(Debug, Clone)]
pub struct TreeElement {
    pub(crate) id: ResourceId,
    pub(crate) name: String,
    pub(crate) type_name: String,
    pub(crate) type_key: TypeKey,
    pub(crate) parent: Option<ResourceId>,
    pub(crate) children: Children,
    pub(crate) kind: ElementKind,
    pub(crate) active: bool,
    pub(crate) decorator: bool,
    pub(crate) app_id: Option<String>,
    pub(crate) last_modified: i64,
    pub(crate) element_type: Option<String>,
}

impl TreeElement {
    pub(crate) fn new_data(
        id: ResourceId,
        name: &str,
        type_name: &str,
        type_key: TypeKey,
        parent: Option<ResourceId>,
        decorator: bool,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            type_name: type_name.to_string(),
            type_key,
            parent,
            children: Children::default(),
            kind: ElementKind::Data(Value::default_for(type_key)),
            active: false,
            decorator,
            app_id: None,
            last_modified: NO_TIMESTAMP,
            element_type: None,
        }
    }

    /// Resource id.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Name among its siblings.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema type name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Storage key.
    #[must_use]
    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    /// Owning parent; `None` for toplevel resources.
    #[must_use]
    pub fn parent(&self) -> Option<ResourceId> {
        self.parent
    }

    /// Owned children. Always empty for references.
    #[must_use]
    pub fn children(&self) -> &Children {
        &self.children
    }

    /// Whether this node is active. References report their own flag,
    /// callers resolve the target when they need its state.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether the node was added outside its parent's declared slots.
    #[must_use]
    pub fn is_decorator(&self) -> bool {
        self.decorator
    }

    /// Whether this node is a toplevel resource.
    #[must_use]
    pub fn is_toplevel(&self) -> bool {
        self.parent.is_none()
    }

    /// Target of a reference node.
    #[must_use]
    pub fn reference_target(&self) -> Option<ResourceId> {
        match self.kind {
            ElementKind::Reference(target) => Some(target),
            ElementKind::Data(_) => None,
        }
    }

    /// Whether this node is a reference.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        self.reference_target().is_some()
    }

    /// The node's own value; `None` for references.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match &self.kind {
            ElementKind::Data(v) => Some(v),
            ElementKind::Reference(_) => None,
        }
    }

    /// Owning application of a toplevel resource.
    #[must_use]
    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    /// Time of the last value write, or [`NO_TIMESTAMP`].
    #[must_use]
    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    /// Element type of a resource list.
    #[must_use]
    pub fn element_type(&self) -> Option<&str> {
        self.element_type.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_keep_insertion_order() {
        let mut children = Children::default();
        children.insert("b", ResourceId::new(2));
        children.insert("a", ResourceId::new(1));
        children.insert("c", ResourceId::new(3));
        children.insert("b", ResourceId::new(4));

        let listed: Vec<_> = children.iter().collect();
        assert_eq!(
            listed,
            vec![
                ("b", ResourceId::new(4)),
                ("a", ResourceId::new(1)),
                ("c", ResourceId::new(3)),
            ]
        );

        assert_eq!(children.remove("a"), Some(ResourceId::new(1)));
        assert_eq!(children.ids(), vec![ResourceId::new(4), ResourceId::new(3)]);
        assert_eq!(children.len(), 2);
        assert!(children.remove("a").is_none());
    }

    #[test]
    fn new_element_is_inactive_with_default_value() {
        let el = TreeElement::new_data(
            ResourceId::new(1),
            "meter",
            "FloatResource",
            TypeKey::Float,
            None,
            false,
        );
        assert!(!el.is_active());
        assert!(el.is_toplevel());
        assert!(!el.is_reference());
        assert_eq!(el.value(), Some(&Value::Float(0.0)));
        assert_eq!(el.last_modified(), NO_TIMESTAMP);
    }
}
