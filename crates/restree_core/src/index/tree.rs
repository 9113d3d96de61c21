//! The authoritative in-memory resource tree.

use super::alias::AliasIndex;
use super::dirty::DirtyTracker;
use super::sequence::IdSequence;
use crate::element::{Children, ElementKind, TreeElement};
use crate::error::{CoreError, CoreResult};
use crate::schema::SchemaRegistry;
use crate::types::{ResourceId, TypeKey};
use crate::value::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// A node removed by [`ResourceIndex::delete_resource`], as it was just
/// before removal.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedElement {
    /// Id the node had.
    pub id: ResourceId,
    /// Path the node had.
    pub path: String,
    /// Schema type.
    pub type_name: String,
    /// Whether it was a decorator.
    pub decorator: bool,
    /// Whether it was a reference.
    pub reference: bool,
    /// Last value; `None` for references.
    pub value: Option<Value>,
    /// Last write time.
    pub last_modified: i64,
}

/// Everything a delete removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deletion {
    /// The deleted node and its descendants, parents before children.
    pub removed: Vec<RemovedElement>,
    /// References outside the subtree that pointed into it.
    pub dangling: Vec<RemovedElement>,
}

/// Validates a single path segment.
pub(crate) fn validate_name(name: &str) -> CoreResult<()> {
    if name.is_empty() {
        return Err(CoreError::invalid_path(name, "empty name"));
    }
    if name.contains('/') || name.chars().any(char::is_whitespace) {
        return Err(CoreError::invalid_path(
            name,
            "names may not contain '/' or whitespace",
        ));
    }
    Ok(())
}

/// Real resources and the maps over them.
///
/// Maintains id→node, toplevel name→node, type→ids and app→ids, plus the
/// reverse alias index. Every mutation keeps all of them in step and marks
/// the [`DirtyTracker`]. Not synchronized itself: the overlay owns it behind
/// a lock.
#[derive(Debug)]
pub struct ResourceIndex {
    schema: Arc<SchemaRegistry>,
    elements: HashMap<ResourceId, TreeElement>,
    roots: Children,
    by_type: HashMap<String, BTreeSet<ResourceId>>,
    by_app: HashMap<String, BTreeSet<ResourceId>>,
    aliases: AliasIndex,
    ids: IdSequence,
    dirty: DirtyTracker,
}

impl ResourceIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self {
            schema,
            elements: HashMap::new(),
            roots: Children::default(),
            by_type: HashMap::new(),
            by_app: HashMap::new(),
            aliases: AliasIndex::default(),
            ids: IdSequence::default(),
            dirty: DirtyTracker::default(),
        }
    }

    /// The schema the index validates against.
    #[must_use]
    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    /// Pending changes for the next flush.
    #[must_use]
    pub fn dirty(&self) -> &DirtyTracker {
        &self.dirty
    }

    /// The id sequence.
    #[must_use]
    pub fn ids(&self) -> IdSequence {
        self.ids
    }

    /// Number of real nodes, references included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns `true` if the tree is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Looks up a node.
    #[must_use]
    pub fn get(&self, id: ResourceId) -> Option<&TreeElement> {
        self.elements.get(&id)
    }

    /// Returns `true` if `id` is a real node.
    #[must_use]
    pub fn contains(&self, id: ResourceId) -> bool {
        self.elements.contains_key(&id)
    }

    /// Follows a reference to its target; other ids map to themselves.
    #[must_use]
    pub fn resolve(&self, id: ResourceId) -> ResourceId {
        match self.elements.get(&id).map(|e| &e.kind) {
            Some(ElementKind::Reference(target)) => *target,
            _ => id,
        }
    }

    /// Toplevel resource by name.
    #[must_use]
    pub fn toplevel(&self, name: &str) -> Option<ResourceId> {
        self.roots.get(name)
    }

    /// All toplevel resources in creation order.
    #[must_use]
    pub fn toplevels(&self) -> Vec<ResourceId> {
        self.roots.ids()
    }

    /// Child `name` of `parent`, looking through a reference parent.
    #[must_use]
    pub fn child(&self, parent: ResourceId, name: &str) -> Option<ResourceId> {
        let container = self.resolve(parent);
        self.elements.get(&container)?.children.get(name)
    }

    /// Children of `parent` in insertion order, looking through references.
    #[must_use]
    pub fn children(&self, parent: ResourceId) -> Vec<ResourceId> {
        let container = self.resolve(parent);
        self.elements
            .get(&container)
            .map(|e| e.children.ids())
            .unwrap_or_default()
    }

    /// Reference nodes aliasing `target`.
    #[must_use]
    pub fn references_to(&self, target: ResourceId) -> Vec<ResourceId> {
        self.aliases.references_to(target)
    }

    /// Non-reference resources whose type is `type_name` or, with
    /// `include_subtypes`, any type extending it.
    #[must_use]
    pub fn resources_of_type(&self, type_name: &str, include_subtypes: bool) -> Vec<ResourceId> {
        let mut out: Vec<ResourceId> = if include_subtypes {
            self.by_type
                .iter()
                .filter(|(t, _)| self.schema.is_assignable(type_name, t))
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect()
        } else {
            self.by_type
                .get(type_name)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default()
        };
        out.sort();
        out
    }

    /// Toplevel resources owned by an application.
    #[must_use]
    pub fn resources_of_app(&self, app_id: &str) -> Vec<ResourceId> {
        self.by_app
            .get(app_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Storage path of a node: names from the toplevel down, joined by `/`.
    #[must_use]
    pub fn path_of(&self, id: ResourceId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            let el = self.elements.get(&cur)?;
            names.push(el.name.as_str());
            current = el.parent;
        }
        names.reverse();
        Some(names.join("/"))
    }

    /// Finds the node at `path`, following references on the way down.
    ///
    /// The last segment is not resolved, so a path ending in a reference
    /// returns the reference node itself.
    #[must_use]
    pub fn resolve_path(&self, path: &str) -> Option<ResourceId> {
        let mut segments = path.trim_matches('/').split('/');
        let mut current = self.roots.get(segments.next()?)?;
        for segment in segments {
            current = self.child(current, segment)?;
        }
        Some(current)
    }

    /// Nodes in parents-before-children order, starting from the toplevels.
    #[must_use]
    pub fn walk(&self) -> Vec<&TreeElement> {
        let mut out = Vec::with_capacity(self.elements.len());
        let mut queue: std::collections::VecDeque<ResourceId> = self.roots.ids().into();
        while let Some(id) = queue.pop_front() {
            if let Some(el) = self.elements.get(&id) {
                queue.extend(el.children.ids());
                out.push(el);
            }
        }
        out
    }

    fn type_key_of(&self, type_name: &str) -> CoreResult<TypeKey> {
        self.schema
            .type_key(type_name)
            .ok_or_else(|| CoreError::invalid_type(format!("unknown type {type_name}")))
    }

    fn register(&mut self, el: TreeElement) -> ResourceId {
        let id = el.id;
        match el.parent {
            Some(parent) => {
                if let Some(p) = self.elements.get_mut(&parent) {
                    p.children.insert(&el.name, id);
                }
            }
            None => self.roots.insert(&el.name, id),
        }
        match el.kind {
            ElementKind::Reference(target) => self.aliases.add(target, id),
            ElementKind::Data(_) => {
                self.by_type
                    .entry(el.type_name.clone())
                    .or_default()
                    .insert(id);
            }
        }
        if let Some(app) = &el.app_id {
            self.by_app.entry(app.clone()).or_default().insert(id);
        }
        self.ids.observe(id);
        self.elements.insert(id, el);
        self.dirty.mark_structure();
        id
    }

    fn unregister(&mut self, id: ResourceId) -> Option<TreeElement> {
        let el = self.elements.remove(&id)?;
        match el.kind {
            ElementKind::Reference(target) => self.aliases.remove(target, id),
            ElementKind::Data(_) => {
                if let Some(ids) = self.by_type.get_mut(&el.type_name) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        self.by_type.remove(&el.type_name);
                    }
                }
            }
        }
        if let Some(app) = &el.app_id {
            if let Some(ids) = self.by_app.get_mut(app) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_app.remove(app);
                }
            }
        }
        self.dirty.mark_removed(id);
        Some(el)
    }

    fn detach(&mut self, id: ResourceId) {
        let Some(el) = self.elements.get(&id) else {
            return;
        };
        let name = el.name.clone();
        match el.parent {
            Some(parent) => {
                if let Some(p) = self.elements.get_mut(&parent) {
                    p.children.remove(&name);
                }
            }
            None => {
                self.roots.remove(&name);
            }
        }
    }

    /// Creates a toplevel resource owned by `app_id`.
    ///
    /// # Errors
    ///
    /// `InvalidPath` for a bad name, `AlreadyExists` if the name is taken,
    /// `InvalidType` for an unknown type.
    pub fn add_resource(
        &mut self,
        name: &str,
        type_name: &str,
        app_id: &str,
    ) -> CoreResult<ResourceId> {
        validate_name(name)?;
        if self.roots.get(name).is_some() {
            return Err(CoreError::already_exists(name));
        }
        let key = self.type_key_of(type_name)?;
        let id = self.ids.allocate();
        let mut el = TreeElement::new_data(id, name, type_name, key, None, false);
        el.app_id = Some(app_id.to_string());
        Ok(self.register(el))
    }

    /// Checks that a child of `type_name` may live under `container` as
    /// `name`, returning the list element type the new node inherits.
    fn check_child_type(
        &self,
        container: &TreeElement,
        name: &str,
        type_name: &str,
        decorator: bool,
    ) -> CoreResult<Option<String>> {
        if container.type_key == TypeKey::ComplexArr && !decorator {
            let element_type = container.element_type.as_deref().ok_or_else(|| {
                CoreError::invalid_type(format!(
                    "list {} has no element type yet",
                    container.name
                ))
            })?;
            if !self.schema.is_assignable(element_type, type_name) {
                return Err(CoreError::invalid_type(format!(
                    "type {type_name} does not match element type {element_type} of list {}",
                    container.name
                )));
            }
            return Ok(None);
        }
        if decorator {
            return Ok(None);
        }
        let slot = self.schema.slot(&container.type_name, name).ok_or_else(|| {
            CoreError::invalid_type(format!(
                "{name} is not an optional element of {}",
                container.type_name
            ))
        })?;
        if !self.schema.is_assignable(&slot.type_name, type_name) {
            return Err(CoreError::invalid_type(format!(
                "type {type_name} does not match declared type {} of {name}",
                slot.type_name
            )));
        }
        Ok(slot.element_type.clone())
    }

    /// Adds a child below `parent` (or below its target, if it is a
    /// reference).
    ///
    /// Non-decorator children must match a declared slot of the parent type
    /// (or the element type of a list parent). List children inherit the
    /// declared element type of their slot.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing parent, `AlreadyExists` for a taken name,
    /// `InvalidType` for schema violations.
    pub fn add_child(
        &mut self,
        parent: ResourceId,
        name: &str,
        type_name: &str,
        decorator: bool,
    ) -> CoreResult<ResourceId> {
        validate_name(name)?;
        let container_id = self.resolve(parent);
        let container = self
            .elements
            .get(&container_id)
            .ok_or_else(|| CoreError::not_found(parent.to_string()))?;
        if container.children.get(name).is_some() {
            let path = self.path_of(container_id).unwrap_or_default();
            return Err(CoreError::already_exists(format!("{path}/{name}")));
        }
        let key = self.type_key_of(type_name)?;
        let element_type = self.check_child_type(container, name, type_name, decorator)?;

        let id = self.ids.allocate();
        let mut el =
            TreeElement::new_data(id, name, type_name, key, Some(container_id), decorator);
        el.element_type = element_type;
        Ok(self.register(el))
    }

    /// Adds (or retargets) a reference `name` below `parent` aliasing
    /// `target`.
    ///
    /// A reference to a reference stores the final target. A target that is
    /// the container itself or one of its ancestors is rejected, since the
    /// alias would make the container reachable from inside itself.
    ///
    /// # Errors
    ///
    /// `NotFound`, `InvalidReference`, `InvalidType`, or `AlreadyExists` if
    /// a non-reference child holds the name.
    pub fn add_reference(
        &mut self,
        parent: ResourceId,
        name: &str,
        target: ResourceId,
        decorator: bool,
    ) -> CoreResult<ResourceId> {
        validate_name(name)?;
        let container_id = self.resolve(parent);
        let target = self.resolve(target);
        let container = self
            .elements
            .get(&container_id)
            .ok_or_else(|| CoreError::not_found(parent.to_string()))?;
        let target_el = self
            .elements
            .get(&target)
            .ok_or_else(|| CoreError::invalid_reference(format!("target {target} does not exist")))?;

        let mut ancestor = Some(container_id);
        while let Some(a) = ancestor {
            if a == target {
                return Err(CoreError::invalid_reference(format!(
                    "{} may not reference its own ancestor {}",
                    name, target_el.name
                )));
            }
            ancestor = self.elements.get(&a).and_then(|e| e.parent);
        }

        let target_type = target_el.type_name.clone();
        let target_key = target_el.type_key;
        let element_type = self.check_child_type(container, name, &target_type, decorator)?;
        let declared_type = if decorator || container.type_key == TypeKey::ComplexArr {
            target_type
        } else {
            self.schema
                .slot(&container.type_name, name)
                .map(|s| s.type_name.clone())
                .unwrap_or(target_type)
        };

        if let Some(existing) = container.children.get(name) {
            let old_target = match self.elements.get(&existing).map(|e| &e.kind) {
                Some(ElementKind::Reference(old)) => *old,
                _ => {
                    let path = self.path_of(existing).unwrap_or_default();
                    return Err(CoreError::already_exists(path));
                }
            };
            self.aliases.remove(old_target, existing);
            self.aliases.add(target, existing);
            if let Some(el) = self.elements.get_mut(&existing) {
                el.kind = ElementKind::Reference(target);
                el.type_key = target_key;
            }
            self.dirty.mark_structure();
            return Ok(existing);
        }

        let id = self.ids.allocate();
        let mut el = TreeElement::new_data(
            id,
            name,
            &declared_type,
            target_key,
            Some(container_id),
            decorator,
        );
        el.kind = ElementKind::Reference(target);
        el.element_type = element_type;
        Ok(self.register(el))
    }

    /// Sets the element type of a resource list.
    ///
    /// # Errors
    ///
    /// `InvalidType` if the node is not a list, the type is unknown, or the
    /// list already holds children of another element type.
    pub fn set_element_type(&mut self, list: ResourceId, element_type: &str) -> CoreResult<()> {
        self.type_key_of(element_type)?;
        let list = self.resolve(list);
        let el = self
            .elements
            .get(&list)
            .ok_or_else(|| CoreError::not_found(list.to_string()))?;
        if el.type_key != TypeKey::ComplexArr {
            return Err(CoreError::invalid_type(format!("{} is not a list", el.name)));
        }
        match el.element_type.as_deref() {
            Some(current) if current == element_type => return Ok(()),
            Some(current) if !el.children.is_empty() => {
                return Err(CoreError::invalid_type(format!(
                    "list {} already holds elements of type {current}",
                    el.name
                )))
            }
            _ => {}
        }
        if let Some(el) = self.elements.get_mut(&list) {
            el.element_type = Some(element_type.to_string());
        }
        self.dirty.mark_structure();
        Ok(())
    }

    /// Deletes a node.
    ///
    /// A reference loses only itself. A data node loses its whole subtree,
    /// and every reference elsewhere that points into the subtree is removed
    /// as well.
    ///
    /// # Errors
    ///
    /// `NotFound` if `id` is not a real node.
    pub fn delete_resource(&mut self, id: ResourceId) -> CoreResult<Deletion> {
        let el = self
            .elements
            .get(&id)
            .ok_or_else(|| CoreError::not_found(id.to_string()))?;

        let mut order = Vec::new();
        let mut stack = vec![id];
        if el.is_reference() {
            stack.clear();
            order.push(id);
        }
        while let Some(cur) = stack.pop() {
            order.push(cur);
            if let Some(e) = self.elements.get(&cur) {
                if !e.is_reference() {
                    stack.extend(e.children.ids().into_iter().rev());
                }
            }
        }

        let in_subtree: HashSet<ResourceId> = order.iter().copied().collect();
        let mut dangling_ids = Vec::new();
        for node in &order {
            for alias in self.aliases.references_to(*node) {
                if !in_subtree.contains(&alias) && !dangling_ids.contains(&alias) {
                    dangling_ids.push(alias);
                }
            }
        }

        let deletion = Deletion {
            removed: order.iter().filter_map(|i| self.snapshot(*i)).collect(),
            dangling: dangling_ids.iter().filter_map(|i| self.snapshot(*i)).collect(),
        };

        self.detach(id);
        for alias in &dangling_ids {
            self.detach(*alias);
            self.unregister(*alias);
        }
        for node in order.iter().rev() {
            self.unregister(*node);
        }
        Ok(deletion)
    }

    fn snapshot(&self, id: ResourceId) -> Option<RemovedElement> {
        let el = self.elements.get(&id)?;
        Some(RemovedElement {
            id,
            path: self.path_of(id)?,
            type_name: el.type_name.clone(),
            decorator: el.decorator,
            reference: el.is_reference(),
            value: el.value().cloned(),
            last_modified: el.last_modified,
        })
    }

    /// Current value of a node, looking through references.
    #[must_use]
    pub fn value(&self, id: ResourceId) -> Option<&Value> {
        self.elements.get(&self.resolve(id))?.value()
    }

    /// Writes a value, looking through references, and returns the old one.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing node, `InvalidType` if the value's key
    /// differs from the node's.
    pub fn set_value(
        &mut self,
        id: ResourceId,
        value: Value,
        timestamp: i64,
    ) -> CoreResult<Value> {
        let target = self.resolve(id);
        let el = self
            .elements
            .get_mut(&target)
            .ok_or_else(|| CoreError::not_found(id.to_string()))?;
        if value.type_key() != el.type_key || !el.type_key.has_value() {
            return Err(CoreError::invalid_type(format!(
                "cannot store {} in {} ({})",
                value.type_key(),
                el.name,
                el.type_key
            )));
        }
        let ElementKind::Data(slot) = &mut el.kind else {
            return Err(CoreError::illegal_state("reference resolved to a reference"));
        };
        let old = std::mem::replace(slot, value);
        el.last_modified = timestamp;
        self.dirty.mark_value(target);
        Ok(old)
    }

    /// Sets the active flag of a node (of the target, for references).
    /// Returns the previous flag.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing node.
    pub fn set_active(&mut self, id: ResourceId, active: bool) -> CoreResult<bool> {
        let target = self.resolve(id);
        let el = self
            .elements
            .get_mut(&target)
            .ok_or_else(|| CoreError::not_found(id.to_string()))?;
        let previous = el.active;
        if previous != active {
            el.active = active;
            self.dirty.mark_structure();
        }
        Ok(previous)
    }

    /// Returns the active flag, looking through references.
    #[must_use]
    pub fn is_active(&self, id: ResourceId) -> bool {
        self.elements
            .get(&self.resolve(id))
            .is_some_and(|e| e.active)
    }

    /// Inserts a node read back from storage. Parents must come first.
    ///
    /// # Errors
    ///
    /// `Corruption` if the parent is unknown or the name is taken.
    pub(crate) fn insert_recovered(&mut self, el: TreeElement) -> CoreResult<()> {
        let taken = match el.parent {
            Some(parent) => self
                .elements
                .get(&parent)
                .ok_or_else(|| {
                    CoreError::corruption(format!("{} has unknown parent {parent}", el.id))
                })?
                .children
                .get(&el.name)
                .is_some(),
            None => self.roots.get(&el.name).is_some(),
        };
        if taken || self.elements.contains_key(&el.id) {
            return Err(CoreError::corruption(format!(
                "duplicate node {} ({})",
                el.name, el.id
            )));
        }
        self.register(el);
        Ok(())
    }

    /// Drops recovered references whose target did not survive, returning
    /// how many were dropped.
    pub(crate) fn prune_dangling_references(&mut self) -> usize {
        let dangling: Vec<ResourceId> = self
            .elements
            .values()
            .filter_map(|e| match e.kind {
                ElementKind::Reference(target) if !self.elements.contains_key(&target) => {
                    Some(e.id)
                }
                _ => None,
            })
            .collect();
        for id in &dangling {
            tracing::warn!(%id, "dropping recovered reference without target");
            self.detach(*id);
            self.unregister(*id);
        }
        dangling.len()
    }

    /// Restores the id sequence read from storage.
    pub(crate) fn restore_ids(&mut self, next: u32) {
        let mut ids = IdSequence::starting_at(next);
        for id in self.elements.keys() {
            ids.observe(*id);
        }
        self.ids = ids;
    }

    /// Keeps `id` out of future allocations.
    pub(crate) fn reserve_id(&mut self, id: ResourceId) {
        self.ids.observe(id);
    }
}
