//! Virtual/real overlay over the resource index.
//!
//! Callers never hold tree elements directly. They hold [`NodeHandle`]s,
//! one per navigated path, which are bound either to a real element or to a
//! virtual placeholder known from the schema. [`VirtualResourceDb`] creates
//! handles, materializes virtual ones and turns deleted subtrees back into
//! placeholders.
//!
//! Nothing here takes the [`ResourceLock`] on its own. Callers hold it
//! shared for reads and exclusively for [`VirtualResourceDb::materialize`],
//! [`VirtualResourceDb::delete`] and the reference operations.

mod cache;
mod handle;

pub use cache::NodeCache;
pub use handle::{Binding, NodeHandle};

use crate::error::{CoreError, CoreResult};
use crate::index::{validate_name, Deletion, ResourceIndex};
use crate::lock::ResourceLock;
use crate::types::{ResourceId, TypeKey};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// Result of materializing a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    /// Id the handle is bound to now.
    pub id: ResourceId,
    /// Nodes created on the way, parents first. Empty if the handle was
    /// already real.
    pub created: Vec<ResourceId>,
}

/// Result of turning a handle into a reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Referenced {
    /// Id of the reference node.
    pub id: ResourceId,
    /// Ancestors created for it.
    pub created: Vec<ResourceId>,
    /// The data node that held the name before, if one had to go.
    pub replaced: Option<Deletion>,
}

/// The resource tree as callers see it.
#[derive(Debug)]
pub struct VirtualResourceDb {
    index: RwLock<ResourceIndex>,
    cache: NodeCache,
    lock: ResourceLock,
}

impl VirtualResourceDb {
    /// Wraps an index.
    #[must_use]
    pub fn new(index: ResourceIndex, cache_capacity: usize) -> Self {
        Self {
            index: RwLock::new(index),
            cache: NodeCache::new(cache_capacity.max(1)),
            lock: ResourceLock::new(),
        }
    }

    /// The resource lock of this tree.
    #[must_use]
    pub fn lock(&self) -> &ResourceLock {
        &self.lock
    }

    /// Read access to the index.
    pub fn index(&self) -> RwLockReadGuard<'_, ResourceIndex> {
        self.index.read()
    }

    pub(crate) fn index_mut(&self) -> RwLockWriteGuard<'_, ResourceIndex> {
        self.index.write()
    }

    /// The handle cache.
    #[must_use]
    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    /// Enters a (possibly nested) transaction and returns its depth.
    ///
    /// # Errors
    ///
    /// [`CoreError::IllegalState`] if the thread holds only the shared lock.
    pub fn start_transaction(&self) -> CoreResult<usize> {
        let depth = self.lock.enter_write()?;
        if depth == 1 {
            tracing::trace!("outermost transaction started");
        }
        Ok(depth)
    }

    /// Leaves a transaction and returns the remaining depth. At 0 the
    /// exclusive lock is released.
    ///
    /// # Errors
    ///
    /// [`CoreError::IllegalState`] without a matching start.
    pub fn finish_transaction(&self) -> CoreResult<usize> {
        let remaining = self.lock.exit_write()?;
        if remaining == 0 {
            tracing::trace!("outermost transaction finished");
        }
        Ok(remaining)
    }

    /// Rebinds a handle to the current index state.
    pub fn refresh(&self, handle: &NodeHandle) -> Binding {
        handle.refresh(&self.index.read())
    }

    /// Handle of a toplevel resource, if it is real or already cached.
    #[must_use]
    pub fn toplevel(&self, name: &str) -> Option<Arc<NodeHandle>> {
        let index = self.index.read();
        if let Some(handle) = self.cache.get(name) {
            handle.refresh(&index);
            return Some(handle);
        }
        let id = index.toplevel(name)?;
        Some(self.cached(&index, name.to_string(), name, None, id))
    }

    /// Handle for toplevel `name`, virtual with `type_name` if nothing real
    /// lives there.
    ///
    /// # Errors
    ///
    /// `InvalidPath` for a bad name, `InvalidType` for an unknown type.
    pub fn toplevel_or_virtual(&self, name: &str, type_name: &str) -> CoreResult<Arc<NodeHandle>> {
        validate_name(name)?;
        let index = self.index.read();
        if !index.schema().contains(type_name) {
            return Err(CoreError::invalid_type(format!("unknown type {type_name}")));
        }
        let handle = self.cache.get_or_insert_with(name, || {
            NodeHandle::new(
                name.to_string(),
                name,
                None,
                type_name,
                false,
                Binding::fresh_virtual(),
            )
        });
        if handle.refresh(&index).id().is_none() {
            handle.set_declared(type_name, false);
        }
        Ok(handle)
    }

    fn cached(
        &self,
        index: &ResourceIndex,
        path: String,
        name: &str,
        parent: Option<Arc<NodeHandle>>,
        id: ResourceId,
    ) -> Arc<NodeHandle> {
        let handle = self.cache.get_or_insert_with(&path, || {
            let (type_name, decorator) = index
                .get(id)
                .map(|el| (el.type_name().to_string(), el.is_decorator()))
                .unwrap_or_default();
            NodeHandle::new(
                path.clone(),
                name,
                parent,
                &type_name,
                decorator,
                Binding::Real(id),
            )
        });
        handle.refresh(index);
        handle
    }

    /// Child `name` of `parent`: the real child if there is one, otherwise a
    /// virtual handle for a declared slot of the parent's type, otherwise a
    /// previously requested virtual decorator. `None` if the name is unknown.
    ///
    /// # Errors
    ///
    /// `InvalidPath` for a bad name.
    pub fn child(
        &self,
        parent: &Arc<NodeHandle>,
        name: &str,
    ) -> CoreResult<Option<Arc<NodeHandle>>> {
        validate_name(name)?;
        let index = self.index.read();
        let path = format!("{}/{}", parent.path(), name);
        let parent_binding = parent.refresh(&index);

        if let Some(id) = parent_binding.id().and_then(|pid| index.child(pid, name)) {
            return Ok(Some(self.cached(
                &index,
                path,
                name,
                Some(Arc::clone(parent)),
                id,
            )));
        }
        if let Some(handle) = self.cache.get(&path) {
            handle.refresh(&index);
            return Ok(Some(handle));
        }
        let parent_type = parent.type_name();
        let Some(slot) = index.schema().slot(&parent_type, name) else {
            return Ok(None);
        };
        let type_name = slot.type_name.clone();
        Ok(Some(self.cache.get_or_insert_with(&path, || {
            NodeHandle::new(
                path.clone(),
                name,
                Some(Arc::clone(parent)),
                &type_name,
                false,
                Binding::fresh_virtual(),
            )
        })))
    }

    /// Child `name` of `parent` with the given type. Returns the existing
    /// child if its type fits, otherwise a virtual decorator (or a virtual
    /// declared child, if the parent type declares `name`).
    ///
    /// # Errors
    ///
    /// `InvalidType` if the existing child or the declared slot has an
    /// incompatible type, or the type is unknown.
    pub fn child_as(
        &self,
        parent: &Arc<NodeHandle>,
        name: &str,
        type_name: &str,
    ) -> CoreResult<Arc<NodeHandle>> {
        if let Some(existing) = self.child(parent, name)? {
            let existing_type = existing.type_name();
            let index = self.index.read();
            if index.schema().is_assignable(type_name, &existing_type) {
                return Ok(existing);
            }
            if existing.binding().id().is_none()
                && index.schema().is_assignable(&existing_type, type_name)
                && !existing.is_decorator()
            {
                existing.set_declared(type_name, false);
                return Ok(existing);
            }
            return Err(CoreError::invalid_type(format!(
                "{} has type {existing_type}, requested {type_name}",
                existing.path()
            )));
        }
        let index = self.index.read();
        if !index.schema().contains(type_name) {
            return Err(CoreError::invalid_type(format!("unknown type {type_name}")));
        }
        let path = format!("{}/{}", parent.path(), name);
        Ok(self.cache.get_or_insert_with(&path, || {
            NodeHandle::new(
                path.clone(),
                name,
                Some(Arc::clone(parent)),
                type_name,
                true,
                Binding::fresh_virtual(),
            )
        }))
    }

    /// Real children of a handle, as handles below its path.
    #[must_use]
    pub fn children(&self, parent: &Arc<NodeHandle>) -> Vec<Arc<NodeHandle>> {
        let index = self.index.read();
        let Some(pid) = parent.refresh(&index).id() else {
            return Vec::new();
        };
        let container = index.resolve(pid);
        let Some(el) = index.get(container) else {
            return Vec::new();
        };
        el.children()
            .iter()
            .map(|(name, id)| {
                self.cached(
                    &index,
                    format!("{}/{}", parent.path(), name),
                    name,
                    Some(Arc::clone(parent)),
                    id,
                )
            })
            .collect()
    }

    /// Resolves a `/`-separated path to a handle. `None` if the toplevel is
    /// unknown or a segment is neither real, declared nor cached.
    ///
    /// # Errors
    ///
    /// `InvalidPath` for malformed paths.
    pub fn resolve(&self, path: &str) -> CoreResult<Option<Arc<NodeHandle>>> {
        let trimmed = path.trim_matches('/');
        let mut segments = trimmed.split('/');
        let first = segments.next().unwrap_or_default();
        validate_name(first)?;
        let Some(mut current) = self.toplevel(first) else {
            return Ok(None);
        };
        for segment in segments {
            match self.child(&current, segment)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Makes a handle real, materializing virtual ancestors first.
    ///
    /// The caller must hold the exclusive lock. If a step fails, nodes
    /// created before it are removed again.
    ///
    /// # Errors
    ///
    /// Errors of [`ResourceIndex::add_resource`] and
    /// [`ResourceIndex::add_child`].
    pub fn materialize(&self, handle: &Arc<NodeHandle>, app_id: &str) -> CoreResult<Materialized> {
        let mut index = self.index.write();
        let mut created = Vec::new();
        match Self::materialize_locked(&mut index, handle, app_id, &mut created) {
            Ok(id) => Ok(Materialized { id, created }),
            Err(e) => {
                for id in created.iter().rev() {
                    if index.contains(*id) {
                        if let Err(undo) = index.delete_resource(*id) {
                            tracing::warn!(%id, error = %undo, "failed to undo partial create");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    fn materialize_locked(
        index: &mut ResourceIndex,
        handle: &Arc<NodeHandle>,
        app_id: &str,
        created: &mut Vec<ResourceId>,
    ) -> CoreResult<ResourceId> {
        if let Binding::Real(id) = handle.refresh(index) {
            return Ok(id);
        }
        let type_name = handle.type_name();
        let id = match handle.parent() {
            None => index.add_resource(handle.name(), &type_name, app_id)?,
            Some(parent) => {
                let pid = Self::materialize_locked(index, parent, app_id, created)?;
                index.add_child(pid, handle.name(), &type_name, handle.is_decorator())?
            }
        };
        created.push(id);
        handle.refresh(index);
        Ok(id)
    }

    /// Deletes what a handle is bound to and virtualizes every cached
    /// handle that saw a removed node. Returns `None` for virtual handles.
    ///
    /// The caller must hold the exclusive lock.
    ///
    /// # Errors
    ///
    /// Errors of [`ResourceIndex::delete_resource`].
    pub fn delete(&self, handle: &NodeHandle) -> CoreResult<Option<Deletion>> {
        let mut index = self.index.write();
        let Binding::Real(id) = handle.refresh(&index) else {
            return Ok(None);
        };
        self.delete_locked(&mut index, id).map(Some)
    }

    fn delete_locked(&self, index: &mut ResourceIndex, id: ResourceId) -> CoreResult<Deletion> {
        let deletion = index.delete_resource(id)?;
        let gone: HashMap<ResourceId, _> = deletion
            .removed
            .iter()
            .chain(deletion.dangling.iter())
            .map(|r| (r.id, r))
            .collect();
        for cached in self.cache.handles() {
            match cached.binding().id().and_then(|bound| gone.get(&bound)) {
                Some(removed) => cached.make_virtual(removed.value.clone(), removed.last_modified),
                None => {
                    cached.refresh(index);
                }
            }
        }
        tracing::debug!(
            %id,
            removed = deletion.removed.len(),
            dangling = deletion.dangling.len(),
            "deleted subtree"
        );
        Ok(deletion)
    }

    /// Turns `handle` into a reference to `target`, materializing its
    /// parent first. A data node at the handle's path is deleted first.
    ///
    /// The caller must hold the exclusive lock.
    ///
    /// # Errors
    ///
    /// `VirtualResource` if the target is virtual, `InvalidReference` for
    /// toplevel handles and for targets inside the node being replaced,
    /// plus the errors of [`ResourceIndex::add_reference`].
    pub fn set_reference(
        &self,
        handle: &Arc<NodeHandle>,
        target: &Arc<NodeHandle>,
        app_id: &str,
    ) -> CoreResult<Referenced> {
        let mut index = self.index.write();
        let Binding::Real(target_id) = target.refresh(&index) else {
            return Err(CoreError::virtual_resource(target.path()));
        };
        let parent = handle.parent().ok_or_else(|| {
            CoreError::invalid_reference(format!(
                "toplevel resource {} cannot be a reference",
                handle.path()
            ))
        })?;
        let target_id = index.resolve(target_id);

        let mut created = Vec::new();
        let parent_id = Self::materialize_locked(&mut index, parent, app_id, &mut created)?;

        let mut replaced = None;
        if let Some(existing) = index.child(parent_id, handle.name()) {
            let is_reference = index.get(existing).is_some_and(|e| e.is_reference());
            if !is_reference {
                if Self::is_within(&index, target_id, existing) {
                    return Err(CoreError::invalid_reference(format!(
                        "{} cannot reference a node inside itself",
                        handle.path()
                    )));
                }
                replaced = Some(self.delete_locked(&mut index, existing)?);
            }
        }
        let id = index.add_reference(parent_id, handle.name(), target_id, handle.is_decorator())?;
        handle.refresh(&index);
        Ok(Referenced {
            id,
            created,
            replaced,
        })
    }

    fn is_within(index: &ResourceIndex, node: ResourceId, ancestor: ResourceId) -> bool {
        let mut current = Some(node);
        while let Some(cur) = current {
            if cur == ancestor {
                return true;
            }
            current = index.get(cur).and_then(|e| e.parent());
        }
        false
    }

    /// Adds a new element to a resource list, materializing the list first.
    /// Elements are named `<list>_<n>` with the smallest free `n`.
    ///
    /// The caller must hold the exclusive lock.
    ///
    /// # Errors
    ///
    /// `InvalidType` if the handle is not a list or has no element type.
    pub fn add_list_element(
        &self,
        list: &Arc<NodeHandle>,
        app_id: &str,
    ) -> CoreResult<(Arc<NodeHandle>, Materialized)> {
        let (name, path, element_type, mut created) = {
            let mut index = self.index.write();
            let mut created = Vec::new();
            let list_id = Self::materialize_locked(&mut index, list, app_id, &mut created)?;
            let container = index.resolve(list_id);
            let el = index
                .get(container)
                .ok_or_else(|| CoreError::not_found(list.path()))?;
            if el.type_key() != TypeKey::ComplexArr {
                return Err(CoreError::invalid_type(format!("{} is not a list", list.path())));
            }
            let element_type = el.element_type().map(str::to_string).ok_or_else(|| {
                CoreError::invalid_type(format!("list {} has no element type", list.path()))
            })?;
            let name = (0..)
                .map(|n| format!("{}_{n}", list.name()))
                .find(|candidate| el.children().get(candidate).is_none())
                .unwrap_or_default();
            let path = format!("{}/{}", list.path(), name);
            (name, path, element_type, created)
        };
        let handle = self.cache.get_or_insert_with(&path, || {
            NodeHandle::new(
                path.clone(),
                &name,
                Some(Arc::clone(list)),
                &element_type,
                false,
                Binding::fresh_virtual(),
            )
        });
        let done = self.materialize(&handle, app_id)?;
        created.extend(done.created);
        Ok((
            handle,
            Materialized {
                id: done.id,
                created,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{builtin, SchemaRegistry, TypeDef};
    use crate::value::Value;

    fn overlay() -> VirtualResourceDb {
        let mut schema = SchemaRegistry::new();
        schema
            .register(TypeDef::new("GeographicLocation").slot("latitude", builtin::FLOAT))
            .unwrap();
        schema
            .register(TypeDef::new("Location").slot("geographicLocation", "GeographicLocation"))
            .unwrap();
        schema
            .register(
                TypeDef::new("PhysicalElement")
                    .slot("location", "Location")
                    .list_slot("readings", builtin::FLOAT),
            )
            .unwrap();
        VirtualResourceDb::new(ResourceIndex::new(Arc::new(schema)), 64)
    }

    #[test]
    fn navigating_declared_slots_yields_virtual_handles() {
        let db = overlay();
        let pe = db.toplevel_or_virtual("pe", "PhysicalElement").unwrap();
        let lat = db
            .child(&pe, "location")
            .unwrap()
            .and_then(|loc| db.child(&loc, "geographicLocation").unwrap())
            .and_then(|geo| db.child(&geo, "latitude").unwrap())
            .unwrap();
        assert_eq!(lat.path(), "pe/location/geographicLocation/latitude");
        assert_eq!(lat.type_name(), builtin::FLOAT);
        assert!(db.refresh(&lat).id().is_none());
        assert!(db.child(&pe, "undeclared").unwrap().is_none());
        assert!(db.index().is_empty());
    }

    #[test]
    fn materialize_creates_ancestors_and_keeps_handles() {
        let db = overlay();
        let pe = db.toplevel_or_virtual("pe", "PhysicalElement").unwrap();
        let loc = db.child(&pe, "location").unwrap().unwrap();
        let geo = db.child(&loc, "geographicLocation").unwrap().unwrap();

        let done = db.materialize(&geo, "app").unwrap();
        assert_eq!(done.created.len(), 3);
        assert!(db.refresh(&pe).id().is_some());
        assert!(db.refresh(&loc).id().is_some());
        assert_eq!(db.refresh(&geo).id(), Some(done.id));

        let again = db.resolve("pe/location/geographicLocation").unwrap().unwrap();
        assert!(Arc::ptr_eq(&again, &geo));
        assert!(db.materialize(&geo, "app").unwrap().created.is_empty());
    }

    #[test]
    fn delete_virtualizes_subtree_with_last_values() {
        let db = overlay();
        let pe = db.toplevel_or_virtual("pe", "PhysicalElement").unwrap();
        let loc = db.child(&pe, "location").unwrap().unwrap();
        let geo = db.child(&loc, "geographicLocation").unwrap().unwrap();
        let lat = db.child(&geo, "latitude").unwrap().unwrap();
        let lat_id = db.materialize(&lat, "app").unwrap().id;
        db.index_mut().set_value(lat_id, Value::Float(48.1), 7).unwrap();

        let deletion = db.delete(&loc).unwrap().unwrap();
        assert_eq!(deletion.removed.len(), 3);
        assert!(db.refresh(&pe).id().is_some());
        assert_eq!(
            db.refresh(&lat),
            Binding::Virtual {
                last_value: Some(Value::Float(48.1)),
                last_modified: 7
            }
        );
        assert!(db.delete(&loc).unwrap().is_none());
    }

    #[test]
    fn reference_replaces_data_child_and_delete_removes_only_alias() {
        let db = overlay();
        let pe = db.toplevel_or_virtual("pe", "PhysicalElement").unwrap();
        let pe2 = db.toplevel_or_virtual("pe2", "PhysicalElement").unwrap();
        let loc = db.child(&pe, "location").unwrap().unwrap();
        let loc2 = db.child(&pe2, "location").unwrap().unwrap();
        db.materialize(&loc, "app").unwrap();
        db.materialize(&loc2, "app").unwrap();

        let referenced = db.set_reference(&loc2, &loc, "app").unwrap();
        assert!(referenced.replaced.is_some());
        assert!(db.index().get(referenced.id).unwrap().is_reference());

        let geo_via_alias = db.child(&loc2, "geographicLocation").unwrap().unwrap();
        db.materialize(&geo_via_alias, "app").unwrap();
        assert!(db
            .index()
            .resolve_path("pe/location/geographicLocation")
            .is_some());

        db.delete(&loc2).unwrap();
        assert!(db.refresh(&loc2).id().is_none());
        assert!(db.refresh(&geo_via_alias).id().is_none());
        assert!(db.refresh(&loc).id().is_some());
    }

    #[test]
    fn set_reference_rejects_virtual_target() {
        let db = overlay();
        let pe = db.toplevel_or_virtual("pe", "PhysicalElement").unwrap();
        let loc = db.child(&pe, "location").unwrap().unwrap();
        let pe2 = db.toplevel_or_virtual("pe2", "PhysicalElement").unwrap();
        let loc2 = db.child(&pe2, "location").unwrap().unwrap();
        assert!(matches!(
            db.set_reference(&loc2, &loc, "app"),
            Err(CoreError::VirtualResource { .. })
        ));
    }

    #[test]
    fn list_elements_get_free_names() {
        let db = overlay();
        let pe = db.toplevel_or_virtual("pe", "PhysicalElement").unwrap();
        let readings = db.child(&pe, "readings").unwrap().unwrap();

        let (first, _) = db.add_list_element(&readings, "app").unwrap();
        let (second, _) = db.add_list_element(&readings, "app").unwrap();
        assert_eq!(first.path(), "pe/readings/readings_0");
        assert_eq!(second.path(), "pe/readings/readings_1");
        assert_eq!(db.children(&readings).len(), 2);

        db.delete(&first).unwrap();
        let (third, _) = db.add_list_element(&readings, "app").unwrap();
        assert!(Arc::ptr_eq(&third, &first));
        assert!(db.refresh(&third).id().is_some());
    }

    #[test]
    fn nested_transactions_count_depth() {
        let db = overlay();
        assert_eq!(db.start_transaction().unwrap(), 1);
        assert_eq!(db.start_transaction().unwrap(), 2);
        assert_eq!(db.finish_transaction().unwrap(), 1);
        assert_eq!(db.finish_transaction().unwrap(), 0);
        assert!(matches!(
            db.finish_transaction(),
            Err(CoreError::IllegalState { .. })
        ));
    }
}
