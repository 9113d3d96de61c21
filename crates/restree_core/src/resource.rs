//! Application-facing resources and sessions.

use crate::change_feed::{EventKind, ResourceEvent};
use crate::database::DbInner;
use crate::error::{CoreError, CoreResult};
use crate::index::{Deletion, ResourceIndex};
use crate::overlay::{Binding, NodeHandle, VirtualResourceDb};
use crate::transaction::ResourceTransaction;
use crate::types::{now_millis, AccessMode, ResourceId, NO_TIMESTAMP};
use crate::value::Value;
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// An operation checked against an [`AccessPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Reading a value.
    Read,
    /// Writing a value.
    Write,
    /// Creating a resource.
    Create,
    /// Deleting a resource.
    Delete,
    /// Changing the active flag.
    Activate,
    /// Turning a resource into a reference.
    Reference,
}

/// Capability check consulted by a [`Session`] before every operation.
pub trait AccessPolicy: Send + Sync {
    /// Returns `true` if `app_id` may perform `op` on `path`.
    fn permits(&self, app_id: &str, path: &str, op: Operation) -> bool;
}

impl<F> AccessPolicy for F
where
    F: Fn(&str, &str, Operation) -> bool + Send + Sync,
{
    fn permits(&self, app_id: &str, path: &str, op: Operation) -> bool {
        self(app_id, path, op)
    }
}

/// Policy that permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn permits(&self, _app_id: &str, _path: &str, _op: Operation) -> bool {
        true
    }
}

/// An application's view of the database.
///
/// Carries the app id that owns the toplevel resources it creates, the
/// access policy and per-location access modes. Cloning is cheap and clones
/// share the access modes.
#[derive(Clone)]
pub struct Session {
    pub(crate) db: Arc<DbInner>,
    app_id: Arc<str>,
    policy: Arc<dyn AccessPolicy>,
    modes: Arc<RwLock<BTreeMap<String, AccessMode>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("app_id", &self.app_id)
            .field("modes", &*self.modes.read())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(db: Arc<DbInner>, app_id: &str) -> Self {
        Self {
            db,
            app_id: Arc::from(app_id),
            policy: Arc::new(AllowAll),
            modes: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// The application id.
    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Replaces the access policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the access mode for `path` and everything below it.
    pub fn set_access_mode(&self, path: &str, mode: AccessMode) {
        self.modes
            .write()
            .insert(path.trim_matches('/').to_string(), mode);
    }

    /// Access mode for `path`: the mode set for the nearest enclosing path,
    /// [`AccessMode::Shared`] if none.
    #[must_use]
    pub fn access_mode(&self, path: &str) -> AccessMode {
        let modes = self.modes.read();
        let mut current = path.trim_matches('/');
        loop {
            if let Some(mode) = modes.get(current) {
                return *mode;
            }
            match current.rfind('/') {
                Some(cut) => current = &current[..cut],
                None => return AccessMode::Shared,
            }
        }
    }

    pub(crate) fn check(&self, path: &str, op: Operation) -> CoreResult<()> {
        self.db.ensure_open()?;
        if self.policy.permits(&self.app_id, path, op) {
            Ok(())
        } else {
            Err(CoreError::access_denied(
                path,
                format!("{op:?} not permitted for {}", self.app_id),
            ))
        }
    }

    pub(crate) fn check_mutable(&self, path: &str, op: Operation) -> CoreResult<()> {
        self.check(path, op)?;
        if self.access_mode(path) == AccessMode::ReadOnly {
            return Err(CoreError::access_denied(path, "read-only access"));
        }
        Ok(())
    }

    fn tree(&self) -> &VirtualResourceDb {
        &self.db.tree
    }

    pub(crate) fn wrap(&self, node: Arc<NodeHandle>) -> Resource {
        Resource {
            session: self.clone(),
            node,
        }
    }

    /// Creates toplevel resource `name` unless it exists.
    ///
    /// # Errors
    ///
    /// `InvalidType` if a resource of an incompatible type already lives
    /// there or the type is unknown; `InvalidPath` for bad names.
    pub fn add_resource(&self, name: &str, type_name: &str) -> CoreResult<Resource> {
        let resource = self.toplevel_or_virtual(name, type_name)?;
        if resource.exists() {
            let existing = resource.type_name();
            if !self.db.schema.is_assignable(type_name, &existing) {
                return Err(CoreError::invalid_type(format!(
                    "{name} exists with type {existing}, requested {type_name}"
                )));
            }
            return Ok(resource);
        }
        resource.create()?;
        Ok(resource)
    }

    /// Toplevel `name`, virtual with `type_name` if nothing real lives
    /// there yet.
    ///
    /// # Errors
    ///
    /// `InvalidPath` for bad names, `InvalidType` for unknown types.
    pub fn toplevel_or_virtual(&self, name: &str, type_name: &str) -> CoreResult<Resource> {
        self.db.ensure_open()?;
        let node = {
            let _shared = self.tree().lock().read();
            self.tree().toplevel_or_virtual(name, type_name)?
        };
        Ok(self.wrap(node))
    }

    /// Toplevel resource `name`, if it is real or was navigated before.
    #[must_use]
    pub fn toplevel(&self, name: &str) -> Option<Resource> {
        let _shared = self.tree().lock().read();
        self.tree().toplevel(name).map(|node| self.wrap(node))
    }

    /// Resolves a path. `None` if nothing real, declared or navigated lives
    /// there.
    ///
    /// # Errors
    ///
    /// `InvalidPath` for malformed paths, `DatabaseClosed`.
    pub fn resource(&self, path: &str) -> CoreResult<Option<Resource>> {
        self.db.ensure_open()?;
        let _shared = self.tree().lock().read();
        Ok(self.tree().resolve(path)?.map(|node| self.wrap(node)))
    }

    fn resources_at(&self, ids: Vec<ResourceId>) -> Vec<Resource> {
        let _shared = self.tree().lock().read();
        let paths: Vec<String> = {
            let index = self.tree().index();
            ids.into_iter().filter_map(|id| index.path_of(id)).collect()
        };
        paths
            .iter()
            .filter_map(|path| self.tree().resolve(path).ok().flatten())
            .map(|node| self.wrap(node))
            .collect()
    }

    /// All real toplevel resources.
    #[must_use]
    pub fn toplevel_resources(&self) -> Vec<Resource> {
        let ids = self.tree().index().toplevels();
        self.resources_at(ids)
    }

    /// Real resources of a type, optionally including subtypes.
    #[must_use]
    pub fn resources_of_type(&self, type_name: &str, include_subtypes: bool) -> Vec<Resource> {
        let ids = self
            .tree()
            .index()
            .resources_of_type(type_name, include_subtypes);
        self.resources_at(ids)
    }

    /// Toplevel resources created by this session's application.
    #[must_use]
    pub fn owned_resources(&self) -> Vec<Resource> {
        let ids = self.tree().index().resources_of_app(&self.app_id);
        self.resources_at(ids)
    }

    /// Enters a (possibly nested) transaction. While any transaction is
    /// open on this thread, other threads cannot touch the tree and events
    /// are held back until the outermost one finishes.
    ///
    /// # Errors
    ///
    /// `IllegalState` if the thread holds only the shared lock,
    /// `DatabaseClosed`.
    pub fn start_transaction(&self) -> CoreResult<usize> {
        self.db.ensure_open()?;
        self.db.start_transaction()
    }

    /// Leaves a transaction; see [`Self::start_transaction`].
    ///
    /// # Errors
    ///
    /// `IllegalState` without a matching start.
    pub fn finish_transaction(&self) -> CoreResult<usize> {
        self.db.finish_transaction()
    }

    /// Starts building a composite transaction.
    #[must_use]
    pub fn transaction(&self) -> ResourceTransaction {
        ResourceTransaction::new(self.clone())
    }
}

/// A resource at a path, real or virtual.
///
/// Handles stay valid across deletes and re-creates: a deleted resource
/// reports `exists() == false` and keeps its last value readable until it is
/// created again.
#[derive(Clone)]
pub struct Resource {
    session: Session,
    node: Arc<NodeHandle>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("path", &self.node.path())
            .field("binding", &self.node.binding())
            .finish()
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.node.path())
    }
}

impl Resource {
    fn tree(&self) -> &VirtualResourceDb {
        &self.session.db.tree
    }

    fn binding(&self) -> Binding {
        self.tree().refresh(&self.node)
    }

    /// The session this resource was reached through.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Path the resource was navigated by.
    #[must_use]
    pub fn path(&self) -> &str {
        self.node.path()
    }

    /// Last path segment.
    #[must_use]
    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// Schema type name.
    #[must_use]
    pub fn type_name(&self) -> String {
        self.binding();
        self.node.type_name()
    }

    /// Id of the real node, `None` while virtual.
    #[must_use]
    pub fn id(&self) -> Option<ResourceId> {
        self.binding().id()
    }

    /// Returns `true` if the resource is real.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.id().is_some()
    }

    /// Returns `true` if the resource (or its target) is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let _shared = self.tree().lock().read();
        let index = self.tree().index();
        self.node
            .refresh(&index)
            .id()
            .is_some_and(|id| index.is_active(id))
    }

    /// Returns `true` if the resource was added outside the schema.
    #[must_use]
    pub fn is_decorator(&self) -> bool {
        self.binding();
        self.node.is_decorator()
    }

    /// Returns `true` if the resource is a reference.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        let _shared = self.tree().lock().read();
        let index = self.tree().index();
        self.node
            .refresh(&index)
            .id()
            .and_then(|id| index.get(id))
            .is_some_and(|el| el.is_reference())
    }

    /// Returns `true` for toplevel resources.
    #[must_use]
    pub fn is_toplevel(&self) -> bool {
        self.node.parent().is_none()
    }

    /// Canonical location: the path of the node reads and writes reach
    /// after following references. Virtual resources are at their path.
    #[must_use]
    pub fn location(&self) -> String {
        let _shared = self.tree().lock().read();
        let index = self.tree().index();
        self.node
            .refresh(&index)
            .id()
            .and_then(|id| index.path_of(index.resolve(id)))
            .unwrap_or_else(|| self.node.path().to_string())
    }

    /// Returns `true` if both resources reach the same node.
    #[must_use]
    pub fn equals_location(&self, other: &Resource) -> bool {
        self.location() == other.location()
    }

    /// Returns `true` if both were navigated by the same path.
    #[must_use]
    pub fn equals_path(&self, other: &Resource) -> bool {
        self.path() == other.path()
    }

    /// Application owning the toplevel ancestor.
    #[must_use]
    pub fn owner(&self) -> Option<String> {
        let top = self.path().split('/').next().unwrap_or_default();
        let index = self.tree().index();
        let id = index.toplevel(top)?;
        index.get(id)?.app_id().map(str::to_string)
    }

    /// Parent resource; `None` at the top.
    #[must_use]
    pub fn parent(&self) -> Option<Resource> {
        self.node
            .parent()
            .map(|parent| self.session.wrap(Arc::clone(parent)))
    }

    /// Child `name`: real, declared by the type, or navigated before.
    ///
    /// # Errors
    ///
    /// `InvalidPath` for bad names.
    pub fn child(&self, name: &str) -> CoreResult<Option<Resource>> {
        let _shared = self.tree().lock().read();
        Ok(self
            .tree()
            .child(&self.node, name)?
            .map(|node| self.session.wrap(node)))
    }

    /// Child `name` of type `type_name`, virtual as a decorator unless the
    /// type declares it.
    ///
    /// # Errors
    ///
    /// `InvalidType` for incompatible types.
    pub fn child_as(&self, name: &str, type_name: &str) -> CoreResult<Resource> {
        let _shared = self.tree().lock().read();
        let node = self.tree().child_as(&self.node, name, type_name)?;
        Ok(self.session.wrap(node))
    }

    /// Real children.
    #[must_use]
    pub fn children(&self) -> Vec<Resource> {
        let _shared = self.tree().lock().read();
        self.tree()
            .children(&self.node)
            .into_iter()
            .map(|node| self.session.wrap(node))
            .collect()
    }

    /// Real descendants, breadth first. References are listed but not
    /// descended into.
    #[must_use]
    pub fn sub_resources(&self, recursive: bool) -> Vec<Resource> {
        let mut out = Vec::new();
        let mut frontier = VecDeque::from([self.clone()]);
        while let Some(next) = frontier.pop_front() {
            for child in next.children() {
                if recursive && !child.is_reference() {
                    frontier.push_back(child.clone());
                }
                out.push(child);
            }
        }
        out
    }

    /// Resources referencing this one.
    #[must_use]
    pub fn referencing_resources(&self) -> Vec<Resource> {
        let ids = {
            let index = self.tree().index();
            match self.node.refresh(&index).id() {
                Some(id) => index.references_to(index.resolve(id)),
                None => Vec::new(),
            }
        };
        self.session.resources_at(ids)
    }

    /// Makes the resource real, creating virtual ancestors first. New
    /// resources are inactive.
    ///
    /// # Errors
    ///
    /// `InvalidType` if the schema rejects a node on the way,
    /// `AccessDenied`.
    pub fn create(&self) -> CoreResult<()> {
        self.create_tracked().map(|_| ())
    }

    /// Like [`Self::create`], returning the paths created, parents first.
    pub(crate) fn create_tracked(&self) -> CoreResult<Vec<String>> {
        if self.exists() {
            return Ok(Vec::new());
        }
        self.session.check_mutable(self.path(), Operation::Create)?;
        let events = {
            let _exclusive = self.tree().lock().write()?;
            let done = self.tree().materialize(&self.node, self.session.app_id())?;
            let index = self.tree().index();
            created_events(&index, &done.created)
        };
        let paths = events.iter().map(|e| e.path.clone()).collect();
        self.session.db.publish(events);
        Ok(paths)
    }

    /// Deletes the resource and everything below it. Handles turn virtual
    /// and keep their last values. Deleting a reference removes only the
    /// reference. Deleting a virtual resource does nothing.
    ///
    /// # Errors
    ///
    /// `AccessDenied`.
    pub fn delete(&self) -> CoreResult<()> {
        if !self.exists() {
            return Ok(());
        }
        self.session.check_mutable(self.path(), Operation::Delete)?;
        let deletion = {
            let _exclusive = self.tree().lock().write()?;
            self.tree().delete(&self.node)?
        };
        if let Some(deletion) = deletion {
            self.session.db.publish(deletion_events(&deletion));
        }
        Ok(())
    }

    /// Sets the active flag.
    ///
    /// # Errors
    ///
    /// `VirtualResource` if the resource does not exist, `AccessDenied`.
    pub fn activate(&self, recursive: bool) -> CoreResult<()> {
        self.set_active_tracked(true, recursive).map(|_| ())
    }

    /// Clears the active flag.
    ///
    /// # Errors
    ///
    /// `VirtualResource` if the resource does not exist, `AccessDenied`.
    pub fn deactivate(&self, recursive: bool) -> CoreResult<()> {
        self.set_active_tracked(false, recursive).map(|_| ())
    }

    /// Sets the active flag of the resource and, if `recursive`, of its real
    /// descendants (not following references). Returns every touched
    /// resource with its previous flag.
    pub(crate) fn set_active_tracked(
        &self,
        active: bool,
        recursive: bool,
    ) -> CoreResult<Vec<(Resource, bool)>> {
        self.session.check_mutable(self.path(), Operation::Activate)?;
        let mut targets = vec![self.clone()];
        if recursive {
            targets.extend(self.sub_resources(true).into_iter().filter(|r| !r.is_reference()));
        }
        let mut previous = Vec::with_capacity(targets.len());
        let mut events = Vec::new();
        {
            let _exclusive = self.tree().lock().write()?;
            let mut index = self.tree().index_mut();
            for target in targets {
                let Some(id) = target.node.refresh(&index).id() else {
                    if previous.is_empty() {
                        return Err(CoreError::virtual_resource(self.path()));
                    }
                    continue;
                };
                let was = index.set_active(id, active)?;
                if was != active {
                    let resolved = index.resolve(id);
                    events.push(ResourceEvent::new(
                        index.path_of(resolved).unwrap_or_default(),
                        Some(resolved),
                        target.node.type_name(),
                        if active {
                            EventKind::Activated
                        } else {
                            EventKind::Deactivated
                        },
                    ));
                }
                previous.push((target, was));
            }
        }
        self.session.db.publish(events);
        Ok(previous)
    }

    /// Turns this resource into a reference to `target`, creating virtual
    /// ancestors. A data node at this path is deleted first.
    ///
    /// # Errors
    ///
    /// `VirtualResource` if the target does not exist, `InvalidReference`
    /// for toplevel resources or loops, `InvalidType` if the target's type
    /// does not fit, `AccessDenied`.
    pub fn set_as_reference(&self, target: &Resource) -> CoreResult<()> {
        self.session.check_mutable(self.path(), Operation::Reference)?;
        let events = {
            let _exclusive = self.tree().lock().write()?;
            let done = self
                .tree()
                .set_reference(&self.node, &target.node, self.session.app_id())?;
            let index = self.tree().index();
            let mut events = created_events(&index, &done.created);
            if let Some(replaced) = &done.replaced {
                events.extend(deletion_events(replaced));
            }
            let target_path = index
                .path_of(index.resolve(done.id))
                .unwrap_or_default();
            events.push(ResourceEvent::new(
                index.path_of(done.id).unwrap_or_default(),
                Some(done.id),
                self.node.type_name(),
                EventKind::ReferenceAdded {
                    target: target_path,
                },
            ));
            events
        };
        self.session.db.publish(events);
        Ok(())
    }

    /// Adds an element to this resource list, creating the list if needed.
    ///
    /// # Errors
    ///
    /// `InvalidType` if this is not a list with an element type,
    /// `AccessDenied`.
    pub fn add_list_element(&self) -> CoreResult<Resource> {
        self.session.check_mutable(self.path(), Operation::Create)?;
        let (node, events) = {
            let _exclusive = self.tree().lock().write()?;
            let (node, done) = self
                .tree()
                .add_list_element(&self.node, self.session.app_id())?;
            let index = self.tree().index();
            (node, created_events(&index, &done.created))
        };
        self.session.db.publish(events);
        Ok(self.session.wrap(node))
    }

    /// Current value; the last value for a deleted resource, `None` for a
    /// resource that never existed.
    ///
    /// # Errors
    ///
    /// `AccessDenied`.
    pub fn value(&self) -> CoreResult<Option<Value>> {
        self.session.check(self.path(), Operation::Read)?;
        let _shared = self.tree().lock().read();
        let index = self.tree().index();
        Ok(match self.node.refresh(&index) {
            Binding::Real(id) => index.value(id).cloned(),
            Binding::Virtual { last_value, .. } => last_value,
        })
    }

    /// Time of the last write in milliseconds, [`NO_TIMESTAMP`] if never
    /// written.
    #[must_use]
    pub fn last_update_time(&self) -> i64 {
        let _shared = self.tree().lock().read();
        let index = self.tree().index();
        match self.node.refresh(&index) {
            Binding::Real(id) => index
                .get(index.resolve(id))
                .map_or(NO_TIMESTAMP, |el| el.last_modified()),
            Binding::Virtual { last_modified, .. } => last_modified,
        }
    }

    /// Writes a value stamped with the current time.
    ///
    /// Returns `false` if the resource is virtual or read-only in this
    /// session.
    ///
    /// # Errors
    ///
    /// `InvalidType` if the value does not fit, `AccessDenied`.
    pub fn set_value(&self, value: impl Into<Value>) -> CoreResult<bool> {
        self.set_value_at(value, NO_TIMESTAMP)
    }

    /// Writes a value with an explicit timestamp; [`NO_TIMESTAMP`] means now.
    ///
    /// # Errors
    ///
    /// See [`Self::set_value`].
    pub fn set_value_at(&self, value: impl Into<Value>, timestamp: i64) -> CoreResult<bool> {
        self.session.check(self.path(), Operation::Write)?;
        if self.session.access_mode(self.path()) == AccessMode::ReadOnly {
            return Ok(false);
        }
        let event = {
            let _shared = self.tree().lock().read();
            let mut index = self.tree().index_mut();
            let Binding::Real(id) = self.node.refresh(&index) else {
                return Ok(false);
            };
            write_locked(&mut index, id, value.into(), timestamp, &self.node)?.1
        };
        self.session.db.publish(vec![event]);
        Ok(true)
    }

    /// Writes `value` and timestamp as given, returning the previous value
    /// and timestamp. Used to undo writes.
    pub(crate) fn write_raw(&self, value: Value, timestamp: i64) -> CoreResult<(Value, i64)> {
        let (previous, event) = {
            let _shared = self.tree().lock().read();
            let mut index = self.tree().index_mut();
            let Binding::Real(id) = self.node.refresh(&index) else {
                return Err(CoreError::virtual_resource(self.path()));
            };
            let target = index.resolve(id);
            let before = index.get(target).map_or(NO_TIMESTAMP, |el| el.last_modified());
            let old = index.set_value(id, value.clone(), timestamp)?;
            let event = ResourceEvent::new(
                index.path_of(target).unwrap_or_default(),
                Some(target),
                self.node.type_name(),
                EventKind::ValueChanged {
                    old: old.clone(),
                    new: value,
                    timestamp,
                },
            );
            ((old, before), event)
        };
        self.session.db.publish(vec![event]);
        Ok(previous)
    }

    fn atomic_update(&self, update: impl FnOnce(&Value) -> CoreResult<Value>) -> CoreResult<Value> {
        self.session.check_mutable(self.path(), Operation::Write)?;
        let (old, event) = {
            let _exclusive = self.tree().lock().write()?;
            let mut index = self.tree().index_mut();
            let Binding::Real(id) = self.node.refresh(&index) else {
                return Err(CoreError::virtual_resource(self.path()));
            };
            let current = index
                .value(id)
                .cloned()
                .ok_or_else(|| CoreError::invalid_type(format!("{} has no value", self.path())))?;
            let next = update(&current)?;
            write_locked(&mut index, id, next, NO_TIMESTAMP, &self.node)?
        };
        self.session.db.publish(vec![event]);
        Ok(old)
    }

    /// Replaces the value atomically and returns the previous one.
    ///
    /// # Errors
    ///
    /// `VirtualResource` if the resource does not exist, `AccessDenied` if
    /// it is read-only, `InvalidType` if the value does not fit.
    pub fn get_and_set(&self, value: impl Into<Value>) -> CoreResult<Value> {
        let value = value.into();
        self.atomic_update(move |_| Ok(value))
    }

    /// Adds `delta` atomically and returns the previous value.
    ///
    /// # Errors
    ///
    /// As [`Self::get_and_set`]; `InvalidType` for non-numeric values.
    pub fn get_and_add(&self, delta: impl Into<Value>) -> CoreResult<Value> {
        let delta = delta.into();
        self.atomic_update(move |current| current.checked_add(&delta))
    }

    fn typed<T>(&self, extract: impl FnOnce(&Value) -> Option<T>, expected: &str) -> CoreResult<T> {
        let value = self.value()?.ok_or_else(|| CoreError::virtual_resource(self.path()))?;
        extract(&value).ok_or_else(|| {
            CoreError::invalid_type(format!(
                "{} holds {}, not {expected}",
                self.path(),
                value.type_key()
            ))
        })
    }

    /// Float value.
    ///
    /// # Errors
    ///
    /// `VirtualResource` if it never existed, `InvalidType` for other types.
    pub fn float(&self) -> CoreResult<f32> {
        self.typed(Value::as_float, "a float")
    }

    /// Writes a float. See [`Self::set_value`].
    ///
    /// # Errors
    ///
    /// See [`Self::set_value`].
    pub fn set_float(&self, value: f32) -> CoreResult<bool> {
        self.set_value(value)
    }

    /// Integer value.
    ///
    /// # Errors
    ///
    /// `VirtualResource` if it never existed, `InvalidType` for other types.
    pub fn int(&self) -> CoreResult<i32> {
        self.typed(Value::as_int, "an int")
    }

    /// Writes an integer.
    ///
    /// # Errors
    ///
    /// See [`Self::set_value`].
    pub fn set_int(&self, value: i32) -> CoreResult<bool> {
        self.set_value(value)
    }

    /// Long value.
    ///
    /// # Errors
    ///
    /// `VirtualResource` if it never existed, `InvalidType` for other types.
    pub fn long(&self) -> CoreResult<i64> {
        self.typed(Value::as_long, "a long")
    }

    /// Writes a long.
    ///
    /// # Errors
    ///
    /// See [`Self::set_value`].
    pub fn set_long(&self, value: i64) -> CoreResult<bool> {
        self.set_value(value)
    }

    /// Boolean value.
    ///
    /// # Errors
    ///
    /// `VirtualResource` if it never existed, `InvalidType` for other types.
    pub fn bool(&self) -> CoreResult<bool> {
        self.typed(Value::as_bool, "a boolean")
    }

    /// Writes a boolean.
    ///
    /// # Errors
    ///
    /// See [`Self::set_value`].
    pub fn set_bool(&self, value: bool) -> CoreResult<bool> {
        self.set_value(value)
    }

    /// String value.
    ///
    /// # Errors
    ///
    /// `VirtualResource` if it never existed, `InvalidType` for other types.
    pub fn string(&self) -> CoreResult<String> {
        self.typed(|v| v.as_str().map(str::to_string), "a string")
    }

    /// Writes a string.
    ///
    /// # Errors
    ///
    /// See [`Self::set_value`].
    pub fn set_string(&self, value: &str) -> CoreResult<bool> {
        self.set_value(value)
    }
}

fn write_locked(
    index: &mut ResourceIndex,
    id: ResourceId,
    value: Value,
    timestamp: i64,
    node: &NodeHandle,
) -> CoreResult<(Value, ResourceEvent)> {
    let timestamp = if timestamp == NO_TIMESTAMP {
        now_millis()
    } else {
        timestamp
    };
    let old = index.set_value(id, value.clone(), timestamp)?;
    let target = index.resolve(id);
    let event = ResourceEvent::new(
        index.path_of(target).unwrap_or_default(),
        Some(target),
        node.type_name(),
        EventKind::ValueChanged {
            old: old.clone(),
            new: value,
            timestamp,
        },
    );
    Ok((old, event))
}

fn created_events(index: &ResourceIndex, created: &[ResourceId]) -> Vec<ResourceEvent> {
    created
        .iter()
        .filter_map(|id| {
            let el = index.get(*id)?;
            Some(ResourceEvent::new(
                index.path_of(*id)?,
                Some(*id),
                el.type_name(),
                EventKind::Created,
            ))
        })
        .collect()
}

fn deletion_events(deletion: &Deletion) -> Vec<ResourceEvent> {
    deletion
        .removed
        .iter()
        .chain(deletion.dangling.iter())
        .map(|removed| {
            let kind = if removed.reference {
                EventKind::ReferenceRemoved
            } else {
                EventKind::Deleted
            };
            ResourceEvent::new(
                removed.path.clone(),
                Some(removed.id),
                removed.type_name.clone(),
                kind,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_feed::EventKind;
    use crate::schema::{builtin, SchemaRegistry, TypeDef};
    use crate::ResourceDb;

    fn create_db() -> ResourceDb {
        let mut schema = SchemaRegistry::new();
        schema
            .register(
                TypeDef::new("Meter")
                    .slot("power", builtin::FLOAT)
                    .slot("count", builtin::INTEGER)
                    .list_slot("readings", "Reading"),
            )
            .unwrap();
        schema
            .register(TypeDef::new("Reading").slot("value", builtin::FLOAT))
            .unwrap();
        schema
            .register(TypeDef::new("Building").slot("meter", "Meter"))
            .unwrap();
        ResourceDb::open_in_memory(schema).unwrap()
    }

    #[test]
    fn declared_children_start_virtual() {
        let db = create_db();
        let app = db.session("app");
        let meter = app.add_resource("meter", "Meter").unwrap();
        assert!(meter.exists());
        assert!(!meter.is_active());
        assert!(meter.is_toplevel());
        assert_eq!(meter.owner().as_deref(), Some("app"));

        let power = meter.child("power").unwrap().unwrap();
        assert!(!power.exists());
        assert_eq!(power.type_name(), builtin::FLOAT);
        assert!(!power.set_float(3.0).unwrap());
        assert!(meter.child("unknown").unwrap().is_none());
        assert!(meter.children().is_empty());
    }

    #[test]
    fn add_resource_rejects_other_types() {
        let db = create_db();
        let app = db.session("app");
        app.add_resource("meter", "Meter").unwrap();
        assert!(app.add_resource("meter", "Meter").is_ok());
        assert!(matches!(
            app.add_resource("meter", builtin::FLOAT),
            Err(CoreError::InvalidType { .. })
        ));
    }

    #[test]
    fn delete_keeps_last_value() {
        let db = create_db();
        let app = db.session("app");
        let meter = app.add_resource("meter", "Meter").unwrap();
        let power = meter.child("power").unwrap().unwrap();
        power.create().unwrap();
        power.set_value_at(5.5f32, 1234).unwrap();

        meter.delete().unwrap();
        assert!(!meter.exists());
        assert!(!power.exists());
        assert_eq!(power.value().unwrap(), Some(Value::Float(5.5)));
        assert_eq!(power.last_update_time(), 1234);
        assert!(!power.set_float(1.0).unwrap());

        power.create().unwrap();
        assert!(meter.exists());
        assert_eq!(power.float().unwrap(), 0.0);
    }

    #[test]
    fn references_share_the_target() {
        let db = create_db();
        let app = db.session("app");
        let meter = app.add_resource("meter", "Meter").unwrap();
        let building = app.add_resource("house", "Building").unwrap();
        let link = building.child("meter").unwrap().unwrap();
        link.set_as_reference(&meter).unwrap();

        assert!(link.is_reference());
        assert_eq!(link.location(), "meter");
        assert!(link.equals_location(&meter));
        assert!(!link.equals_path(&meter));
        assert_eq!(meter.referencing_resources().len(), 1);

        let via_link = link.child("count").unwrap().unwrap();
        via_link.create().unwrap();
        via_link.set_int(4).unwrap();
        let direct = meter.child("count").unwrap().unwrap();
        assert_eq!(direct.int().unwrap(), 4);

        link.delete().unwrap();
        assert!(!link.exists());
        assert!(meter.exists());
        assert_eq!(direct.int().unwrap(), 4);
    }

    #[test]
    fn deleting_the_target_removes_the_reference() {
        let db = create_db();
        let app = db.session("app");
        let meter = app.add_resource("meter", "Meter").unwrap();
        let house = app.add_resource("house", "Building").unwrap();
        let link = house.child("meter").unwrap().unwrap();
        link.set_as_reference(&meter).unwrap();
        let rx = db.subscribe();

        meter.delete().unwrap();
        assert!(!link.exists());
        assert!(house.exists());
        let kinds: Vec<EventKind> = rx.try_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::Deleted));
        assert!(kinds.contains(&EventKind::ReferenceRemoved));
    }

    #[test]
    fn reference_to_virtual_target_fails() {
        let db = create_db();
        let app = db.session("app");
        let meter = app.toplevel_or_virtual("meter", "Meter").unwrap();
        let house = app.add_resource("house", "Building").unwrap();
        let link = house.child("meter").unwrap().unwrap();
        assert!(matches!(
            link.set_as_reference(&meter),
            Err(CoreError::VirtualResource { .. })
        ));
    }

    #[test]
    fn atomic_updates_need_a_real_resource() {
        let db = create_db();
        let app = db.session("app");
        let count = app.toplevel_or_virtual("count", builtin::INTEGER).unwrap();
        assert!(matches!(
            count.get_and_add(1),
            Err(CoreError::VirtualResource { .. })
        ));
        count.create().unwrap();
        assert_eq!(count.get_and_add(2).unwrap(), Value::Int(0));
        assert_eq!(count.get_and_set(10).unwrap(), Value::Int(2));
        assert_eq!(count.int().unwrap(), 10);
    }

    #[test]
    fn read_only_locations() {
        let db = create_db();
        let app = db.session("app");
        let meter = app.add_resource("meter", "Meter").unwrap();
        let count = meter.child("count").unwrap().unwrap();
        count.create().unwrap();

        app.set_access_mode("meter", AccessMode::ReadOnly);
        assert_eq!(app.access_mode("meter/count"), AccessMode::ReadOnly);
        assert_eq!(app.access_mode("other"), AccessMode::Shared);
        assert!(!count.set_int(3).unwrap());
        assert!(matches!(
            count.get_and_add(1),
            Err(CoreError::AccessDenied { .. })
        ));

        app.set_access_mode("meter/count", AccessMode::Shared);
        assert!(count.set_int(3).unwrap());
    }

    #[test]
    fn policy_denials() {
        let db = create_db();
        let policy = |app: &str, path: &str, op: Operation| {
            app == "admin" || op == Operation::Read || !path.starts_with("secure")
        };
        let guest = db.session("guest").with_policy(Arc::new(policy));
        let admin = db.session("admin").with_policy(Arc::new(policy));

        assert!(matches!(
            guest.add_resource("secure", builtin::INTEGER),
            Err(CoreError::AccessDenied { .. })
        ));
        let secure = admin.add_resource("secure", builtin::INTEGER).unwrap();
        secure.set_int(1).unwrap();

        let seen = guest.resource("secure").unwrap().unwrap();
        assert_eq!(seen.int().unwrap(), 1);
        assert!(matches!(seen.set_int(2), Err(CoreError::AccessDenied { .. })));
        assert!(matches!(seen.delete(), Err(CoreError::AccessDenied { .. })));
        assert!(guest.add_resource("open", builtin::INTEGER).is_ok());
    }

    #[test]
    fn list_elements_are_numbered() {
        let db = create_db();
        let app = db.session("app");
        let meter = app.add_resource("meter", "Meter").unwrap();
        let readings = meter.child("readings").unwrap().unwrap();

        let first = readings.add_list_element().unwrap();
        let second = readings.add_list_element().unwrap();
        assert_eq!(first.path(), "meter/readings/readings_0");
        assert_eq!(second.path(), "meter/readings/readings_1");
        assert_eq!(first.type_name(), "Reading");
        assert_eq!(readings.children().len(), 2);

        first.delete().unwrap();
        let again = readings.add_list_element().unwrap();
        assert_eq!(again.name(), "readings_0");
    }

    #[test]
    fn recursive_activation_and_listing() {
        let db = create_db();
        let app = db.session("app");
        let meter = app.add_resource("meter", "Meter").unwrap();
        meter.child("power").unwrap().unwrap().create().unwrap();
        meter.child("count").unwrap().unwrap().create().unwrap();

        meter.activate(true).unwrap();
        let subs = meter.sub_resources(true);
        assert_eq!(subs.len(), 2);
        assert!(subs.iter().all(Resource::is_active));

        meter.deactivate(false).unwrap();
        assert!(!meter.is_active());
        assert!(subs.iter().all(Resource::is_active));

        let virtual_one = app.toplevel_or_virtual("ghost", builtin::FLOAT).unwrap();
        assert!(matches!(
            virtual_one.activate(false),
            Err(CoreError::VirtualResource { .. })
        ));
    }

    #[test]
    fn typed_getters_check_the_type() {
        let db = create_db();
        let app = db.session("app");
        let name = app.add_resource("name", builtin::STRING).unwrap();
        name.set_string("boiler").unwrap();
        assert_eq!(name.string().unwrap(), "boiler");
        assert!(matches!(name.float(), Err(CoreError::InvalidType { .. })));
        assert!(matches!(
            name.set_value(3i32),
            Err(CoreError::InvalidType { .. })
        ));

        let missing = app.toplevel_or_virtual("nothing", builtin::FLOAT).unwrap();
        assert!(matches!(
            missing.float(),
            Err(CoreError::VirtualResource { .. })
        ));
    }

    #[test]
    fn queries_by_type_and_owner() {
        let db = create_db();
        let a = db.session("a");
        let b = db.session("b");
        a.add_resource("m1", "Meter").unwrap();
        b.add_resource("m2", "Meter").unwrap();
        a.add_resource("f", builtin::FLOAT).unwrap();

        assert_eq!(a.resources_of_type("Meter", false).len(), 2);
        assert_eq!(a.owned_resources().len(), 2);
        assert_eq!(b.owned_resources().len(), 1);
        assert_eq!(a.toplevel_resources().len(), 3);
    }

    #[test]
    fn flag_and_time_readers_wait_for_an_open_transaction() {
        use std::sync::{mpsc, Arc};
        use std::thread;
        use std::time::Duration;

        let db = Arc::new(create_db());
        let app = db.session("app");
        let power = app.add_resource("power", builtin::FLOAT).unwrap();
        power.set_value_at(1.0f32, 100).unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let holder = {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let app = db.session("holder");
                let power = app.resource("power").unwrap().unwrap();
                app.start_transaction().unwrap();
                power.set_value_at(2.0f32, 777).unwrap();
                // Same-thread reads re-enter the exclusive lock.
                assert_eq!(power.last_update_time(), 777);
                assert!(!power.is_reference());
                assert_eq!(power.location(), "power");
                started_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(100));
                power.set_value_at(3.0f32, 888).unwrap();
                power.activate(false).unwrap();
                app.finish_transaction().unwrap();
            })
        };

        started_rx.recv().unwrap();
        assert_eq!(power.last_update_time(), 888);
        assert!(power.is_active());
        holder.join().unwrap();
    }
}
