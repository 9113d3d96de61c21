//! The built-in atomic actions.

use super::state::Progress;
use super::AtomicAction;
use crate::error::{CoreError, CoreResult};
use crate::resource::{Operation, Resource};
use crate::types::{now_millis, NO_TIMESTAMP};
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::Arc;

/// What a [`WriteAction`] does with its target's existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// A virtual target is an error.
    #[default]
    Fail,
    /// A virtual target is skipped.
    Ignore,
    /// A virtual target is created; the target is activated after the write.
    CreateAndActivate,
    /// An existing target is activated after the write; a virtual one is
    /// skipped.
    Activate,
}

fn undo_create(resource: &Resource, created: &[String]) -> CoreResult<()> {
    let Some(first) = created.first() else {
        return Ok(());
    };
    if let Some(top) = resource.session().resource(first)? {
        top.delete()?;
    }
    Ok(())
}

/// Creates a resource and its virtual ancestors.
///
/// Rollback deletes the topmost resource it created, and with it everything
/// below.
#[derive(Debug)]
pub struct CreateAction {
    resource: Resource,
    created: Vec<String>,
    progress: Progress,
}

impl CreateAction {
    /// Creates the action.
    #[must_use]
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            created: Vec::new(),
            progress: Progress::default(),
        }
    }

    /// Paths created by the last execution, parents first.
    #[must_use]
    pub fn created(&self) -> &[String] {
        &self.created
    }
}

impl AtomicAction for CreateAction {
    fn requires_commit_write_lock(&self) -> bool {
        false
    }

    fn requires_structure_write_lock(&self) -> bool {
        true
    }

    fn execute(&mut self) -> CoreResult<()> {
        self.progress.start_execute()?;
        self.created = self.resource.create_tracked()?;
        Ok(())
    }

    fn rollback(&mut self) -> CoreResult<()> {
        self.progress.start_rollback()?;
        undo_create(&self.resource, &std::mem::take(&mut self.created))
    }
}

/// Activates or deactivates a resource, optionally with its subtree and
/// optionally creating it first.
///
/// Rollback restores every flag it changed and deletes what it created.
#[derive(Debug)]
pub struct ActivationAction {
    resource: Resource,
    active: bool,
    recursive: bool,
    create: bool,
    created: Vec<String>,
    previous: Vec<(Resource, bool)>,
    progress: Progress,
}

impl ActivationAction {
    /// Activates `resource`.
    #[must_use]
    pub fn activate(resource: Resource, recursive: bool) -> Self {
        Self::new(resource, true, recursive)
    }

    /// Deactivates `resource`.
    #[must_use]
    pub fn deactivate(resource: Resource, recursive: bool) -> Self {
        Self::new(resource, false, recursive)
    }

    fn new(resource: Resource, active: bool, recursive: bool) -> Self {
        Self {
            resource,
            active,
            recursive,
            create: false,
            created: Vec::new(),
            previous: Vec::new(),
            progress: Progress::default(),
        }
    }

    /// Creates a virtual resource before activating it.
    #[must_use]
    pub fn creating(mut self) -> Self {
        self.create = true;
        self
    }
}

impl AtomicAction for ActivationAction {
    fn requires_commit_write_lock(&self) -> bool {
        false
    }

    fn requires_structure_write_lock(&self) -> bool {
        true
    }

    fn execute(&mut self) -> CoreResult<()> {
        self.progress.start_execute()?;
        if self.create && !self.resource.exists() {
            self.created = self.resource.create_tracked()?;
        }
        self.previous = self
            .resource
            .set_active_tracked(self.active, self.recursive)?;
        Ok(())
    }

    fn rollback(&mut self) -> CoreResult<()> {
        self.progress.start_rollback()?;
        for (resource, was) in std::mem::take(&mut self.previous).into_iter().rev() {
            if resource.exists() {
                resource.set_active_tracked(was, false)?;
            }
        }
        undo_create(&self.resource, &std::mem::take(&mut self.created))
    }
}

/// Writes one value and remembers the one it replaced.
#[derive(Debug)]
struct SetValueStep {
    resource: Resource,
    value: Value,
    timestamp: i64,
    previous: Option<(Value, i64)>,
    progress: Progress,
}

impl AtomicAction for SetValueStep {
    fn requires_commit_write_lock(&self) -> bool {
        true
    }

    fn requires_structure_write_lock(&self) -> bool {
        false
    }

    fn execute(&mut self) -> CoreResult<()> {
        self.progress.start_execute()?;
        self.resource
            .session()
            .check_mutable(self.resource.path(), Operation::Write)?;
        let timestamp = if self.timestamp == NO_TIMESTAMP {
            now_millis()
        } else {
            self.timestamp
        };
        self.previous = Some(self.resource.write_raw(self.value.clone(), timestamp)?);
        Ok(())
    }

    fn rollback(&mut self) -> CoreResult<()> {
        self.progress.start_rollback()?;
        match self.previous.take() {
            Some((value, timestamp)) if self.resource.exists() => {
                self.resource.write_raw(value, timestamp).map(|_| ())
            }
            _ => Ok(()),
        }
    }
}

/// Writes a value under a [`WritePolicy`].
///
/// Each step (create, write, activate) runs as its own sub-action. A step is
/// recorded before it runs, so rollback also undoes a step that failed half
/// way.
#[derive(Debug)]
pub struct WriteAction {
    resource: Resource,
    value: Value,
    timestamp: i64,
    policy: WritePolicy,
    steps: Vec<Box<dyn AtomicAction>>,
    progress: Progress,
}

impl WriteAction {
    /// Writes `value` stamped with the current time.
    #[must_use]
    pub fn new(resource: Resource, value: impl Into<Value>, policy: WritePolicy) -> Self {
        Self::at(resource, value, NO_TIMESTAMP, policy)
    }

    /// Writes `value` with an explicit timestamp.
    #[must_use]
    pub fn at(
        resource: Resource,
        value: impl Into<Value>,
        timestamp: i64,
        policy: WritePolicy,
    ) -> Self {
        Self {
            resource,
            value: value.into(),
            timestamp,
            policy,
            steps: Vec::new(),
            progress: Progress::default(),
        }
    }

    fn run(&mut self, mut step: Box<dyn AtomicAction>) -> CoreResult<()> {
        let result = step.execute();
        self.steps.push(step);
        result
    }
}

impl AtomicAction for WriteAction {
    fn requires_commit_write_lock(&self) -> bool {
        true
    }

    fn requires_structure_write_lock(&self) -> bool {
        matches!(
            self.policy,
            WritePolicy::CreateAndActivate | WritePolicy::Activate
        )
    }

    fn execute(&mut self) -> CoreResult<()> {
        self.progress.start_execute()?;
        if !self.resource.exists() {
            match self.policy {
                WritePolicy::Fail => {
                    return Err(CoreError::virtual_resource(self.resource.path()));
                }
                WritePolicy::Ignore | WritePolicy::Activate => return Ok(()),
                WritePolicy::CreateAndActivate => {
                    self.run(Box::new(CreateAction::new(self.resource.clone())))?;
                }
            }
        }
        self.run(Box::new(SetValueStep {
            resource: self.resource.clone(),
            value: self.value.clone(),
            timestamp: self.timestamp,
            previous: None,
            progress: Progress::default(),
        }))?;
        if matches!(
            self.policy,
            WritePolicy::CreateAndActivate | WritePolicy::Activate
        ) {
            self.run(Box::new(ActivationAction::activate(
                self.resource.clone(),
                false,
            )))?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> CoreResult<()> {
        self.progress.start_rollback()?;
        while let Some(mut step) = self.steps.pop() {
            if let Err(e) = step.rollback() {
                tracing::warn!(path = %self.resource.path(), error = %e, "write rollback step failed");
            }
        }
        Ok(())
    }
}

/// Value captured by a [`ReadAction`], available after execution.
#[derive(Debug, Clone, Default)]
pub struct ReadResult(Arc<Mutex<Option<Value>>>);

impl ReadResult {
    /// The value read; `None` before execution or if the resource never
    /// held one.
    #[must_use]
    pub fn get(&self) -> Option<Value> {
        self.0.lock().clone()
    }
}

/// Reads a value inside a transaction.
#[derive(Debug)]
pub struct ReadAction {
    resource: Resource,
    result: ReadResult,
    progress: Progress,
}

impl ReadAction {
    /// Creates the action and the slot its value lands in.
    #[must_use]
    pub fn new(resource: Resource) -> (Self, ReadResult) {
        let result = ReadResult::default();
        (
            Self {
                resource,
                result: result.clone(),
                progress: Progress::default(),
            },
            result,
        )
    }
}

impl AtomicAction for ReadAction {
    fn requires_commit_write_lock(&self) -> bool {
        false
    }

    fn requires_structure_write_lock(&self) -> bool {
        false
    }

    fn execute(&mut self) -> CoreResult<()> {
        self.progress.start_execute()?;
        *self.result.0.lock() = self.resource.value()?;
        Ok(())
    }

    fn rollback(&mut self) -> CoreResult<()> {
        self.progress.start_rollback()
    }
}
