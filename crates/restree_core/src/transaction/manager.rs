//! Composite transactions.

use super::actions::{ActivationAction, CreateAction, ReadAction, ReadResult, WriteAction, WritePolicy};
use super::state::{ActionState, Progress};
use super::AtomicAction;
use crate::error::CoreResult;
use crate::resource::{Resource, Session};
use crate::value::Value;
use std::sync::Arc;

/// A list of actions executed together.
///
/// If an action fails, every action that ran (including the failing one)
/// is rolled back in reverse order and the error is returned. A transaction
/// that succeeded can be rolled back as a whole later.
#[derive(Debug)]
pub struct ResourceTransaction {
    session: Session,
    actions: Vec<Box<dyn AtomicAction>>,
    completed: usize,
    progress: Progress,
}

impl ResourceTransaction {
    pub(crate) fn new(session: Session) -> Self {
        Self {
            session,
            actions: Vec::new(),
            completed: 0,
            progress: Progress::default(),
        }
    }

    /// Creates `resource`.
    pub fn create(&mut self, resource: &Resource) -> &mut Self {
        self.add_action(Box::new(CreateAction::new(resource.clone())))
    }

    /// Activates `resource`.
    pub fn activate(&mut self, resource: &Resource, recursive: bool) -> &mut Self {
        self.add_action(Box::new(ActivationAction::activate(
            resource.clone(),
            recursive,
        )))
    }

    /// Deactivates `resource`.
    pub fn deactivate(&mut self, resource: &Resource, recursive: bool) -> &mut Self {
        self.add_action(Box::new(ActivationAction::deactivate(
            resource.clone(),
            recursive,
        )))
    }

    /// Writes a value.
    pub fn write(
        &mut self,
        resource: &Resource,
        value: impl Into<Value>,
        policy: WritePolicy,
    ) -> &mut Self {
        self.add_action(Box::new(WriteAction::new(resource.clone(), value, policy)))
    }

    /// Reads a value; the result is filled in by [`Self::execute`].
    pub fn read(&mut self, resource: &Resource) -> ReadResult {
        let (action, result) = ReadAction::new(resource.clone());
        self.add_action(Box::new(action));
        result
    }

    /// Appends any action.
    pub fn add_action(&mut self, action: Box<dyn AtomicAction>) -> &mut Self {
        self.actions.push(action);
        self
    }

    /// Number of queued actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns `true` if no action is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ActionState {
        self.progress.state()
    }

    fn needs_exclusive(&self) -> bool {
        self.actions
            .iter()
            .any(|a| a.requires_commit_write_lock() || a.requires_structure_write_lock())
    }

    /// Runs all actions.
    ///
    /// # Errors
    ///
    /// `IllegalState` if the transaction already ran, or if it needs the
    /// exclusive lock while the thread holds only the shared one; otherwise
    /// the error of the first failing action, after rollback.
    pub fn execute(&mut self) -> CoreResult<()> {
        self.progress.start_execute()?;
        let exclusive = self.needs_exclusive();
        let result = if exclusive {
            self.session.start_transaction()?;
            let result = self.run_all();
            self.session.finish_transaction()?;
            result
        } else {
            let db = Arc::clone(&self.session.db);
            let _shared = db.tree.lock().read();
            db.ensure_open()?;
            self.run_all()
        };
        self.session
            .db
            .stats
            .record_transaction(result.is_err());
        result
    }

    fn run_all(&mut self) -> CoreResult<()> {
        for i in 0..self.actions.len() {
            self.completed = i + 1;
            if let Err(e) = self.actions[i].execute() {
                tracing::debug!(action = i, error = %e, "transaction failed, rolling back");
                self.unwind();
                return Err(e);
            }
        }
        Ok(())
    }

    fn unwind(&mut self) {
        while self.completed > 0 {
            self.completed -= 1;
            if let Err(e) = self.actions[self.completed].rollback() {
                tracing::warn!(action = self.completed, error = %e, "rollback step failed");
            }
        }
    }

    /// Undoes a transaction that executed successfully.
    ///
    /// # Errors
    ///
    /// `IllegalState` unless the transaction executed and was not rolled
    /// back yet.
    pub fn rollback(&mut self) -> CoreResult<()> {
        self.progress.start_rollback()?;
        self.session.start_transaction()?;
        self.unwind();
        self.session.finish_transaction()?;
        self.session.db.stats.record_transaction(true);
        Ok(())
    }
}
