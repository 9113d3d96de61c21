//! Action state.

use crate::error::{CoreError, CoreResult};

/// State of an action or transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionState {
    /// Not run yet.
    #[default]
    Pending,
    /// Executed, successfully or not. Only now may it be rolled back.
    Executed,
    /// Rolled back.
    RolledBack,
}

/// Guards the `Pending → Executed → RolledBack` progression.
#[derive(Debug, Default)]
pub(crate) struct Progress {
    state: ActionState,
}

impl Progress {
    pub(crate) fn state(&self) -> ActionState {
        self.state
    }

    /// Moves to `Executed`.
    ///
    /// # Errors
    ///
    /// `IllegalState` unless pending.
    pub(crate) fn start_execute(&mut self) -> CoreResult<()> {
        match self.state {
            ActionState::Pending => {
                self.state = ActionState::Executed;
                Ok(())
            }
            other => Err(CoreError::illegal_state(format!(
                "cannot execute an action that is {other:?}"
            ))),
        }
    }

    /// Moves to `RolledBack`.
    ///
    /// # Errors
    ///
    /// `IllegalState` unless executed.
    pub(crate) fn start_rollback(&mut self) -> CoreResult<()> {
        match self.state {
            ActionState::Executed => {
                self.state = ActionState::RolledBack;
                Ok(())
            }
            other => Err(CoreError::illegal_state(format!(
                "cannot roll back an action that is {other:?}"
            ))),
        }
    }
}
