//! Atomic actions and composite transactions.
//!
//! Every mutation that must be undoable is an [`AtomicAction`]. An action
//! runs once and may then be rolled back once; anything else is an
//! [`crate::CoreError::IllegalState`]. Composite actions record each
//! sub-action before running it and unwind the record in reverse on
//! rollback, logging and skipping steps that fail to undo.
//!
//! A [`ResourceTransaction`] runs a list of actions under one lock
//! acquisition: the exclusive lock if any action asks for it, the shared
//! lock otherwise. Events produced inside are dispatched when it finishes.
//!
//! ```rust,ignore
//! let mut tx = app.transaction();
//! tx.write(&setpoint, 21.0f32, WritePolicy::CreateAndActivate)
//!     .activate(&heater, true);
//! let current = tx.read(&temperature);
//! tx.execute()?;
//! println!("{:?}", current.get());
//! ```

mod actions;
mod manager;
mod state;

use crate::error::CoreResult;

pub use actions::{
    ActivationAction, CreateAction, ReadAction, ReadResult, WriteAction, WritePolicy,
};
pub use manager::ResourceTransaction;
pub use state::ActionState;

/// A mutation that can be undone.
pub trait AtomicAction: Send + std::fmt::Debug {
    /// Whether committing needs the exclusive lock (value writes).
    fn requires_commit_write_lock(&self) -> bool;

    /// Whether the action changes the tree shape or flags.
    fn requires_structure_write_lock(&self) -> bool;

    /// Runs the action.
    ///
    /// # Errors
    ///
    /// `IllegalState` if it already ran; otherwise whatever the mutation
    /// returns. A failed action must still be rolled back.
    fn execute(&mut self) -> CoreResult<()>;

    /// Undoes the action.
    ///
    /// # Errors
    ///
    /// `IllegalState` unless it ran and was not rolled back yet.
    fn rollback(&mut self) -> CoreResult<()>;
}
