//! Per-database re-entrant read/write lock.
//!
//! Value reads and plain writes hold the lock shared; structure changes,
//! atomic read-modify-write and open transactions hold it exclusively. The
//! exclusive holder may take either mode again on the same thread, which is
//! what makes nested transactions and actions calling other actions work.
//!
//! A thread holding only the shared lock may not ask for the exclusive one:
//! two such threads would wait on each other forever, so the request fails
//! with [`CoreError::IllegalState`] instead.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct LockState {
    readers: HashMap<ThreadId, usize>,
    writer: Option<(ThreadId, usize)>,
    waiting_writers: usize,
}

impl LockState {
    fn held_by_writer(&self, me: ThreadId) -> bool {
        matches!(self.writer, Some((owner, _)) if owner == me)
    }
}

/// Re-entrant read/write lock guarding the resource tree.
#[derive(Debug, Default)]
pub struct ResourceLock {
    state: Mutex<LockState>,
    released: Condvar,
}

/// Shared hold on a [`ResourceLock`].
#[must_use = "the lock is released when the guard is dropped"]
#[derive(Debug)]
pub struct ReadGuard<'a> {
    lock: &'a ResourceLock,
}

/// Exclusive hold on a [`ResourceLock`].
#[must_use = "the lock is released when the guard is dropped"]
#[derive(Debug)]
pub struct WriteGuard<'a> {
    lock: &'a ResourceLock,
}

impl ResourceLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock shared, blocking while another thread writes.
    ///
    /// New readers also wait behind queued writers, unless the calling
    /// thread already reads.
    pub fn read(&self) -> ReadGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if !state.held_by_writer(me) && !state.readers.contains_key(&me) {
            while state.writer.is_some() || state.waiting_writers > 0 {
                self.released.wait(&mut state);
            }
        }
        *state.readers.entry(me).or_insert(0) += 1;
        ReadGuard { lock: self }
    }

    /// Takes the lock exclusively.
    ///
    /// # Errors
    ///
    /// [`CoreError::IllegalState`] if the thread holds only a shared lock.
    pub fn write(&self) -> CoreResult<WriteGuard<'_>> {
        self.enter_write()?;
        Ok(WriteGuard { lock: self })
    }

    /// Enters the exclusive lock without a guard and returns the new
    /// nesting depth. Every call must be matched by [`Self::exit_write`].
    ///
    /// # Errors
    ///
    /// [`CoreError::IllegalState`] if the thread holds only a shared lock.
    pub fn enter_write(&self) -> CoreResult<usize> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if let Some((owner, depth)) = state.writer.as_mut() {
            if *owner == me {
                *depth += 1;
                return Ok(*depth);
            }
        }
        if state.readers.contains_key(&me) {
            return Err(CoreError::illegal_state(
                "cannot take the exclusive lock while holding the shared lock",
            ));
        }
        state.waiting_writers += 1;
        while state.writer.is_some() || !state.readers.is_empty() {
            self.released.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer = Some((me, 1));
        Ok(1)
    }

    /// Leaves one level of the exclusive lock and returns the remaining
    /// depth; 0 means the lock was released.
    ///
    /// # Errors
    ///
    /// [`CoreError::IllegalState`] if the thread does not hold the exclusive
    /// lock.
    pub fn exit_write(&self) -> CoreResult<usize> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let remaining = match state.writer.as_mut() {
            Some((owner, depth)) if *owner == me => {
                *depth -= 1;
                *depth
            }
            _ => {
                return Err(CoreError::illegal_state(
                    "exclusive lock is not held by this thread",
                ))
            }
        };
        if remaining == 0 {
            state.writer = None;
            self.released.notify_all();
        }
        Ok(remaining)
    }

    fn exit_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if let Some(count) = state.readers.get_mut(&me) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&me);
                if state.readers.is_empty() {
                    self.released.notify_all();
                }
            }
        }
    }

    /// Nesting depth of the calling thread's exclusive hold; 0 if it holds
    /// none.
    #[must_use]
    pub fn write_depth(&self) -> usize {
        let me = thread::current().id();
        match self.state.lock().writer {
            Some((owner, depth)) if owner == me => depth,
            _ => 0,
        }
    }

    /// Returns `true` if the calling thread holds the lock exclusively.
    #[must_use]
    pub fn is_write_held(&self) -> bool {
        self.write_depth() > 0
    }

    /// Returns `true` if any thread holds the lock in any mode.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.writer.is_some() || !state.readers.is_empty()
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.exit_read();
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.exit_write() {
            tracing::error!(error = %e, "write guard released a lock it did not hold");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn writer_reenters_both_modes() {
        let lock = ResourceLock::new();
        let outer = lock.write().unwrap();
        {
            let _inner = lock.write().unwrap();
            let _read = lock.read();
            assert_eq!(lock.write_depth(), 2);
        }
        assert_eq!(lock.write_depth(), 1);
        drop(outer);
        assert!(!lock.is_locked());
    }

    #[test]
    fn readers_share() {
        let lock = ResourceLock::new();
        let _a = lock.read();
        let _b = lock.read();
        assert!(lock.is_locked());
        assert!(!lock.is_write_held());
    }

    #[test]
    fn upgrade_is_refused() {
        let lock = ResourceLock::new();
        let _read = lock.read();
        assert!(matches!(lock.write(), Err(CoreError::IllegalState { .. })));
    }

    #[test]
    fn unbalanced_exit_is_refused() {
        let lock = ResourceLock::new();
        assert!(matches!(
            lock.exit_write(),
            Err(CoreError::IllegalState { .. })
        ));
        assert_eq!(lock.enter_write().unwrap(), 1);
        assert_eq!(lock.enter_write().unwrap(), 2);
        assert_eq!(lock.exit_write().unwrap(), 1);
        assert_eq!(lock.exit_write().unwrap(), 0);
        assert!(lock.exit_write().is_err());
    }

    #[test]
    fn writers_exclude_each_other() {
        let lock = Arc::new(ResourceLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = lock.write().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn reader_waits_for_writer() {
        let lock = Arc::new(ResourceLock::new());
        let guard = lock.write().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));

        let reader = {
            let lock = Arc::clone(&lock);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                let _read = lock.read();
                seen.load(Ordering::SeqCst)
            })
        };
        thread::sleep(Duration::from_millis(20));
        seen.store(7, Ordering::SeqCst);
        drop(guard);
        assert_eq!(reader.join().unwrap(), 7);
    }
}
