//! Periodic background flushing.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Signal {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Handle to the background flush thread.
///
/// Dropping the handle stops the thread and waits for a running flush to
/// finish.
#[derive(Debug)]
pub struct TimedPersistence {
    signal: Arc<Signal>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TimedPersistence {
    /// Starts a thread calling `flush` every `period`.
    ///
    /// Errors returned by `flush` are logged; the next period retries.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start<F>(period: Duration, flush: F) -> CoreResult<Self>
    where
        F: Fn() -> CoreResult<()> + Send + 'static,
    {
        let signal = Arc::new(Signal::default());
        let thread_signal = Arc::clone(&signal);
        let thread = thread::Builder::new()
            .name("restree-flush".to_string())
            .spawn(move || flush_loop(period, &thread_signal, flush))
            .map_err(CoreError::Io)?;
        tracing::debug!(?period, "started background flush");
        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    /// Returns `true` while the thread runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the thread and waits for it.
    pub fn stop(&mut self) {
        *self.signal.stop.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("background flush thread panicked");
            }
        }
    }
}

impl Drop for TimedPersistence {
    fn drop(&mut self) {
        self.stop();
    }
}

fn flush_loop(period: Duration, signal: &Signal, flush: impl Fn() -> CoreResult<()>) {
    loop {
        let deadline = Instant::now() + period;
        {
            let mut stop = signal.stop.lock();
            while !*stop {
                if signal.wake.wait_until(&mut stop, deadline).timed_out() {
                    break;
                }
            }
            if *stop {
                return;
            }
        }
        if let Err(e) = flush() {
            tracing::warn!(error = %e, "background flush failed");
        }
    }
}
