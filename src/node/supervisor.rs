//! Task supervision
//!
//! Every long-running duty is a named OS thread owned by a [`TaskSet`].
//! Sleeping is done on the set's [`StopSignal`], so stopping a set wakes
//! all of its threads at once.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::Result;

/// Cancellation flag with a condvar for interruptible sleeps
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every waiter
    pub fn stop(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`; returns `true` if the signal was raised
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (stopped, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }

    /// Block until the signal is raised
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _stopped = cvar
            .wait_while(guard, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Threads belonging to one stop scope
pub struct TaskSet {
    name: &'static str,
    stop: StopSignal,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl TaskSet {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            stop: StopSignal::new(),
            tasks: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Start a named thread that receives this set's stop signal
    pub fn spawn<F>(&mut self, task: &str, f: F) -> Result<()>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.name, task))
            .spawn(move || f(stop))?;
        tracing::debug!("Started {} task {}", self.name, task);
        self.tasks.push((task.to_string(), handle));
        Ok(())
    }

    /// Whether any thread of the set is still running
    pub fn is_running(&self) -> bool {
        !self.stop.is_stopped() && self.tasks.iter().any(|(_, h)| !h.is_finished())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Raise the stop signal and join threads for at most `timeout`
    ///
    /// Threads still running at the deadline are detached. Returns how many
    /// were left behind.
    pub fn stop_and_join(self, timeout: Duration) -> usize {
        self.stop.stop();

        let current = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut stragglers = 0;

        for (task, handle) in self.tasks {
            // A task stopping its own set cannot join itself
            if handle.thread().id() == current {
                continue;
            }

            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }

            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::warn!("{} task {} panicked", self.name, task);
                }
            } else {
                tracing::warn!("{} task {} did not stop within {:?}", self.name, task, timeout);
                stragglers += 1;
            }
        }

        stragglers
    }
}
