/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Coordinated shutdown of every long-lived renter thread.
//!
//! A [`ThreadGroup`] is owned by the [`Renter`](crate::renter::Renter) and cloned into each subsystem.
//! A thread that does work which must complete before shutdown calls [`add`](ThreadGroup::add) and
//! keeps the returned [`ThreadGuard`] alive for the duration of that work. [`stop`](ThreadGroup::stop)
//! flips the group into the stopped state, wakes every sleeper, runs the registered `on_stop` hooks, and
//! blocks until every guard is dropped.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::errors::RenterError;

#[derive(Default)]
struct ThreadGroupState {
    stopped: bool,
    active: usize,
    on_stop: Vec<Box<dyn FnOnce() + Send>>,
}

#[derive(Clone, Default)]
pub struct ThreadGroup {
    inner: Arc<(Mutex<ThreadGroupState>, Condvar)>,
}

/// Proof that a thread is registered with a [`ThreadGroup`]. Dropping it marks the thread as done.
pub struct ThreadGuard {
    group: ThreadGroup,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.group.inner;
        let mut state = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.active -= 1;
        cvar.notify_all();
    }
}

impl ThreadGroup {
    pub fn new() -> ThreadGroup {
        ThreadGroup::default()
    }

    fn state(&self) -> MutexGuard<'_, ThreadGroupState> {
        self.inner.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a unit of work. Fails with [`RenterError::Shutdown`] once the group is stopped.
    pub fn add(&self) -> Result<ThreadGuard, RenterError> {
        let mut state = self.state();
        if state.stopped {
            return Err(RenterError::Shutdown);
        }
        state.active += 1;
        Ok(ThreadGuard { group: self.clone() })
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    /// Sleep for `duration` or until the group is stopped, whichever comes first. Returns `true` if the
    /// group was stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if state.stopped {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match cvar.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Register `f` to run when the group stops. If the group is already stopped, `f` runs immediately.
    pub fn on_stop(&self, f: impl FnOnce() + Send + 'static) {
        let mut state = self.state();
        if state.stopped {
            drop(state);
            f();
            return;
        }
        state.on_stop.push(Box::new(f));
    }

    /// Run `f` on a new thread after `delay`, unless the group stops first.
    pub fn after_func(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        let group = self.clone();
        thread::spawn(move || {
            if group.sleep(delay) {
                return;
            }
            if let Ok(_guard) = group.add() {
                f();
            }
        });
    }

    /// Stop the group: refuse new work, wake sleepers, run `on_stop` hooks and wait for every registered
    /// unit of work to finish. Stopping twice is an error.
    pub fn stop(&self) -> Result<(), RenterError> {
        let hooks = {
            let mut state = self.state();
            if state.stopped {
                return Err(RenterError::Shutdown);
            }
            state.stopped = true;
            self.inner.1.notify_all();
            std::mem::take(&mut state.on_stop)
        };
        // Hooks run in reverse registration order so that later subsystems shut down first.
        for hook in hooks.into_iter().rev() {
            hook();
        }
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while state.active > 0 {
            state = match cvar.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        Ok(())
    }
}
