/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Caps the bytes held by chunks in flight.
//!
//! Memory is handed out in [`MemoryGrant`]s, which give their bytes back when dropped. There are two
//! pools. The normal pool serves background work, such as repairing chunks. The priority pool is an
//! extra reserve that only priority requests (user uploads and downloads) may draw from once the normal
//! pool is exhausted, so that user operations are not starved by a long repair backlog. Waiting priority
//! requests are also served before waiting normal ones.
//!
//! A request for more than a pool's limit is granted once the pool is completely free, so that large
//! chunks still make progress.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::errors::RenterError;

struct MemoryState {
    normal_available: u64,
    priority_available: u64,
    priority_waiting: usize,
    stopped: bool,
}

pub struct MemoryManager {
    normal_limit: u64,
    priority_limit: u64,
    state: Mutex<MemoryState>,
    released: Condvar,
}

/// Memory held by one chunk. Returned to the manager when dropped.
pub struct MemoryGrant {
    manager: Arc<MemoryManager>,
    normal: u64,
    priority: u64,
}

/// How much memory is in use, for status reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryStatus {
    pub normal_available: u64,
    pub normal_limit: u64,
    pub priority_available: u64,
    pub priority_limit: u64,
}

impl MemoryManager {
    pub fn new(normal_limit: u64, priority_limit: u64) -> Arc<MemoryManager> {
        Arc::new(MemoryManager {
            normal_limit,
            priority_limit,
            state: Mutex::new(MemoryState {
                normal_available: normal_limit,
                priority_available: priority_limit,
                priority_waiting: 0,
                stopped: false,
            }),
            released: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take `amount` bytes out of the pools if that is possible right now. Returns the bytes taken from
    /// the normal and the priority pool.
    fn take(&self, state: &mut MemoryState, amount: u64, priority: bool) -> Option<(u64, u64)> {
        if amount <= state.normal_available {
            state.normal_available -= amount;
            return Some((amount, 0));
        }
        if priority && amount <= state.normal_available + state.priority_available {
            let normal = state.normal_available;
            let extra = amount - normal;
            state.normal_available = 0;
            state.priority_available -= extra;
            return Some((normal, extra));
        }
        // Oversized requests wait for idle pools and then take all of them.
        let cap = self.normal_limit + if priority { self.priority_limit } else { 0 };
        let idle = state.normal_available == self.normal_limit
            && (!priority || state.priority_available == self.priority_limit);
        if amount > cap && idle {
            let normal = state.normal_available;
            let extra = if priority { state.priority_available } else { 0 };
            state.normal_available = 0;
            state.priority_available -= extra;
            return Some((normal, extra));
        }
        None
    }

    /// Block until `amount` bytes are available, then take them.
    pub fn request(self: &Arc<Self>, amount: u64, priority: bool) -> Result<MemoryGrant, RenterError> {
        let mut state = self.lock();
        if priority {
            state.priority_waiting += 1;
        }
        loop {
            if state.stopped {
                if priority {
                    state.priority_waiting -= 1;
                }
                return Err(RenterError::Shutdown);
            }
            // Normal requests step aside while priority requests wait.
            if priority || state.priority_waiting == 0 {
                if let Some((normal, extra)) = self.take(&mut state, amount, priority) {
                    if priority {
                        state.priority_waiting -= 1;
                    }
                    return Ok(MemoryGrant {
                        manager: self.clone(),
                        normal,
                        priority: extra,
                    });
                }
            }
            state = self
                .released
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Take `amount` bytes if they are available right now.
    pub fn try_request(self: &Arc<Self>, amount: u64, priority: bool) -> Option<MemoryGrant> {
        let mut state = self.lock();
        if state.stopped || (!priority && state.priority_waiting > 0) {
            return None;
        }
        self.take(&mut state, amount, priority).map(|(normal, extra)| MemoryGrant {
            manager: self.clone(),
            normal,
            priority: extra,
        })
    }

    fn give_back(&self, normal: u64, priority: u64) {
        if normal == 0 && priority == 0 {
            return;
        }
        let mut state = self.lock();
        state.normal_available = (state.normal_available + normal).min(self.normal_limit);
        state.priority_available = (state.priority_available + priority).min(self.priority_limit);
        drop(state);
        self.released.notify_all();
    }

    pub fn status(&self) -> MemoryStatus {
        let state = self.lock();
        MemoryStatus {
            normal_available: state.normal_available,
            normal_limit: self.normal_limit,
            priority_available: state.priority_available,
            priority_limit: self.priority_limit,
        }
    }

    /// Fail every waiting and future request.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.released.notify_all();
    }
}

impl MemoryGrant {
    /// Bytes this grant still holds.
    pub fn amount(&self) -> u64 {
        self.normal + self.priority
    }

    /// Give `amount` bytes back early, for example once a piece has been uploaded.
    pub fn release(&mut self, amount: u64) {
        // Priority memory goes back first so that it is available to the next user operation.
        let priority = amount.min(self.priority);
        let normal = (amount - priority).min(self.normal);
        self.priority -= priority;
        self.normal -= normal;
        self.manager.give_back(normal, priority);
    }
}

impl Drop for MemoryGrant {
    fn drop(&mut self) {
        self.manager.give_back(self.normal, self.priority);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn grants_are_returned_on_drop() {
        let manager = MemoryManager::new(100, 50);
        let grant = manager.request(60, false).unwrap();
        assert!(manager.try_request(60, false).is_none());
        let priority = manager.try_request(60, true).unwrap();
        assert_eq!(manager.status().normal_available, 0);
        assert_eq!(manager.status().priority_available, 30);
        drop(grant);
        drop(priority);
        assert_eq!(manager.status().normal_available, 100);
        assert_eq!(manager.status().priority_available, 50);
    }

    #[test]
    fn partial_release_returns_priority_memory_first() {
        let manager = MemoryManager::new(100, 50);
        let mut grant = manager.request(120, true).unwrap();
        assert_eq!(grant.amount(), 120);
        grant.release(30);
        assert_eq!(manager.status().priority_available, 50);
        assert_eq!(manager.status().normal_available, 10);
        assert_eq!(grant.amount(), 90);
    }

    #[test]
    fn oversized_requests_wait_for_an_idle_pool() {
        let manager = MemoryManager::new(100, 0);
        let small = manager.request(10, false).unwrap();
        assert!(manager.try_request(500, false).is_none());
        drop(small);
        let big = manager.try_request(500, false).unwrap();
        assert_eq!(big.amount(), 100);
    }

    #[test]
    fn blocked_requests_wake_on_release_and_stop() {
        let manager = MemoryManager::new(10, 0);
        let grant = manager.request(10, false).unwrap();
        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.request(5, false).map(|grant| grant.amount()))
        };
        thread::sleep(Duration::from_millis(50));
        drop(grant);
        assert_eq!(waiter.join().unwrap().unwrap(), 5);

        let _hold = manager.request(10, false).unwrap();
        let stopped = {
            let manager = manager.clone();
            thread::spawn(move || manager.request(5, false).is_err())
        };
        thread::sleep(Duration::from_millis(50));
        manager.stop();
        assert!(stopped.join().unwrap());
    }
}
