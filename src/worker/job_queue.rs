/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Queues of jobs waiting for a worker.
//!
//! A queue is a `(submit, next)` pair: callers [`add`](JobQueue::add) jobs from any thread, and only
//! the worker's loop takes them out again with [`next`](JobQueue::next). Each queue keeps its own
//! failure statistics and cooldown, so that a host that keeps failing one kind of job is not asked to
//! do more of it while other kinds of jobs keep flowing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use super::cooldown::cooldown_duration;
use crate::errors::RenterError;

/// Shared flag that tells a job, and everything it started, to give up.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled.
    pub fn check(&self) -> Result<(), RenterError> {
        if self.is_cancelled() {
            Err(RenterError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A job that can sit in a [`JobQueue`].
pub(crate) trait Job: Send + 'static {
    /// Fail the job without running it.
    fn discard(self, err: RenterError);

    fn cancel_token(&self) -> &CancelToken;

    /// Bytes the job sends to and receives from the host, used to bound the data of async jobs in flight.
    fn expected_bandwidth(&self) -> (u64, u64);
}

/// Answer a job's caller. The caller may have given up waiting, which is fine.
pub(crate) fn respond<T>(response: &Sender<Result<T, RenterError>>, result: Result<T, RenterError>) {
    let _ = response.send(result);
}

struct JobQueueState<J> {
    jobs: VecDeque<J>,
    killed: bool,
    consecutive_failures: u64,
    recent_error: Option<String>,
    recent_error_time: Option<SystemTime>,
    cooldown_until: Option<Instant>,
    total_job_time: Duration,
    jobs_completed: u64,
}

pub(crate) struct JobQueue<J> {
    state: Mutex<JobQueueState<J>>,
}

/// The state of one queue, as reported by worker status.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobQueueStatus {
    pub queue_size: usize,
    pub consecutive_failures: u64,
    pub on_cooldown: bool,
    pub cooldown_remaining: Duration,
    pub recent_error: Option<String>,
    pub recent_error_time: Option<SystemTime>,
    pub average_job_time: Duration,
    pub killed: bool,
}

impl<J: Job> JobQueue<J> {
    pub(crate) fn new() -> JobQueue<J> {
        JobQueue {
            state: Mutex::new(JobQueueState {
                jobs: VecDeque::new(),
                killed: false,
                consecutive_failures: 0,
                recent_error: None,
                recent_error_time: None,
                cooldown_until: None,
                total_job_time: Duration::ZERO,
                jobs_completed: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobQueueState<J>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue `job`. A killed queue or one on cooldown fails the job right away.
    pub(crate) fn add(&self, job: J) -> bool {
        let mut state = self.lock();
        if state.killed {
            drop(state);
            job.discard(RenterError::Shutdown);
            return false;
        }
        if let Some(until) = state.cooldown_until {
            if Instant::now() < until {
                let err = state.recent_error.clone().unwrap_or_default();
                drop(state);
                job.discard(RenterError::Transient(format!("worker queue is on cooldown: {}", err)));
                return false;
            }
        }
        state.jobs.push_back(job);
        true
    }

    /// The next job that has not been cancelled. Cancelled jobs are failed on the way.
    pub(crate) fn next(&self) -> Option<J> {
        let mut state = self.lock();
        if let Some(until) = state.cooldown_until {
            if Instant::now() < until {
                return None;
            }
        }
        while let Some(job) = state.jobs.pop_front() {
            if job.cancel_token().is_cancelled() {
                job.discard(RenterError::Cancelled);
                continue;
            }
            return Some(job);
        }
        None
    }

    /// Bandwidth of the job [`next`](Self::next) would return, without taking it.
    pub(crate) fn peek_bandwidth(&self) -> Option<(u64, u64)> {
        self.lock().jobs.front().map(Job::expected_bandwidth)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub(crate) fn has_job(&self) -> bool {
        let state = self.lock();
        !state.jobs.is_empty() && state.cooldown_until.map_or(true, |until| Instant::now() >= until)
    }

    pub(crate) fn report_success(&self, elapsed: Duration) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.cooldown_until = None;
        state.total_job_time += elapsed;
        state.jobs_completed += 1;
    }

    /// Record a failed job and put the queue on cooldown. Queued jobs are failed too, since the host
    /// will not be asked again until the cooldown ends. Returns the failure count and the cooldown.
    pub(crate) fn report_failure(&self, err: &RenterError, base: Duration, max_penalty: u32) -> (u64, Duration) {
        let (failures, cooldown, queued) = {
            let mut state = self.lock();
            state.consecutive_failures += 1;
            state.recent_error = Some(err.to_string());
            state.recent_error_time = Some(SystemTime::now());
            let cooldown = cooldown_duration(base, state.consecutive_failures, max_penalty);
            state.cooldown_until = Some(Instant::now() + cooldown);
            (state.consecutive_failures, cooldown, std::mem::take(&mut state.jobs))
        };
        for job in queued {
            job.discard(RenterError::Transient(format!("an earlier job on this worker failed: {}", err)));
        }
        (failures, cooldown)
    }

    /// Refuse all future jobs and fail the queued ones.
    pub(crate) fn kill(&self) {
        let queued = {
            let mut state = self.lock();
            state.killed = true;
            std::mem::take(&mut state.jobs)
        };
        for job in queued {
            job.discard(RenterError::Shutdown);
        }
    }

    pub(crate) fn status(&self) -> JobQueueStatus {
        let state = self.lock();
        let now = Instant::now();
        let cooldown_remaining = state
            .cooldown_until
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(now));
        let average_job_time = if state.jobs_completed == 0 {
            Duration::ZERO
        } else {
            state.total_job_time / state.jobs_completed as u32
        };
        JobQueueStatus {
            queue_size: state.jobs.len(),
            consecutive_failures: state.consecutive_failures,
            on_cooldown: cooldown_remaining > Duration::ZERO,
            cooldown_remaining,
            recent_error: state.recent_error.clone(),
            recent_error_time: state.recent_error_time,
            average_job_time,
            killed: state.killed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{self, Receiver};

    struct TestJob {
        cancel: CancelToken,
        response: Sender<Result<u64, RenterError>>,
    }

    impl Job for TestJob {
        fn discard(self, err: RenterError) {
            respond(&self.response, Err(err))
        }

        fn cancel_token(&self) -> &CancelToken {
            &self.cancel
        }

        fn expected_bandwidth(&self) -> (u64, u64) {
            (0, 10)
        }
    }

    fn job() -> (TestJob, Receiver<Result<u64, RenterError>>) {
        let (response, receiver) = mpsc::channel();
        (
            TestJob {
                cancel: CancelToken::new(),
                response,
            },
            receiver,
        )
    }

    #[test]
    fn cancelled_jobs_are_skipped() {
        let queue = JobQueue::new();
        let (first, first_rx) = job();
        let (second, _second_rx) = job();
        first.cancel.cancel();
        queue.add(first);
        queue.add(second);
        assert_eq!(queue.len(), 2);
        assert!(queue.next().is_some());
        assert!(matches!(first_rx.recv().unwrap(), Err(RenterError::Cancelled)));
        assert!(queue.next().is_none());
    }

    #[test]
    fn failures_put_the_queue_on_cooldown() {
        let queue = JobQueue::new();
        let (queued, queued_rx) = job();
        queue.add(queued);
        let (failures, cooldown) =
            queue.report_failure(&RenterError::Transient("boom".into()), Duration::from_secs(1), 3);
        assert_eq!(failures, 1);
        assert_eq!(cooldown, Duration::from_secs(2));
        assert!(queued_rx.recv().unwrap().is_err());

        let (late, late_rx) = job();
        assert!(!queue.add(late));
        assert!(late_rx.recv().unwrap().is_err());
        let status = queue.status();
        assert!(status.on_cooldown);
        assert_eq!(status.recent_error.as_deref(), Some("transient network error: boom"));

        queue.report_success(Duration::from_millis(40));
        assert!(!queue.status().on_cooldown);
        assert_eq!(queue.status().average_job_time, Duration::from_millis(40));
    }

    #[test]
    fn killed_queues_refuse_jobs() {
        let queue = JobQueue::new();
        let (queued, queued_rx) = job();
        queue.add(queued);
        queue.kill();
        assert!(queued_rx.recv().unwrap().unwrap_err().is_shutdown());
        let (late, _late_rx) = job();
        assert!(!queue.add(late));
        assert!(queue.status().killed);
    }
}
