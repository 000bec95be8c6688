/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Global bandwidth limits shared by every host connection.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use borsh::{BorshDeserialize, BorshSerialize};

use super::HostStream;

/// Persisted rate limit settings. A limit of 0 means unlimited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RateLimits {
    pub read_bps: u64,
    pub write_bps: u64,
    /// Largest unit read or written at once. 0 means no bound.
    pub packet_size: u64,
}

struct Clocks {
    limits: RateLimits,
    next_read: Instant,
    next_write: Instant,
}

/// A pair of token buckets, one per direction.
pub struct RateLimit {
    clocks: Mutex<Clocks>,
}

impl RateLimit {
    pub fn new(limits: RateLimits) -> RateLimit {
        let now = Instant::now();
        RateLimit {
            clocks: Mutex::new(Clocks {
                limits,
                next_read: now,
                next_write: now,
            }),
        }
    }

    fn clocks(&self) -> MutexGuard<'_, Clocks> {
        self.clocks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn limits(&self) -> RateLimits {
        self.clocks().limits
    }

    pub fn set_limits(&self, limits: RateLimits) {
        let mut clocks = self.clocks();
        clocks.limits = limits;
        let now = Instant::now();
        clocks.next_read = now;
        clocks.next_write = now;
    }

    fn packet_size(&self, requested: usize) -> usize {
        match self.clocks().limits.packet_size {
            0 => requested,
            packet_size => requested.min(packet_size as usize),
        }
    }

    /// Account for `bytes` read and return how long the reader has to wait before continuing.
    fn reserve_read(&self, bytes: usize) -> Duration {
        let mut clocks = self.clocks();
        let bps = clocks.limits.read_bps;
        reserve(&mut clocks.next_read, bps, bytes)
    }

    fn reserve_write(&self, bytes: usize) -> Duration {
        let mut clocks = self.clocks();
        let bps = clocks.limits.write_bps;
        reserve(&mut clocks.next_write, bps, bytes)
    }
}

fn reserve(next: &mut Instant, bps: u64, bytes: usize) -> Duration {
    if bps == 0 {
        return Duration::ZERO;
    }
    let now = Instant::now();
    let start = (*next).max(now);
    *next = start + Duration::from_secs_f64(bytes as f64 / bps as f64);
    start.saturating_duration_since(now)
}

/// A stream whose reads and writes are throttled by a shared [`RateLimit`].
pub struct RateLimitedStream<S> {
    inner: S,
    limit: Arc<RateLimit>,
}

impl<S> RateLimitedStream<S> {
    pub fn new(inner: S, limit: Arc<RateLimit>) -> RateLimitedStream<S> {
        RateLimitedStream { inner, limit }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S: Read> Read for RateLimitedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let max = self.limit.packet_size(buf.len());
        let n = self.inner.read(&mut buf[..max])?;
        let wait = self.limit.reserve_read(n);
        if !wait.is_zero() {
            thread::sleep(wait);
        }
        Ok(n)
    }
}

impl<S: Write> Write for RateLimitedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let max = self.limit.packet_size(buf.len());
        let wait = self.limit.reserve_write(max);
        if !wait.is_zero() {
            thread::sleep(wait);
        }
        self.inner.write(&buf[..max])
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: HostStream> HostStream for RateLimitedStream<S> {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_timeout(timeout)
    }
}

impl HostStream for Box<dyn HostStream> {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        (**self).set_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_streams_pass_through() {
        let limit = Arc::new(RateLimit::new(RateLimits::default()));
        let mut stream = RateLimitedStream::new(Vec::new(), limit);
        stream.write_all(&[7u8; 4096]).unwrap();
        assert_eq!(stream.get_mut().len(), 4096);
    }

    #[test]
    fn packet_size_bounds_each_write() {
        let limit = Arc::new(RateLimit::new(RateLimits {
            read_bps: 0,
            write_bps: 0,
            packet_size: 100,
        }));
        let mut stream = RateLimitedStream::new(Vec::new(), limit);
        assert_eq!(stream.write(&[0u8; 250]).unwrap(), 100);
    }

    #[test]
    fn write_limit_delays_the_second_packet() {
        let limit = Arc::new(RateLimit::new(RateLimits {
            read_bps: 0,
            write_bps: 10_000,
            packet_size: 1_000,
        }));
        let mut stream = RateLimitedStream::new(Vec::new(), limit);
        let start = Instant::now();
        stream.write_all(&[0u8; 2_000]).unwrap();
        // The second 1000 byte packet waits for the first to drain at 10 kB/s.
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
