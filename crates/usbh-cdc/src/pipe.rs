//! Fixed-capacity byte ring buffer shared by one producer and one consumer
//!
//! Every device owns two pipes. For RX the transfer scheduler produces and the
//! application consumes; for TX it is the other way round. Cursors are
//! monotonic byte counters, the slot of a byte is `cursor % capacity`, and the
//! number of buffered bytes is `write - read`, which never exceeds the
//! capacity: the producer is told how much was accepted instead of
//! overwriting unread data.
//!
//! The data path takes no lock. A mutex/condvar pair exists only to park a
//! consumer that asked for a bounded blocking wait.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Capacity used when a configuration asks for 0 bytes
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Smallest accepted pipe capacity (one full-speed bulk packet)
pub const MIN_BUFFER_SIZE: usize = 64;

/// Position of a peeked region, used to commit it later
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadMark {
    cursor: u64,
    len: usize,
}

impl ReadMark {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct Pipe {
    buffer: Box<[AtomicU8]>,
    read: AtomicU64,
    write: AtomicU64,
    waiters: AtomicUsize,
    park: Mutex<()>,
    readable: Condvar,
}

impl Pipe {
    /// Allocate a pipe; `capacity == 0` selects [`DEFAULT_BUFFER_SIZE`]
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = if capacity == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            capacity
        };
        let mut buffer: Vec<AtomicU8> = Vec::new();
        buffer
            .try_reserve_exact(capacity)
            .map_err(|_| Error::OutOfMemory)?;
        buffer.extend((0..capacity).map(|_| AtomicU8::new(0)));

        Ok(Self {
            buffer: buffer.into_boxed_slice(),
            read: AtomicU64::new(0),
            write: AtomicU64::new(0),
            waiters: AtomicUsize::new(0),
            park: Mutex::new(()),
            readable: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes buffered and not yet consumed
    pub fn available_bytes(&self) -> usize {
        // read first: write can only have grown by the time it is loaded
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        write.saturating_sub(read) as usize
    }

    pub fn free_space(&self) -> usize {
        self.capacity() - self.available_bytes().min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.available_bytes() == 0
    }

    fn slot(&self, cursor: u64) -> &AtomicU8 {
        &self.buffer[(cursor % self.buffer.len() as u64) as usize]
    }

    /// Copy as many bytes as fit; returns the number accepted (producer side)
    pub fn push(&self, data: &[u8]) -> usize {
        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        let used = write.saturating_sub(read) as usize;
        let n = data.len().min(self.capacity().saturating_sub(used));
        if n == 0 {
            return 0;
        }

        for (i, byte) in data[..n].iter().enumerate() {
            self.slot(write + i as u64).store(*byte, Ordering::Relaxed);
        }
        self.write.store(write + n as u64, Ordering::SeqCst);

        if self.waiters.load(Ordering::SeqCst) > 0 {
            self.notify();
        }
        n
    }

    /// Copy up to `out.len()` buffered bytes without consuming them (consumer side)
    pub fn peek(&self, out: &mut [u8]) -> ReadMark {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        let len = out.len().min(write.saturating_sub(read) as usize);
        for (i, byte) in out[..len].iter_mut().enumerate() {
            *byte = self.slot(read + i as u64).load(Ordering::Relaxed);
        }
        ReadMark { cursor: read, len }
    }

    /// Consume a peeked region
    ///
    /// Returns false when the pipe was flushed after the peek; nothing is
    /// consumed in that case.
    pub fn commit(&self, mark: ReadMark) -> bool {
        if mark.len == 0 {
            return true;
        }
        self.read
            .compare_exchange(
                mark.cursor,
                mark.cursor + mark.len as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move up to `out.len()` bytes out of the pipe; returns the count (consumer side)
    pub fn pop(&self, out: &mut [u8]) -> usize {
        loop {
            let mark = self.peek(out);
            if mark.is_empty() {
                return 0;
            }
            if self.commit(mark) {
                return mark.len;
            }
            // Flushed between copy and commit; what was copied is stale
        }
    }

    /// Discard all buffered bytes
    pub fn flush(&self) {
        loop {
            let read = self.read.load(Ordering::Acquire);
            let write = self.write.load(Ordering::Acquire);
            if read >= write {
                return;
            }
            if self
                .read
                .compare_exchange(read, write, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Block until bytes are available or `timeout` elapses
    ///
    /// Returns whether bytes are available. Wakes early on [`Pipe::notify`].
    pub fn wait_readable(&self, timeout: Duration) -> bool {
        if !self.is_empty() {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }

        let deadline = Instant::now() + timeout;
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.park.lock().unwrap_or_else(|e| e.into_inner());
        let ready = loop {
            if !self.is_empty() {
                break true;
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            let (next, result) = self
                .readable
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = next;
            if result.timed_out() {
                break !self.is_empty();
            }
        };
        drop(guard);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        ready
    }

    /// Wake every consumer parked in [`Pipe::wait_readable`]
    pub fn notify(&self) {
        let _guard = self.park.lock().unwrap_or_else(|e| e.into_inner());
        self.readable.notify_all();
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("capacity", &self.capacity())
            .field("available", &self.available_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_default_capacity() {
        let pipe = Pipe::new(0).unwrap();
        assert_eq!(pipe.capacity(), DEFAULT_BUFFER_SIZE);
        assert!(pipe.is_empty());
        assert_eq!(pipe.free_space(), DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_push_is_bounded() {
        let pipe = Pipe::new(1024).unwrap();
        let data = vec![0xAA; 2000];

        assert_eq!(pipe.push(&data), 1024);
        assert_eq!(pipe.available_bytes(), 1024);
        assert_eq!(pipe.push(&data), 0);
    }

    #[test]
    fn test_wraparound_keeps_order() {
        let pipe = Pipe::new(8).unwrap();
        let mut out = [0u8; 8];

        assert_eq!(pipe.push(&[1, 2, 3, 4, 5, 6]), 6);
        assert_eq!(pipe.pop(&mut out[..4]), 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);

        // Crosses the end of the storage
        assert_eq!(pipe.push(&[7, 8, 9, 10, 11, 12]), 6);
        assert_eq!(pipe.pop(&mut out), 8);
        assert_eq!(out, [5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_peek_commit() {
        let pipe = Pipe::new(16).unwrap();
        pipe.push(b"abcdef");

        let mut out = [0u8; 4];
        let mark = pipe.peek(&mut out);
        assert_eq!(mark.len(), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(pipe.available_bytes(), 6);

        assert!(pipe.commit(mark));
        assert_eq!(pipe.available_bytes(), 2);
    }

    #[test]
    fn test_commit_after_flush_is_noop() {
        let pipe = Pipe::new(16).unwrap();
        pipe.push(b"abcdef");

        let mut out = [0u8; 6];
        let mark = pipe.peek(&mut out);
        pipe.flush();
        pipe.push(b"xy");

        assert!(!pipe.commit(mark));
        assert_eq!(pipe.available_bytes(), 2);
        assert_eq!(pipe.pop(&mut out), 2);
        assert_eq!(&out[..2], b"xy");
    }

    #[test]
    fn test_flush_twice() {
        let pipe = Pipe::new(32).unwrap();
        pipe.push(b"hello");

        pipe.flush();
        assert_eq!(pipe.available_bytes(), 0);
        pipe.flush();
        assert_eq!(pipe.available_bytes(), 0);
        assert_eq!(pipe.free_space(), 32);
    }

    #[test]
    fn test_wait_readable_times_out() {
        let pipe = Pipe::new(16).unwrap();
        assert!(!pipe.wait_readable(Duration::from_millis(10)));
        assert!(!pipe.wait_readable(Duration::ZERO));
    }

    #[test]
    fn test_wait_readable_wakes_on_push() {
        let pipe = Arc::new(Pipe::new(16).unwrap());
        let producer = pipe.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(b"x");
        });

        assert!(pipe.wait_readable(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_spsc_threads_preserve_stream() {
        const TOTAL: usize = 64 * 1024;
        let pipe = Arc::new(Pipe::new(100).unwrap());
        let producer = pipe.clone();

        let writer = std::thread::spawn(move || {
            let data: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
            let mut offset = 0;
            while offset < TOTAL {
                let end = (offset + 37).min(TOTAL);
                offset += producer.push(&data[offset..end]);
            }
        });

        let mut received = Vec::with_capacity(TOTAL);
        let mut buf = [0u8; 53];
        while received.len() < TOTAL {
            let n = pipe.pop(&mut buf);
            assert!(pipe.available_bytes() <= pipe.capacity());
            received.extend_from_slice(&buf[..n]);
        }
        writer.join().unwrap();

        assert!(received.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));
    }
}
