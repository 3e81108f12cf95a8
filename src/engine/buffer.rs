use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use crate::{
    Error, Result,
    error::{ConnectionError, TimeoutKind},
};

struct Inner {
    data: Vec<u8>,
    open: bool,
}

/// Bounded byte buffer shared by producers and the writer loop.
///
/// Producers append whole encoded messages; the writer takes everything at
/// once, so a message is never split across two socket writes.
pub(crate) struct OutboundBuffer {
    capacity: usize,
    direct_threshold: usize,
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl OutboundBuffer {
    /// `direct_write_factor` is the fraction of `capacity` above which a
    /// message skips the buffer.
    pub fn new(capacity: usize, direct_write_factor: f64) -> Self {
        let capacity = capacity.max(1);
        let direct_threshold = (capacity as f64 * direct_write_factor.max(0.0)) as usize;
        Self {
            capacity,
            direct_threshold: direct_threshold.min(capacity),
            inner: Mutex::new(Inner {
                data: Vec::with_capacity(capacity),
                open: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a message of `len` bytes must be written directly to the socket.
    pub fn is_direct(&self, len: usize) -> bool {
        len > self.direct_threshold
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a message, waiting up to `timeout` for room.
    pub fn push(&self, bytes: &[u8], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if !inner.open {
                return Err(Error::Connection(ConnectionError::NotConnected));
            }
            if inner.data.len() + bytes.len() <= self.capacity {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(TimeoutKind::Write));
            }
            inner = self
                .not_full
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let was_empty = inner.data.is_empty();
        inner.data.extend_from_slice(bytes);
        if was_empty {
            self.not_empty.notify_all();
        }
        Ok(())
    }

    /// Blocks until data is available and swaps it into `batch`.
    ///
    /// `batch` must be empty; its allocation is handed back to the buffer.
    /// Returns `false` once the buffer is closed.
    pub fn take(&self, batch: &mut Vec<u8>) -> bool {
        let mut inner = self.lock();
        loop {
            if !inner.open {
                return false;
            }
            if !inner.data.is_empty() {
                std::mem::swap(&mut inner.data, batch);
                self.not_full.notify_all();
                return true;
            }
            inner = self
                .not_empty
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Accepts messages for a fresh connection.
    pub fn open(&self) {
        let mut inner = self.lock();
        inner.data.clear();
        inner.open = true;
    }

    /// Drops buffered bytes and releases every waiter.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.open = false;
        inner.data.clear();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn closed_buffer_rejects_producers() {
        let buffer = OutboundBuffer::new(16, 0.5);
        assert!(matches!(
            buffer.push(b"abc", Duration::from_millis(10)),
            Err(Error::Connection(ConnectionError::NotConnected))
        ));
    }

    #[test]
    fn direct_threshold_follows_factor() {
        let buffer = OutboundBuffer::new(100, 0.5);
        assert!(!buffer.is_direct(50));
        assert!(buffer.is_direct(51));

        // a factor above one still never lets a message exceed capacity
        let buffer = OutboundBuffer::new(100, 4.0);
        assert!(buffer.is_direct(101));
    }

    #[test]
    fn full_buffer_times_out() {
        let buffer = OutboundBuffer::new(8, 1.0);
        buffer.open();
        buffer.push(&[1; 6], Duration::from_millis(10)).unwrap();

        let started = Instant::now();
        assert!(matches!(
            buffer.push(&[2; 4], Duration::from_millis(30)),
            Err(Error::Timeout(TimeoutKind::Write))
        ));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(buffer.len(), 6);
    }

    #[test]
    fn drain_makes_room_for_waiting_producer() {
        let buffer = Arc::new(OutboundBuffer::new(8, 1.0));
        buffer.open();
        buffer.push(&[1; 6], Duration::from_millis(10)).unwrap();

        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.push(&[2; 4], Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        let mut batch = Vec::new();
        assert!(buffer.take(&mut batch));
        assert_eq!(batch, vec![1; 6]);

        producer.join().unwrap().unwrap();
        batch.clear();
        assert!(buffer.take(&mut batch));
        assert_eq!(batch, vec![2; 4]);
    }

    #[test]
    fn close_releases_writer() {
        let buffer = Arc::new(OutboundBuffer::new(8, 1.0));
        buffer.open();
        let writer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut batch = Vec::new();
                buffer.take(&mut batch)
            })
        };
        thread::sleep(Duration::from_millis(20));
        buffer.close();
        assert!(!writer.join().unwrap());
    }

    #[test]
    fn messages_are_never_split() {
        let buffer = Arc::new(OutboundBuffer::new(64, 1.0));
        buffer.open();

        let producers: Vec<_> = (0..4_u8)
            .map(|p| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for _ in 0..50 {
                        buffer.push(&[p; 10], Duration::from_secs(5)).unwrap();
                    }
                })
            })
            .collect();

        let mut received = 0;
        let mut batch = Vec::new();
        while received < 4 * 50 * 10 {
            assert!(buffer.take(&mut batch));
            assert_eq!(batch.len() % 10, 0);
            for chunk in batch.chunks(10) {
                assert!(chunk.iter().all(|b| *b == chunk[0]));
            }
            received += batch.len();
            batch.clear();
        }

        for p in producers {
            p.join().unwrap();
        }
    }
}
