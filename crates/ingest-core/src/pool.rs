//! Object pools
//!
//! The collect path allocates an event record per request and an output
//! buffer per batch. Both are recycled through simple mutex-guarded
//! free lists to keep steady-state allocation flat:
//!
//! - [`EventPool`] hands out cleared [`Event`] records.
//! - [`BufferPool`] hands out byte buffers pre-sized for a typical
//!   compressed batch; oversized buffers are dropped on return rather
//!   than retained, which bounds steady-state memory.

use std::sync::{Arc, Mutex};

use crate::event::Event;

/// Initial capacity of a pooled encode buffer (256 KiB)
pub const DEFAULT_BUFFER_CAPACITY: usize = 256 * 1024;

/// Buffers whose capacity grew past this are not returned to the pool
/// (1 MiB)
pub const MAX_RETAINED_CAPACITY: usize = 1024 * 1024;

/// Free list of reusable event records.
#[derive(Debug, Default)]
pub struct EventPool {
    records: Mutex<Vec<Box<Event>>>,
}

impl EventPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take a cleared record from the pool, allocating when empty.
    pub fn acquire(&self) -> Box<Event> {
        self.records
            .lock()
            .map(|mut records| records.pop())
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// Clear a record and return it to the pool.
    pub fn release(&self, mut record: Box<Event>) {
        record.clear();
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    /// Number of idle records currently pooled.
    pub fn idle(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }
}

/// Free list of encode buffers with a retention ceiling.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    initial_capacity: usize,
    max_retained: usize,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Self::with_limits(DEFAULT_BUFFER_CAPACITY, MAX_RETAINED_CAPACITY)
    }

    pub fn with_limits(initial_capacity: usize, max_retained: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Vec::new()),
            initial_capacity,
            max_retained,
        })
    }

    /// Take an empty buffer from the pool. The returned guard puts the
    /// buffer back when dropped.
    pub fn acquire(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .buffers
            .lock()
            .map(|mut buffers| buffers.pop())
            .ok()
            .flatten()
            .unwrap_or_else(|| Vec::with_capacity(self.initial_capacity));

        PooledBuf {
            buf,
            pool: Arc::clone(self),
        }
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.max_retained {
            return;
        }
        buf.clear();
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.push(buf);
        }
    }

    /// Number of idle buffers currently pooled.
    pub fn idle(&self) -> usize {
        self.buffers.lock().map(|buffers| buffers.len()).unwrap_or(0)
    }
}

/// Owned handle to a pooled buffer. There is exactly one holder at a
/// time; dropping the handle returns the buffer to its pool.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl std::io::Write for PooledBuf {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn event_pool_recycles_cleared_records() {
        let pool = EventPool::new();

        let mut ev = pool.acquire();
        ev.ts = 99;
        ev.body.push_str("payload");
        pool.release(ev);
        assert_eq!(pool.idle(), 1);

        let ev = pool.acquire();
        assert_eq!(ev.ts, 0);
        assert!(ev.body.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn buffer_pool_retains_small_buffers() {
        let pool = BufferPool::with_limits(64, 1024);

        {
            let mut buf = pool.acquire();
            buf.write_all(b"hello").unwrap();
        }
        assert_eq!(pool.idle(), 1);

        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert!(buf.buf.capacity() >= 64);
    }

    #[test]
    fn buffer_pool_drops_oversized_buffers() {
        let pool = BufferPool::with_limits(64, 128);

        {
            let mut buf = pool.acquire();
            buf.write_all(&vec![0u8; 4096]).unwrap();
        }

        assert_eq!(pool.idle(), 0);
    }
}
