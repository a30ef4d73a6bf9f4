//! Device-side frame buffer pool.
//!
//! Capture threads copy driver memory into a pooled buffer before pushing a
//! frame. Buffers return to the pool when the consumer releases the frame,
//! so steady-state streaming does not allocate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flume::{Receiver, Sender};
use tracing::debug;

/// Fixed-size set of reusable frame buffers
#[derive(Clone)]
pub struct FramePool {
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
    frame_bytes: usize,
    overflow: Arc<AtomicU64>,
}

impl FramePool {
    /// Pre-allocate `slots` buffers of `frame_bytes` each
    pub fn new(slots: usize, frame_bytes: usize) -> Self {
        let slots = slots.max(1);
        let (free_tx, free_rx) = flume::bounded(slots);
        for _ in 0..slots {
            let _ = free_tx.try_send(vec![0u8; frame_bytes]);
        }

        Self {
            free_tx,
            free_rx,
            frame_bytes,
            overflow: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Take a buffer from the pool, allocating a temporary one if the pool
    /// is exhausted. Temporary buffers are discarded on return when the pool
    /// is already full.
    pub fn acquire(&self) -> PooledBuffer {
        let buf = match self.free_rx.try_recv() {
            Ok(buf) => buf,
            Err(_) => {
                let n = self.overflow.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(overflow = n, "Frame pool exhausted, allocating");
                vec![0u8; self.frame_bytes]
            }
        };

        PooledBuffer {
            buf,
            len: 0,
            home: Some(self.free_tx.clone()),
        }
    }

    /// Buffers currently sitting in the pool
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.free_tx.capacity().unwrap_or(0)
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Buffers allocated because the pool was empty
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

/// A buffer on loan from a `FramePool`
pub struct PooledBuffer {
    buf: Vec<u8>,
    len: usize,
    home: Option<Sender<Vec<u8>>>,
}

impl PooledBuffer {
    /// Buffer not tied to any pool
    pub fn detached(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            buf: data,
            len,
            home: None,
        }
    }

    /// Replace the contents with `src`, growing the buffer if needed
    pub fn fill_from(&mut self, src: &[u8]) {
        if self.buf.len() < src.len() {
            self.buf.resize(src.len(), 0);
        }
        self.buf[..src.len()].copy_from_slice(src);
        self.len = src.len();
    }

    /// Writable view of the first `len` bytes, marking them valid
    pub fn fill_with(&mut self, len: usize) -> &mut [u8] {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
        self.len = len;
        &mut self.buf[..len]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            // Full pool or pool gone: let the buffer drop.
            let _ = home.try_send(std::mem::take(&mut self.buf));
        }
    }
}
