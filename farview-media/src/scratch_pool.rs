//! Reusable buffer pool backing decoded-frame storage.
//!
//! Decoders produce a full frame every few milliseconds; allocating fresh
//! pixel storage per frame churns the allocator at exactly the wrong time.
//! The pool leases buffers and takes them back when the frame handle is
//! closed. Leases nest freely (each lease is independent storage), and the
//! pool is bounded: it retains at most `MAX_RETAINED` buffers and never
//! retains oversized ones.

use std::sync::{Arc, Mutex};

/// Buffers kept for reuse.
const MAX_RETAINED: usize = 8;

/// Largest buffer the pool will take back (a 4K RGBA frame).
const MAX_RETAINED_BYTES: usize = 3840 * 2160 * 4;

#[derive(Default)]
struct PoolShared {
    free: Mutex<Vec<Vec<u8>>>,
}

/// Shared, cloneable pool handle.
#[derive(Clone, Default)]
pub struct ScratchPool {
    shared: Arc<PoolShared>,
}

impl ScratchPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease a zeroed buffer of exactly `len` bytes, reusing retained
    /// storage when possible.
    pub fn lease(&self, len: usize) -> ScratchBuffer {
        let mut free = self.shared.free.lock().expect("scratch pool poisoned");
        let mut data = free
            .iter()
            .position(|buf| buf.capacity() >= len)
            .map(|i| free.swap_remove(i))
            .unwrap_or_default();
        drop(free);

        data.clear();
        data.resize(len, 0);
        ScratchBuffer {
            data,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of buffers currently retained for reuse.
    pub fn retained(&self) -> usize {
        self.shared.free.lock().expect("scratch pool poisoned").len()
    }
}

/// A leased buffer; returns to its pool on drop.
pub struct ScratchBuffer {
    data: Vec<u8>,
    shared: Arc<PoolShared>,
}

impl ScratchBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for ScratchBuffer {
    fn drop(&mut self) {
        if self.data.capacity() == 0 || self.data.capacity() > MAX_RETAINED_BYTES {
            return;
        }
        let mut free = match self.shared.free.lock() {
            Ok(free) => free,
            Err(_) => return,
        };
        if free.len() < MAX_RETAINED {
            free.push(std::mem::take(&mut self.data));
        }
    }
}

impl std::fmt::Debug for ScratchBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_returns_zeroed() {
        let pool = ScratchPool::new();
        let mut a = pool.lease(16);
        a.as_mut_slice().fill(0xFF);
        drop(a);
        let b = pool.lease(16);
        assert!(b.as_slice().iter().all(|&x| x == 0));
    }

    #[test]
    fn buffers_are_reused() {
        let pool = ScratchPool::new();
        let a = pool.lease(1024);
        drop(a);
        assert_eq!(pool.retained(), 1);
        let _b = pool.lease(512);
        assert_eq!(pool.retained(), 0, "retained buffer should be reused");
    }

    #[test]
    fn nested_leases_are_disjoint() {
        let pool = ScratchPool::new();
        let mut a = pool.lease(8);
        let mut b = pool.lease(8);
        a.as_mut_slice().fill(1);
        b.as_mut_slice().fill(2);
        assert!(a.as_slice().iter().all(|&x| x == 1));
        assert!(b.as_slice().iter().all(|&x| x == 2));
    }

    #[test]
    fn pool_is_bounded() {
        let pool = ScratchPool::new();
        let leases: Vec<_> = (0..MAX_RETAINED + 4).map(|_| pool.lease(64)).collect();
        drop(leases);
        assert!(pool.retained() <= MAX_RETAINED);
    }
}
