//! Per-worker buffer pools.
//!
//! Media bytes live in fixed 1536-byte slots (one MTU) that are filled once
//! on receive and then travel by reference: the send queue, the reorder
//! window and the in-flight zero-copy table all hold [`BufferRef`] clones of
//! the same slot. Workers are single-threaded, so the reference count is an
//! ordinary `Rc` and pool bookkeeping is plain integers.
//!
//! `acquire` never blocks. When the pool is out of slots it either grows by
//! a geometric step (up to the configured ceiling) or reports exhaustion,
//! and the caller sheds load by dropping the datagram it was about to read.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::debug;

/// Slot size: one ethernet MTU, which every RTP datagram we relay fits in.
pub const BUFFER_SIZE: usize = 1536;

/// Free fraction that must persist before the pool gives memory back.
const CONTRACT_FREE_FRACTION: f64 = 0.75;
const CONTRACT_AFTER: Duration = Duration::from_secs(5);
const GROWTH_NUMERATOR: usize = 3;
const GROWTH_DENOMINATOR: usize = 2;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub free: usize,
    pub used: usize,
    pub max: usize,
    pub expansions: u64,
    pub exhaustions: u64,
}

struct PoolInner {
    free: Vec<Box<[u8; BUFFER_SIZE]>>,
    total: usize,
    initial: usize,
    max: usize,
    expansions: u64,
    exhaustions: u64,
    over_free_since: Option<Instant>,
}

impl PoolInner {
    fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.total,
            free: self.free.len(),
            used: self.total - self.free.len(),
            max: self.max,
            expansions: self.expansions,
            exhaustions: self.exhaustions,
        }
    }
}

/// Shared handle to one worker pool. Cloning is cheap; all clones feed the
/// same slots.
#[derive(Clone)]
pub struct BufferPool {
    inner: Rc<RefCell<PoolInner>>,
}

impl BufferPool {
    pub fn new(initial: usize, max: usize) -> Self {
        let initial = initial.max(1);
        let max = max.max(initial);
        let mut free = Vec::with_capacity(initial);
        for _ in 0..initial {
            free.push(Box::new([0u8; BUFFER_SIZE]));
        }
        Self {
            inner: Rc::new(RefCell::new(PoolInner {
                free,
                total: initial,
                initial,
                max,
                expansions: 0,
                exhaustions: 0,
                over_free_since: None,
            })),
        }
    }

    /// Take a writable slot, growing the pool if it is drained and still
    /// under its ceiling. `None` means exhausted: shed load upstream.
    pub fn acquire(&self) -> Option<PoolBuffer> {
        let mut inner = self.inner.borrow_mut();
        if inner.free.is_empty() {
            if inner.total < inner.max {
                let target = (inner.total * GROWTH_NUMERATOR / GROWTH_DENOMINATOR)
                    .clamp(inner.total + 1, inner.max);
                let grow_by = target - inner.total;
                for _ in 0..grow_by {
                    inner.free.push(Box::new([0u8; BUFFER_SIZE]));
                }
                inner.total = target;
                inner.expansions += 1;
                debug!(total = inner.total, "buffer pool expanded");
            } else {
                inner.exhaustions += 1;
                return None;
            }
        }
        let data = inner.free.pop().expect("non-empty after expansion");
        Some(PoolBuffer {
            data: Some(data),
            len: 0,
            pool: Rc::downgrade(&self.inner),
        })
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.borrow().stats()
    }

    /// Periodic upkeep: give memory back after a sustained idle stretch.
    pub fn maintain(&self, now: Instant) {
        let mut inner = self.inner.borrow_mut();
        if inner.total <= inner.initial {
            inner.over_free_since = None;
            return;
        }
        let free_fraction = inner.free.len() as f64 / inner.total as f64;
        if free_fraction < CONTRACT_FREE_FRACTION {
            inner.over_free_since = None;
            return;
        }
        match inner.over_free_since {
            None => inner.over_free_since = Some(now),
            Some(since) if now.duration_since(since) >= CONTRACT_AFTER => {
                let target = (inner.total / 2).max(inner.initial);
                while inner.total > target && !inner.free.is_empty() {
                    inner.free.pop();
                    inner.total -= 1;
                }
                inner.over_free_since = None;
                debug!(total = inner.total, "buffer pool contracted");
            }
            Some(_) => {}
        }
    }
}

/// Exclusively owned, writable slot. Fill it, then [`PoolBuffer::freeze`]
/// into a shareable reference. Dropping it unfrozen returns the slot.
pub struct PoolBuffer {
    data: Option<Box<[u8; BUFFER_SIZE]>>,
    len: usize,
    pool: Weak<RefCell<PoolInner>>,
}

impl PoolBuffer {
    /// The whole writable slot, for `recv` to fill.
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.data.as_mut().expect("not yet frozen")[..]
    }

    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= BUFFER_SIZE);
        self.len = len;
    }

    pub fn filled(&self) -> &[u8] {
        &self.data.as_ref().expect("not yet frozen")[..self.len]
    }

    /// Seal the buffer; from here on it is immutable and shared.
    pub fn freeze(mut self) -> BufferRef {
        let data = self.data.take().expect("not yet frozen");
        BufferRef {
            slot: Rc::new(Slot {
                data: Some(data),
                len: self.len,
                pool: self.pool.clone(),
            }),
        }
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            release(&self.pool, data);
        }
    }
}

struct Slot {
    data: Option<Box<[u8; BUFFER_SIZE]>>,
    len: usize,
    pool: Weak<RefCell<PoolInner>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            release(&self.pool, data);
        }
    }
}

fn release(pool: &Weak<RefCell<PoolInner>>, data: Box<[u8; BUFFER_SIZE]>) {
    if let Some(pool) = pool.upgrade() {
        let mut inner = pool.borrow_mut();
        if inner.free.len() < inner.total {
            inner.free.push(data);
            return;
        }
        // Slot belongs to a generation the contraction already dropped.
        debug_assert!(false, "released more slots than the pool tracks");
    }
    // Pool gone (worker shutting down): the allocation just dies with us.
}

/// Shared, immutable view of a filled slot. The last clone returns the slot
/// to its pool. Buffer addresses are stable for the slot's whole lifetime,
/// which the zero-copy send path depends on.
#[derive(Clone)]
pub struct BufferRef {
    slot: Rc<Slot>,
}

impl BufferRef {
    pub fn bytes(&self) -> &[u8] {
        &self.slot.data.as_ref().expect("live slot")[..self.slot.len]
    }

    pub fn len(&self) -> usize {
        self.slot.len
    }

    pub fn is_empty(&self) -> bool {
        self.slot.len == 0
    }

    /// Copy foreign bytes (FEC-recovered datagrams) into a pooled slot.
    /// Oversized input is refused rather than truncated.
    pub fn from_slice(pool: &BufferPool, bytes: &[u8]) -> Option<BufferRef> {
        if bytes.len() > BUFFER_SIZE {
            return None;
        }
        let mut buffer = pool.acquire()?;
        buffer.space()[..bytes.len()].copy_from_slice(bytes);
        buffer.set_len(bytes.len());
        Some(buffer.freeze())
    }
}

impl std::fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRef").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conservation_across_acquire_and_release() {
        let pool = BufferPool::new(4, 8);
        assert_eq!(pool.stats().free, 4);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.free + stats.used, stats.total);
        assert_eq!(stats.used, 2);

        drop(a);
        assert_eq!(pool.stats().used, 1);

        let frozen = b.freeze();
        let clone = frozen.clone();
        assert_eq!(pool.stats().used, 1, "clones share one slot");
        drop(frozen);
        assert_eq!(pool.stats().used, 1);
        drop(clone);
        assert_eq!(pool.stats().used, 0);
        assert_eq!(pool.stats().free, 4);
    }

    #[test]
    fn exhaustion_at_ceiling_returns_none() {
        let pool = BufferPool::new(2, 2);
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        let stats = pool.stats();
        assert_eq!(stats.exhaustions, 1);
        assert_eq!(stats.free + stats.used, stats.total);
    }

    #[test]
    fn grows_geometrically_up_to_max() {
        let pool = BufferPool::new(4, 16);
        let mut held = Vec::new();
        for _ in 0..16 {
            held.push(pool.acquire().unwrap());
        }
        assert!(pool.acquire().is_none());
        let stats = pool.stats();
        assert_eq!(stats.total, 16);
        assert!(stats.expansions >= 3, "4 -> 6 -> 9 -> 13 -> 16");
    }

    #[test]
    fn contracts_after_sustained_idle() {
        let pool = BufferPool::new(4, 64);
        let held: Vec<_> = (0..32).map(|_| pool.acquire().unwrap()).collect();
        let total_before = pool.stats().total;
        assert!(total_before >= 32);
        drop(held);

        let t0 = Instant::now();
        pool.maintain(t0);
        assert_eq!(pool.stats().total, total_before, "not yet");
        pool.maintain(t0 + Duration::from_secs(6));
        let stats = pool.stats();
        assert_eq!(stats.total, (total_before / 2).max(4));
        assert_eq!(stats.free, stats.total);
    }

    #[test]
    fn buffer_contents_survive_freeze() {
        let pool = BufferPool::new(1, 1);
        let mut buffer = pool.acquire().unwrap();
        buffer.space()[..4].copy_from_slice(b"abcd");
        buffer.set_len(4);
        let frozen = buffer.freeze();
        assert_eq!(frozen.bytes(), b"abcd");
    }

    #[test]
    fn from_slice_copies_and_bounds() {
        let pool = BufferPool::new(2, 2);
        let r = BufferRef::from_slice(&pool, &[1, 2, 3]).unwrap();
        assert_eq!(r.bytes(), &[1, 2, 3]);
        assert!(BufferRef::from_slice(&pool, &[0u8; BUFFER_SIZE + 1]).is_none());
    }
}
