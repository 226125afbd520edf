//! # Scalable Memory Pool
//!
//! Fixed-page span allocator backing RDMA-registered regions. The pool is
//! split into `1 << page_shift` sized pages; allocations take spans of
//! contiguous pages and never subdivide a page. A blocking allocation
//! variant waits on a condition variable signalled by every free.

use crate::error::{KvError, KvResult};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Smallest accepted page shift (1 KiB pages).
const MIN_PAGE_SHIFT: usize = 10;
/// Largest accepted page shift (1 GiB pages).
const MAX_PAGE_SHIFT: usize = 30;

/// A pinned backing region owned by the process.
///
/// Stands in for device or pinned-host memory: a stable, page-aligned byte
/// range whose base address can be registered with the interconnect and
/// carried across the wire as a `u64`.
pub struct PinnedRegion {
    buf: Box<[u8]>,
}

impl PinnedRegion {
    /// Allocate a zeroed region of `size` bytes.
    pub fn allocate(size: usize) -> Self {
        Self { buf: vec![0u8; size].into_boxed_slice() }
    }

    /// Base address of the region.
    pub fn base(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when the region is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Allocation bookkeeping for one span of pages.
#[derive(Debug, Clone, Copy)]
struct Span {
    start_page: usize,
    num_pages: usize,
    requested: usize,
}

/// Mutable pool state under the pool mutex.
struct PoolState {
    base: u64,
    num_pages: usize,
    /// Free runs: start page -> run length, coalesced on free.
    free_runs: BTreeMap<usize, usize>,
    /// Allocated spans keyed by their base address.
    spans: BTreeMap<u64, Span>,
    total_allocs: u64,
    total_frees: u64,
    failed_allocs: u64,
}

struct PoolInner {
    page_shift: usize,
    state: Mutex<PoolState>,
    freed: Condvar,
}

/// Fixed-page span allocator over a single pinned region.
#[derive(Clone)]
pub struct ScalableMemPool {
    inner: Arc<PoolInner>,
}

impl ScalableMemPool {
    /// Create a pool over `[base, base + size)` with the given page shift.
    ///
    /// Fails with `ParamInvalid` when `page_shift` is outside `[10, 30]` or
    /// one page would not fit in the region.
    pub fn initialize(base: u64, size: usize, page_shift: usize) -> KvResult<Self> {
        if !(MIN_PAGE_SHIFT..=MAX_PAGE_SHIFT).contains(&page_shift) {
            return Err(KvError::ParamInvalid(format!(
                "page_shift {} out of range [{}, {}]",
                page_shift, MIN_PAGE_SHIFT, MAX_PAGE_SHIFT
            )));
        }
        let page_size = 1usize << page_shift;
        if page_size > size {
            return Err(KvError::ParamInvalid(format!(
                "page_size {} exceeds pool size {}",
                page_size, size
            )));
        }
        let num_pages = size >> page_shift;
        let mut free_runs = BTreeMap::new();
        free_runs.insert(0, num_pages);
        log::info!(
            "mem pool initialized: base=0x{:x} size={} page_shift={} pages={}",
            base,
            size,
            page_shift,
            num_pages
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                page_shift,
                state: Mutex::new(PoolState {
                    base,
                    num_pages,
                    free_runs,
                    spans: BTreeMap::new(),
                    total_allocs: 0,
                    total_frees: 0,
                    failed_allocs: 0,
                }),
                freed: Condvar::new(),
            }),
        })
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        1usize << self.inner.page_shift
    }

    /// Allocate a span covering at least `size` bytes.
    ///
    /// Returns `None` when no contiguous run of pages can satisfy the
    /// request; the pool state stays unchanged.
    pub fn alloc(&self, size: usize) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let pages = self.pages_for(size);
        let mut state = self.inner.state.lock();
        let run = state
            .free_runs
            .iter()
            .find(|(_, len)| **len >= pages)
            .map(|(start, len)| (*start, *len));
        match run {
            Some((start, len)) => {
                state.free_runs.remove(&start);
                if len > pages {
                    state.free_runs.insert(start + pages, len - pages);
                }
                let addr = state.base + ((start as u64) << self.inner.page_shift);
                state.spans.insert(addr, Span { start_page: start, num_pages: pages, requested: size });
                state.total_allocs += 1;
                log::debug!("pool alloc: addr=0x{:x} size={} pages={}", addr, size, pages);
                Some(addr)
            }
            None => {
                state.failed_allocs += 1;
                None
            }
        }
    }

    /// Allocate, blocking until space frees up or `timeout` elapses.
    ///
    /// Spurious wakeups retry the allocation; on deadline the call returns
    /// `None` with a warning logged.
    pub fn alloc_timeout(&self, size: usize, timeout: Duration) -> Option<u64> {
        if let Some(addr) = self.alloc(size) {
            return Some(addr);
        }
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.inner.state.lock();
                let now = Instant::now();
                if now >= deadline {
                    log::warn!("waiting for idle memory within {:?} timed out", timeout);
                    return None;
                }
                let timed_out = self
                    .inner
                    .freed
                    .wait_until(&mut state, deadline)
                    .timed_out();
                if timed_out {
                    log::warn!("waiting for idle memory within {:?} timed out", timeout);
                    return None;
                }
            }
            if let Some(addr) = self.alloc(size) {
                return Some(addr);
            }
        }
    }

    /// Return a span to the pool. Unknown addresses are ignored.
    pub fn free(&self, addr: u64) {
        let mut state = self.inner.state.lock();
        let span = match state.spans.remove(&addr) {
            Some(span) => span,
            None => return,
        };
        log::debug!("pool free: addr=0x{:x} size={}", addr, span.requested);
        Self::insert_free_run(&mut state.free_runs, span.start_page, span.num_pages);
        state.total_frees += 1;
        drop(state);
        self.inner.freed.notify_all();
    }

    /// Allocate a span wrapped in a handle that frees itself on drop.
    pub fn alloc_shared(&self, size: usize) -> Option<SharedBlock> {
        self.alloc(size).map(|addr| SharedBlock::new(addr, size, self.clone()))
    }

    /// Blocking variant of [`ScalableMemPool::alloc_shared`].
    pub fn alloc_shared_timeout(&self, size: usize, timeout: Duration) -> Option<SharedBlock> {
        self.alloc_timeout(size, timeout)
            .map(|addr| SharedBlock::new(addr, size, self.clone()))
    }

    /// Number of currently free pages.
    pub fn free_pages(&self) -> usize {
        self.inner.state.lock().free_runs.values().sum()
    }

    /// Number of outstanding spans.
    pub fn allocated_spans(&self) -> usize {
        self.inner.state.lock().spans.len()
    }

    /// Log a detailed occupancy snapshot at error level.
    pub fn log_pool_state(&self) {
        let state = self.inner.state.lock();
        let free_pages: usize = state.free_runs.values().sum();
        let largest_run = state.free_runs.values().copied().max().unwrap_or(0);
        log::error!(
            "pool state: pages={} free={} largest_free_run={} spans={} allocs={} frees={} failed={}",
            state.num_pages,
            free_pages,
            largest_run,
            state.spans.len(),
            state.total_allocs,
            state.total_frees,
            state.failed_allocs
        );
    }

    fn pages_for(&self, size: usize) -> usize {
        (size + self.page_size() - 1) >> self.inner.page_shift
    }

    fn insert_free_run(free_runs: &mut BTreeMap<usize, usize>, start: usize, len: usize) {
        let mut start = start;
        let mut len = len;
        // Coalesce with the predecessor run when adjacent.
        if let Some((&prev_start, &prev_len)) = free_runs.range(..start).next_back() {
            if prev_start + prev_len == start {
                free_runs.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        // Coalesce with the successor run when adjacent.
        if let Some(&next_len) = free_runs.get(&(start + len)) {
            free_runs.remove(&(start + len));
            len += next_len;
        }
        free_runs.insert(start, len);
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.spans.is_empty() {
            log::warn!("mem pool destroyed with {} leaked spans", state.spans.len());
        }
    }
}

/// RAII handle returned by [`ScalableMemPool::alloc_shared`].
///
/// Clones share ownership; the span returns to the pool when the last
/// clone drops.
#[derive(Clone)]
pub struct SharedBlock {
    inner: Arc<BlockInner>,
}

struct BlockInner {
    addr: u64,
    len: usize,
    pool: ScalableMemPool,
}

impl SharedBlock {
    fn new(addr: u64, len: usize, pool: ScalableMemPool) -> Self {
        Self { inner: Arc::new(BlockInner { addr, len, pool }) }
    }

    /// Base address of the span.
    pub fn addr(&self) -> u64 {
        self.inner.addr
    }

    /// Requested length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// True when the block has zero length.
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        self.pool.free(self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool_with(pages: usize, page_shift: usize) -> (PinnedRegion, ScalableMemPool) {
        let size = pages << page_shift;
        let region = PinnedRegion::allocate(size);
        let pool = ScalableMemPool::initialize(region.base(), size, page_shift).unwrap();
        (region, pool)
    }

    #[test]
    fn test_page_shift_validation() {
        let region = PinnedRegion::allocate(1 << 12);
        assert!(ScalableMemPool::initialize(region.base(), region.len(), 9).is_err());
        assert!(ScalableMemPool::initialize(region.base(), region.len(), 31).is_err());
        // One 8 KiB page does not fit in a 4 KiB region.
        assert!(ScalableMemPool::initialize(region.base(), region.len(), 13).is_err());
        assert!(ScalableMemPool::initialize(region.base(), region.len(), 12).is_ok());
    }

    #[test]
    fn test_alloc_free_coalesce() {
        let (_region, pool) = pool_with(8, 10);
        let a = pool.alloc(1024).unwrap();
        let b = pool.alloc(2048).unwrap();
        let c = pool.alloc(1024).unwrap();
        assert_eq!(pool.free_pages(), 4);

        // Freeing b then a must coalesce so a 3-page span fits again.
        pool.free(b);
        pool.free(a);
        let d = pool.alloc(3 * 1024).unwrap();
        assert_eq!(d, a);
        pool.free(c);
        pool.free(d);
        assert_eq!(pool.free_pages(), 8);
    }

    #[test]
    fn test_out_of_memory_returns_none() {
        let (_region, pool) = pool_with(4, 10);
        let _a = pool.alloc(4 * 1024).unwrap();
        assert!(pool.alloc(1024).is_none());
        pool.log_pool_state();
    }

    #[test]
    fn test_alloc_timeout_wakes_on_free() {
        let (_region, pool) = pool_with(4, 10);
        let held = pool.alloc(4 * 1024).unwrap();

        let waiter = pool.clone();
        let handle = std::thread::spawn(move || waiter.alloc_timeout(1024, Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(50));
        pool.free(held);

        let addr = handle.join().unwrap();
        assert!(addr.is_some());
    }

    #[test]
    fn test_alloc_timeout_deadline() {
        let (_region, pool) = pool_with(4, 10);
        let _held = pool.alloc(4 * 1024).unwrap();
        let start = Instant::now();
        assert!(pool.alloc_timeout(1024, Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_shared_block_returns_on_drop() {
        let (_region, pool) = pool_with(4, 10);
        {
            let block = pool.alloc_shared(2048).unwrap();
            assert!(!block.is_empty());
            assert_eq!(pool.allocated_spans(), 1);
        }
        assert_eq!(pool.allocated_spans(), 0);
        assert_eq!(pool.free_pages(), 4);
    }

    #[test]
    fn test_zero_size_alloc_rejected() {
        let (_region, pool) = pool_with(4, 10);
        assert!(pool.alloc(0).is_none());
    }
}
