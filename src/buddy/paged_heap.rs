//! Multi-page buddy heap
//!
//! Keeps an address-sorted registry of pages, each with its own [`Heap`], all
//! sharing one node pool and one set of manager-wide counters. New pages are
//! requested from a [`BackingAllocator`] when no page can serve an allocation;
//! empty pages are released again or reset in place.

use alloc::boxed::Box;
use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::{debug, error, info, warn};

use crate::{exact_log2, next_pow2, AllocError, AllocId, AllocResult, BackingAllocator};
use crate::{DEFAULT_MIN_BLOCK_SIZE, DEFAULT_PAGE_SIZE};

#[cfg(feature = "tracking")]
use super::stats::{MemoryStatsReporter, PageInfo};
use super::{
    global_node_pool::{BuddyPool, NodePoolStats},
    heap::{Heap, LeakReporter, LogLeakReporter},
    stats::{GlobalStats, HeapStats, StatsFlags},
};

/// Heap growth parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Size of the persistent first page, 0 for none
    pub initial_size: usize,
    /// Granularity of page growth
    pub page_size: usize,
    pub min_block_size: usize,
    /// Largest tolerated waste per allocation, `None` for unlimited
    pub max_internal_fragmentation: Option<usize>,
}

impl HeapConfig {
    pub const fn new() -> Self {
        Self {
            initial_size: 0,
            page_size: DEFAULT_PAGE_SIZE,
            min_block_size: DEFAULT_MIN_BLOCK_SIZE,
            max_internal_fragmentation: None,
        }
    }

    pub const fn with_initial_size(mut self, initial_size: usize) -> Self {
        self.initial_size = initial_size;
        self
    }

    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub const fn with_min_block_size(mut self, min_block_size: usize) -> Self {
        self.min_block_size = min_block_size;
        self
    }

    pub const fn with_max_internal_fragmentation(mut self, max_frag: Option<usize>) -> Self {
        self.max_internal_fragmentation = max_frag;
        self
    }

    /// Check the size relationships between the parameters
    pub fn validate(&self) -> AllocResult {
        if !self.min_block_size.is_power_of_two() {
            return Err(AllocError::InvalidParam);
        }
        if !self.page_size.is_power_of_two() || self.page_size < self.min_block_size {
            return Err(AllocError::InvalidParam);
        }
        if self.initial_size != 0
            && (self.initial_size < self.min_block_size
                || self.initial_size % self.min_block_size != 0)
        {
            return Err(AllocError::InvalidParam);
        }
        if let Some(frag) = self.max_internal_fragmentation {
            if !frag.is_power_of_two() {
                return Err(AllocError::InvalidParam);
            }
        }
        Ok(())
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry entry for one page
pub struct HeapPage {
    base_addr: usize,
    heap: Heap,
    is_persistent: bool,
}

impl HeapPage {
    pub fn base_addr(&self) -> usize {
        self.base_addr
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Persistent pages are reset in place instead of being released
    pub fn is_persistent(&self) -> bool {
        self.is_persistent
    }
}

fn leak_reporter(reporter: &Option<Box<dyn LeakReporter + Send>>) -> &dyn LeakReporter {
    match reporter {
        Some(reporter) => reporter.as_ref(),
        None => &LogLeakReporter,
    }
}

/// Buddy heap spanning any number of pages
pub struct PagedHeap {
    /// Sorted by base address
    pages: Vec<HeapPage>,
    pool: BuddyPool,
    config: HeapConfig,
    backing: Option<Box<dyn BackingAllocator + Send>>,
    leak_reporter: Option<Box<dyn LeakReporter + Send>>,
    stats: GlobalStats,
    new_empty_page: bool,
}

impl PagedHeap {
    pub const fn new() -> Self {
        Self {
            pages: Vec::new(),
            pool: BuddyPool::new(),
            config: HeapConfig::new(),
            backing: None,
            leak_reporter: None,
            stats: GlobalStats::new(),
            new_empty_page: false,
        }
    }

    /// Set up the heap; allocates the persistent first page if
    /// `config.initial_size` is non-zero
    pub fn init(
        &mut self,
        backing: Box<dyn BackingAllocator + Send>,
        config: HeapConfig,
    ) -> AllocResult {
        // init only once
        if self.backing.is_some() {
            return Err(AllocError::AlreadyInitialized);
        }
        config.validate()?;

        self.backing = Some(backing);
        self.config = config;
        self.pool = BuddyPool::default();
        self.stats = GlobalStats::new();

        if config.initial_size > 0 {
            if let Err(e) = self.allocate_new_heap(config.initial_size, true) {
                warn!(
                    "paged heap: initial page of {:#x} bytes failed: {:?}",
                    config.initial_size, e
                );
                self.backing = None;
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.backing.is_some()
    }

    /// Route leak diagnostics of torn down pages to `reporter`
    pub fn set_leak_reporter(&mut self, reporter: Box<dyn LeakReporter + Send>) {
        self.leak_reporter = Some(reporter);
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Change the growth granularity for pages created from now on
    pub fn set_page_size(&mut self, page_size: usize) -> AllocResult {
        if !page_size.is_power_of_two() || page_size < self.config.min_block_size {
            return Err(AllocError::InvalidParam);
        }
        self.config.page_size = page_size;
        Ok(())
    }

    /// Allocate `size` bytes tagged with `alloc_id`, growing by one page if
    /// no existing page has room
    #[cfg_attr(feature = "tracking", track_caller)]
    pub fn alloc(&mut self, size: usize, alloc_id: AllocId) -> AllocResult<usize> {
        if self.backing.is_none() {
            return Err(AllocError::NotInitialized);
        }
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }

        // try to allocate it in one of the pages
        for page in self.pages.iter_mut() {
            if let Ok(addr) = page.heap.alloc(&mut self.pool, &mut self.stats, size, alloc_id) {
                return Ok(addr);
            }
        }

        // create a new page
        let result = match self.allocate_new_pages(size) {
            Ok(idx) => self.pages[idx]
                .heap
                .alloc(&mut self.pool, &mut self.stats, size, alloc_id),
            Err(e) => Err(e),
        };

        if result.is_err() {
            debug!("paged heap: allocation failure: {} bytes", size);
            #[cfg(feature = "tracking")]
            self.print_alloc_failure_stats(size);
        }
        result
    }

    /// Resize the allocation at `addr` in place
    #[cfg_attr(feature = "tracking", track_caller)]
    pub fn realloc(&mut self, addr: usize, size: usize) -> AllocResult {
        if self.backing.is_none() {
            return Err(AllocError::NotInitialized);
        }
        let idx = self.find_heap(addr).ok_or(AllocError::NotAllocated)?;
        self.pages[idx]
            .heap
            .realloc(&mut self.pool, &mut self.stats, addr, size)?;

        if self.new_empty_page {
            self.shrink_memory();
        }
        Ok(())
    }

    /// Free the allocation at `addr`
    pub fn free(&mut self, addr: usize) -> AllocResult {
        if self.backing.is_none() {
            return Err(AllocError::NotInitialized);
        }
        let idx = self.find_heap(addr).ok_or(AllocError::NotAllocated)?;
        let heap = &mut self.pages[idx].heap;
        heap.free(&mut self.pool, &mut self.stats, addr)?;

        if heap.is_empty() {
            self.new_empty_page = true;
        }
        if self.new_empty_page {
            self.shrink_memory();
        }
        Ok(())
    }

    /// Release every empty non-persistent page and reset empty persistent ones
    pub fn free_empty_pages(&mut self) {
        let mut i = 0;
        while i < self.pages.len() {
            let page = &self.pages[i];
            if !page.heap.is_empty() {
                i += 1;
            } else if page.is_persistent {
                // for persistent pages: reset without release
                self.reset_heap(i);
                i += 1;
            } else {
                self.release_page(i);
            }
        }
    }

    /// Make sure at least `size` bytes are free across all pages
    pub fn reserve(&mut self, size: usize) -> AllocResult {
        if self.backing.is_none() {
            return Err(AllocError::NotInitialized);
        }

        let free_size: usize = self.pages.iter().map(|p| p.heap.free_size()).sum();
        if free_size < size {
            self.allocate_new_pages(size - free_size).map(|_| ())
        } else {
            Ok(())
        }
    }

    /// Snapshot of the parts selected by `flags`, summed over all pages
    pub fn get_stats(&self, flags: StatsFlags) -> HeapStats {
        let mut stats = HeapStats::new();
        for page in &self.pages {
            let page_stats = page.heap.get_stats(&self.pool, flags);
            stats.add(&page_stats, flags);
        }
        self.stats.fill(&mut stats, flags);
        stats
    }

    /// Rasterize occupancy of all pages into `out`, each page getting a share
    /// proportional to its size
    pub fn visualize_memory(&self, out: &mut [u8]) -> AllocResult {
        let total: usize = self.pages.iter().map(|p| p.heap.total_size()).sum();
        if total == 0 {
            return Err(AllocError::InvalidParam);
        }

        out.fill(0);
        let len = out.len() as u128;
        let mut start = 0;
        for page in &self.pages {
            let num_vis = ((page.heap.total_size() as u128 * len) / total as u128) as usize;
            page.heap
                .visualize_memory(&self.pool, &mut out[start..start + num_vis]);
            start += num_vis;
        }
        Ok(())
    }

    /// Base address of the page containing `addr`
    pub fn find_base_address(&self, addr: usize) -> Option<usize> {
        self.find_heap(addr).map(|idx| self.pages[idx].base_addr)
    }

    pub fn pages(&self) -> &[HeapPage] {
        &self.pages
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn node_pool_stats(&self) -> NodePoolStats {
        self.pool.get_stats()
    }

    /// Check every page's bookkeeping and the manager-wide totals
    pub fn sanity_check(&self) -> bool {
        let mut allocated = 0;
        for page in &self.pages {
            if !page.heap.sanity_test(&self.pool) {
                error!("paged heap: page {:#x} failed sanity test", page.base_addr);
                return false;
            }
            allocated += page.heap.allocated_size();
        }
        allocated == self.stats.alloc_mem
    }

    /// Index of the page containing `addr`
    ///
    /// Upper bound on the base addresses, then a range check on the candidate.
    fn find_heap(&self, addr: usize) -> Option<usize> {
        let upper = self.pages.partition_point(|p| p.base_addr <= addr);
        if upper == 0 {
            return None;
        }
        let idx = upper - 1;
        self.pages[idx].heap.contains(addr).then_some(idx)
    }

    /// New page big enough for `requested_size`, rounded up to a power-of-two
    /// multiple of the page size
    fn allocate_new_pages(&mut self, requested_size: usize) -> AllocResult<usize> {
        let page_size_log2 = exact_log2(self.config.page_size).ok_or(AllocError::InvalidParam)?;
        let alloc_size = next_pow2(requested_size, page_size_log2).ok_or(AllocError::NoMemory)?;
        self.allocate_new_heap(alloc_size, false)
    }

    fn allocate_new_heap(&mut self, heap_size: usize, is_persistent: bool) -> AllocResult<usize> {
        let backing = self.backing.as_mut().ok_or(AllocError::NotInitialized)?;

        let base_addr = match backing.acquire(heap_size) {
            Ok(addr) => addr,
            Err(e) => {
                debug!(
                    "paged heap: backing allocator refused {:#x} bytes: {:?}",
                    heap_size, e
                );
                return Err(e);
            }
        };

        // Check for overlap with the neighbouring pages
        let pos = self.pages.partition_point(|p| p.base_addr < base_addr);
        let overlaps_prev = pos > 0 && {
            let prev = &self.pages[pos - 1];
            prev.base_addr + prev.heap.total_size() > base_addr
        };
        let overlaps_next = pos < self.pages.len()
            && base_addr.saturating_add(heap_size) > self.pages[pos].base_addr;
        if overlaps_prev || overlaps_next {
            error!(
                "paged heap: new page [{:#x}, {:#x}) overlaps an existing page",
                base_addr,
                base_addr.saturating_add(heap_size)
            );
            backing.release(base_addr, heap_size);
            return Err(AllocError::MemoryOverlap);
        }

        match Heap::new(
            &mut self.pool,
            base_addr,
            heap_size,
            self.config.min_block_size,
            self.config.max_internal_fragmentation,
        ) {
            Ok(heap) => {
                debug!(
                    "paged heap: added {}page [{:#x}, {:#x})",
                    if is_persistent { "persistent " } else { "" },
                    base_addr,
                    base_addr + heap_size
                );
                self.pages.insert(
                    pos,
                    HeapPage {
                        base_addr,
                        heap,
                        is_persistent,
                    },
                );
                Ok(pos)
            }
            Err(e) => {
                backing.release(base_addr, heap_size);
                Err(e)
            }
        }
    }

    /// Rebuild an empty page's heap over the same range
    fn reset_heap(&mut self, idx: usize) {
        let page = &mut self.pages[idx];
        debug_assert!(page.heap.is_empty());

        match Heap::new(
            &mut self.pool,
            page.base_addr,
            page.heap.total_size(),
            self.config.min_block_size,
            self.config.max_internal_fragmentation,
        ) {
            Ok(heap) => {
                let old = core::mem::replace(&mut page.heap, heap);
                old.destroy(&mut self.pool, leak_reporter(&self.leak_reporter));
            }
            Err(_e) => {
                error!(
                    "paged heap: failed to reset page {:#x}: {:?}",
                    page.base_addr, _e
                );
            }
        }
    }

    /// Remove a page from the registry and give it back to the backing allocator
    fn release_page(&mut self, idx: usize) {
        let page = self.pages.remove(idx);
        let size = page.heap.total_size();
        page.heap
            .destroy(&mut self.pool, leak_reporter(&self.leak_reporter));

        debug!(
            "paged heap: releasing page [{:#x}, {:#x})",
            page.base_addr,
            page.base_addr + size
        );
        if let Some(backing) = self.backing.as_mut() {
            backing.release(page.base_addr, size);
        }
    }

    /// Give memory back once at most half of all page bytes are allocated
    ///
    /// Empty pages are visited from the highest address down; non-persistent
    /// ones are released while they fit into half of the free space (all free
    /// space if nothing is allocated), the rest are reset.
    fn shrink_memory(&mut self) {
        self.new_empty_page = false;

        let mut total_allocated = 0;
        let mut total_page_size = 0;
        for page in &self.pages {
            total_allocated += page.heap.allocated_size();
            total_page_size += page.heap.total_size();
        }

        if total_page_size == 0 || total_allocated * 2 > total_page_size {
            return;
        }

        let mut size_to_release = if total_allocated > 0 {
            (total_page_size - total_allocated) >> 1
        } else {
            total_page_size
        };

        for i in (0..self.pages.len()).rev() {
            let page = &self.pages[i];
            if !page.heap.is_empty() {
                continue;
            }
            let size = page.heap.total_size();
            if !page.is_persistent && size <= size_to_release {
                size_to_release -= size;
                self.release_page(i);
            } else {
                self.reset_heap(i);
            }
        }
    }

    /// Print all page information and block distribution
    pub fn print_page_info(&self) {
        info!("========== Paged Buddy Heap Info ==========");
        info!("Total pages: {}", self.pages.len());
        info!(
            "Page size: {:#x}, min block size: {:#x}",
            self.config.page_size, self.config.min_block_size
        );
        info!("");

        for (_i, page) in self.pages.iter().enumerate() {
            let heap = &page.heap;
            info!(
                "Page {}{}:",
                _i,
                if page.is_persistent { " (persistent)" } else { "" }
            );
            info!(
                "  Address range: [{:#x}, {:#x})",
                page.base_addr,
                page.base_addr + heap.total_size()
            );
            info!(
                "  Allocated: {:#x} of {:#x}",
                heap.allocated_size(),
                heap.total_size()
            );
            info!("  Free blocks distribution:");

            for level in 0..=heap.max_level() as usize {
                let block_count = heap.free_block_count(level);
                if block_count > 0 {
                    let _block_size = heap.min_block_size() << level;
                    info!(
                        "    Level {}: {} blocks (size {} bytes each, total {:#x})",
                        level,
                        block_count,
                        _block_size,
                        block_count * _block_size
                    );
                }
            }
            info!("");
        }

        info!("Node pool stats:");
        let _pool_stats = self.pool.get_stats();
        info!("  Total allocations: {}", _pool_stats.total_allocations);
        info!("  Free nodes: {}", _pool_stats.free_nodes);
        info!("==============================================");
    }

    /// Print detailed allocation failure statistics
    #[cfg(feature = "tracking")]
    pub fn print_alloc_failure_stats(&self, request_size: usize) {
        let flags = StatsFlags::BASIC_STATS | StatsFlags::BIGGEST_FREE_BLOCK | StatsFlags::HISTOGRAM;
        let page_infos: Vec<PageInfo> = self
            .pages
            .iter()
            .map(|p| PageInfo {
                base_addr: p.base_addr,
                total_size: p.heap.total_size(),
                min_block_size: p.heap.min_block_size(),
                is_persistent: p.is_persistent,
            })
            .collect();
        let page_stats: Vec<HeapStats> = self
            .pages
            .iter()
            .map(|p| p.heap.get_stats(&self.pool, flags))
            .collect();

        MemoryStatsReporter::print_alloc_failure_stats(
            &self.get_stats(flags),
            &page_infos,
            &page_stats,
            request_size,
        );
    }
}

impl Default for PagedHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PagedHeap {
    fn drop(&mut self) {
        while let Some(page) = self.pages.pop() {
            let size = page.heap.total_size();
            page.heap
                .destroy(&mut self.pool, leak_reporter(&self.leak_reporter));
            if let Some(backing) = self.backing.as_mut() {
                backing.release(page.base_addr, size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out synthetic, non-overlapping ranges; the heap never touches them.
    struct FakeBacking {
        next: usize,
        limit: usize,
        live: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
    }

    impl FakeBacking {
        fn new(limit: usize) -> (Box<Self>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let live = Arc::new(AtomicUsize::new(0));
            let releases = Arc::new(AtomicUsize::new(0));
            let backing = Box::new(Self {
                next: 0x1000_0000,
                limit,
                live: live.clone(),
                releases: releases.clone(),
            });
            (backing, live, releases)
        }
    }

    impl BackingAllocator for FakeBacking {
        fn acquire(&mut self, size: usize) -> AllocResult<usize> {
            if self.live.load(Ordering::Relaxed) + size > self.limit {
                return Err(AllocError::NoMemory);
            }
            let addr = self.next;
            self.next += size.max(0x10_0000);
            self.live.fetch_add(size, Ordering::Relaxed);
            Ok(addr)
        }

        fn release(&mut self, _addr: usize, size: usize) {
            self.live.fetch_sub(size, Ordering::Relaxed);
            self.releases.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn config() -> HeapConfig {
        HeapConfig::new()
            .with_page_size(4096)
            .with_min_block_size(256)
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());
        assert!(config().with_min_block_size(300).validate().is_err());
        assert!(config().with_page_size(128).validate().is_err());
        assert!(config().with_page_size(5000).validate().is_err());
        assert!(config().with_initial_size(1000).validate().is_err());
        assert!(config().with_initial_size(128).validate().is_err());
        assert!(config()
            .with_max_internal_fragmentation(Some(100))
            .validate()
            .is_err());
        assert!(config()
            .with_max_internal_fragmentation(Some(64))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_init_once() {
        let (backing, _, _) = FakeBacking::new(usize::MAX);
        let mut heap = PagedHeap::new();
        assert_eq!(heap.alloc(1, AllocId::UNASSIGNED), Err(AllocError::NotInitialized));
        heap.init(backing, config()).unwrap();
        assert!(heap.is_initialized());

        let (again, _, _) = FakeBacking::new(usize::MAX);
        assert_eq!(heap.init(again, config()), Err(AllocError::AlreadyInitialized));
    }

    #[test]
    fn test_uninitialized_heap_rejects_every_operation() {
        let mut heap = PagedHeap::new();
        assert_eq!(heap.alloc(1, AllocId::UNASSIGNED), Err(AllocError::NotInitialized));
        assert_eq!(heap.realloc(0x1000_0000, 16), Err(AllocError::NotInitialized));
        assert_eq!(heap.free(0x1000_0000), Err(AllocError::NotInitialized));
        assert_eq!(heap.reserve(16), Err(AllocError::NotInitialized));
    }

    #[test]
    fn test_initial_page_is_persistent() {
        let (backing, live, _) = FakeBacking::new(usize::MAX);
        let mut heap = PagedHeap::new();
        heap.init(backing, config().with_initial_size(8192)).unwrap();

        assert_eq!(heap.page_count(), 1);
        assert!(heap.pages()[0].is_persistent());
        assert_eq!(live.load(Ordering::Relaxed), 8192);
    }

    #[test]
    fn test_initial_page_failure_rolls_back() {
        let (backing, _, _) = FakeBacking::new(4096);
        let mut heap = PagedHeap::new();
        assert_eq!(
            heap.init(backing, config().with_initial_size(8192)),
            Err(AllocError::NoMemory)
        );
        assert!(!heap.is_initialized());
    }

    #[test]
    fn test_grow_to_power_of_two_pages() {
        let (backing, live, _) = FakeBacking::new(usize::MAX);
        let mut heap = PagedHeap::new();
        heap.init(backing, config()).unwrap();

        let addr = heap.alloc(5000, AllocId::UNASSIGNED).unwrap();
        assert_eq!(heap.page_count(), 1);
        let page = &heap.pages()[0];
        assert_eq!(page.heap().total_size(), 8192);
        assert!(!page.is_persistent());
        assert!(addr >= page.base_addr() && addr < page.base_addr() + 8192);
        assert_eq!(heap.find_base_address(addr + 100), Some(page.base_addr()));
        assert_eq!(live.load(Ordering::Relaxed), 8192);
        assert!(heap.sanity_check());
    }

    #[test]
    fn test_pages_stay_sorted_and_lookup_works() {
        let (backing, _, _) = FakeBacking::new(usize::MAX);
        let mut heap = PagedHeap::new();
        heap.init(backing, config()).unwrap();

        let a = heap.alloc(4096, AllocId::UNASSIGNED).unwrap();
        let b = heap.alloc(4096, AllocId::UNASSIGNED).unwrap();
        let c = heap.alloc(4096, AllocId::UNASSIGNED).unwrap();
        assert_eq!(heap.page_count(), 3);
        assert!(heap
            .pages()
            .windows(2)
            .all(|w| w[0].base_addr() < w[1].base_addr()));

        for addr in [a, b, c] {
            assert_eq!(heap.find_base_address(addr), Some(addr));
        }
        assert_eq!(heap.find_base_address(a + 4096), None);
        assert_eq!(heap.find_base_address(1), None);
        assert_eq!(heap.free(a + 4096), Err(AllocError::NotAllocated));
    }

    #[test]
    fn test_growth_failure_is_no_memory() {
        let (backing, _, _) = FakeBacking::new(8192);
        let mut heap = PagedHeap::new();
        heap.init(backing, config()).unwrap();

        heap.alloc(8192, AllocId::UNASSIGNED).unwrap();
        assert_eq!(heap.alloc(1, AllocId::UNASSIGNED), Err(AllocError::NoMemory));
        assert_eq!(heap.page_count(), 1);
    }

    #[test]
    fn test_free_shrinks_empty_pages() {
        let (backing, live, releases) = FakeBacking::new(usize::MAX);
        let mut heap = PagedHeap::new();
        heap.init(backing, config()).unwrap();

        let a = heap.alloc(4096, AllocId::UNASSIGNED).unwrap();
        let b = heap.alloc(4096, AllocId::UNASSIGNED).unwrap();
        assert_eq!(heap.page_count(), 2);

        // only half of the 4K of free space may go back: the page is reset
        heap.free(b).unwrap();
        assert_eq!(heap.page_count(), 2);
        assert_eq!(releases.load(Ordering::Relaxed), 0);

        heap.free(a).unwrap();
        assert_eq!(heap.page_count(), 0);
        assert_eq!(releases.load(Ordering::Relaxed), 2);
        assert_eq!(live.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_shrink_waits_for_threshold() {
        let (backing, _, releases) = FakeBacking::new(usize::MAX);
        let mut heap = PagedHeap::new();
        heap.init(backing, config()).unwrap();

        let big = heap.alloc(16384, AllocId::UNASSIGNED).unwrap();
        let small = heap.alloc(4096, AllocId::UNASSIGNED).unwrap();
        assert_eq!(heap.page_count(), 2);

        // 16K of 20K allocated: nothing to give back
        heap.free(small).unwrap();
        assert_eq!(heap.page_count(), 2);
        assert_eq!(releases.load(Ordering::Relaxed), 0);

        heap.free_empty_pages();
        assert_eq!(heap.page_count(), 1);
        assert_eq!(releases.load(Ordering::Relaxed), 1);
        heap.free(big).unwrap();
    }

    #[test]
    fn test_persistent_page_is_reset() {
        let (backing, _, releases) = FakeBacking::new(usize::MAX);
        let mut heap = PagedHeap::new();
        heap.init(backing, config().with_initial_size(4096)).unwrap();

        let a = heap.alloc(256, AllocId::UNASSIGNED).unwrap();
        heap.free(a).unwrap();
        heap.free_empty_pages();

        assert_eq!(heap.page_count(), 1);
        assert_eq!(releases.load(Ordering::Relaxed), 0);
        let page = heap.pages()[0].heap();
        assert_eq!(page.total_size(), 4096);
        assert_eq!(page.free_block_count(page.max_level() as usize), 1);
        for level in 0..page.max_level() as usize {
            assert_eq!(page.free_block_count(level), 0);
        }
        assert!(heap.sanity_check());
    }

    #[test]
    fn test_reserve() {
        let (backing, live, _) = FakeBacking::new(usize::MAX);
        let mut heap = PagedHeap::new();
        heap.init(backing, config().with_initial_size(4096)).unwrap();

        heap.reserve(4096).unwrap();
        assert_eq!(heap.page_count(), 1);

        heap.reserve(10000).unwrap();
        assert_eq!(heap.page_count(), 2);
        // shortfall of 5904 rounds up to 8K
        assert_eq!(live.load(Ordering::Relaxed), 4096 + 8192);
    }

    #[test]
    fn test_set_page_size() {
        let (backing, _, _) = FakeBacking::new(usize::MAX);
        let mut heap = PagedHeap::new();
        heap.init(backing, config()).unwrap();

        assert_eq!(heap.set_page_size(0), Err(AllocError::InvalidParam));
        assert_eq!(heap.set_page_size(128), Err(AllocError::InvalidParam));
        assert_eq!(heap.set_page_size(3000), Err(AllocError::InvalidParam));
        heap.set_page_size(65536).unwrap();

        heap.alloc(1, AllocId::UNASSIGNED).unwrap();
        assert_eq!(heap.pages()[0].heap().total_size(), 65536);
    }

    #[test]
    fn test_drop_releases_everything() {
        let (backing, live, releases) = FakeBacking::new(usize::MAX);
        {
            let mut heap = PagedHeap::new();
            heap.init(backing, config().with_initial_size(4096)).unwrap();
            heap.alloc(8192, AllocId::UNASSIGNED).unwrap();
            assert_eq!(heap.page_count(), 2);
        }
        assert_eq!(live.load(Ordering::Relaxed), 0);
        assert_eq!(releases.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_visualize_memory_across_pages() {
        let (backing, _, _) = FakeBacking::new(usize::MAX);
        let mut heap = PagedHeap::new();
        heap.init(backing, config().with_initial_size(4096)).unwrap();

        let mut out = [0u8; 8];
        assert!(heap.visualize_memory(&mut out).is_ok());
        assert_eq!(out, [0; 8]);

        heap.alloc(4096, AllocId::UNASSIGNED).unwrap();
        heap.alloc(4096, AllocId::UNASSIGNED).unwrap();
        heap.visualize_memory(&mut out).unwrap();
        // two full 4K pages, 16 units each: level 4 blocks
        assert_eq!(out, [5; 8]);
    }
}
