//! Thread-safe heap manager.
//!
//! This module wraps the [`PagedHeap`] registry in a spin lock so a single
//! manager can be shared, e.g. from a `static`, and serves every request
//! under one lock acquisition.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, Ordering};

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::error;

use crate::buddy::{HeapConfig, HeapStats, LeakReporter, NodePoolStats, PagedHeap, StatsFlags};
use crate::{AllocError, AllocId, AllocResult, BackingAllocator};

/// Multi-page buddy heap behind a lock
pub struct HeapManager {
    inner: SpinNoIrq<PagedHeap>,
    initialized: AtomicBool,
}

impl HeapManager {
    pub const fn new() -> Self {
        Self {
            inner: SpinNoIrq::new(PagedHeap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Initialize the manager with its backing allocator and configuration
    pub fn init(
        &self,
        backing: Box<dyn BackingAllocator + Send>,
        config: HeapConfig,
    ) -> AllocResult {
        let mut inner = self.inner.lock();
        if self.initialized.load(Ordering::SeqCst) {
            error!("heap manager: already initialized");
            return Err(AllocError::AlreadyInitialized);
        }
        inner.init(backing, config)?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn check_initialized(&self) -> AllocResult {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(AllocError::NotInitialized)
        }
    }

    pub fn set_leak_reporter(&self, reporter: Box<dyn LeakReporter + Send>) {
        self.inner.lock().set_leak_reporter(reporter);
    }

    /// Change the size new pages are grown by
    pub fn set_page_size(&self, page_size: usize) -> AllocResult {
        self.check_initialized()?;
        self.inner.lock().set_page_size(page_size)
    }

    #[cfg_attr(feature = "tracking", track_caller)]
    pub fn alloc(&self, size: usize, alloc_id: AllocId) -> AllocResult<usize> {
        self.check_initialized()?;
        self.inner.lock().alloc(size, alloc_id)
    }

    #[cfg_attr(feature = "tracking", track_caller)]
    pub fn realloc(&self, addr: usize, size: usize) -> AllocResult {
        self.check_initialized()?;
        self.inner.lock().realloc(addr, size)
    }

    pub fn free(&self, addr: usize) -> AllocResult {
        self.check_initialized()?;
        self.inner.lock().free(addr)
    }

    /// Make sure at least `size` bytes are available without further growth
    pub fn reserve(&self, size: usize) -> AllocResult {
        self.check_initialized()?;
        self.inner.lock().reserve(size)
    }

    pub fn free_empty_pages(&self) {
        if self.is_initialized() {
            self.inner.lock().free_empty_pages();
        }
    }

    pub fn get_stats(&self, flags: StatsFlags) -> HeapStats {
        self.inner.lock().get_stats(flags)
    }

    pub fn find_base_address(&self, addr: usize) -> Option<usize> {
        self.inner.lock().find_base_address(addr)
    }

    pub fn visualize_memory(&self, out: &mut [u8]) -> AllocResult {
        self.check_initialized()?;
        self.inner.lock().visualize_memory(out)
    }

    pub fn page_count(&self) -> usize {
        self.inner.lock().page_count()
    }

    pub fn node_pool_stats(&self) -> NodePoolStats {
        self.inner.lock().node_pool_stats()
    }

    pub fn sanity_check(&self) -> bool {
        self.inner.lock().sanity_check()
    }

    pub fn print_page_info(&self) {
        self.inner.lock().print_page_info();
    }

    /// Run `f` with the registry locked
    pub fn with_heap<R>(&self, f: impl FnOnce(&PagedHeap) -> R) -> R {
        f(&self.inner.lock())
    }
}

impl Default for HeapManager {
    fn default() -> Self {
        Self::new()
    }
}
