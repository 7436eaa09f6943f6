//! Backing allocator over the global Rust allocator.

use core::alloc::Layout;

#[cfg(feature = "log")]
use log::{debug, warn};

use crate::{AllocError, AllocResult, BackingAllocator};

/// Default alignment of pages handed out by [`HostMemAllocator`].
pub const DEFAULT_HOST_ALIGN: usize = 4096;

/// Supplies heap pages from the global allocator, up to `max_size` bytes in
/// total.
#[derive(Debug)]
pub struct HostMemAllocator {
    max_size: usize,
    alloc_size: usize,
    align: usize,
}

impl HostMemAllocator {
    pub const fn new(max_size: usize) -> Self {
        Self {
            max_size,
            alloc_size: 0,
            align: DEFAULT_HOST_ALIGN,
        }
    }

    /// Use `align` (a power of two) for every page
    pub fn with_align(mut self, align: usize) -> AllocResult<Self> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidParam);
        }
        self.align = align;
        Ok(self)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Bytes currently handed out
    pub fn allocated_size(&self) -> usize {
        self.alloc_size
    }
}

impl BackingAllocator for HostMemAllocator {
    fn acquire(&mut self, size: usize) -> AllocResult<usize> {
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }
        if self.alloc_size.saturating_add(size) > self.max_size {
            debug!(
                "host allocator: {:#x} bytes would exceed the cap ({:#x} of {:#x} in use)",
                size, self.alloc_size, self.max_size
            );
            return Err(AllocError::NoMemory);
        }

        let layout = Layout::from_size_align(size, self.align).map_err(|_| AllocError::InvalidParam)?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(AllocError::NoMemory);
        }

        self.alloc_size += size;
        Ok(ptr as usize)
    }

    fn release(&mut self, addr: usize, size: usize) {
        let Ok(layout) = Layout::from_size_align(size, self.align) else {
            warn!("host allocator: bad release of {:#x} bytes at {:#x}", size, addr);
            return;
        };
        // SAFETY: `addr` was returned by `acquire` with the same size and alignment.
        unsafe { alloc::alloc::dealloc(addr as *mut u8, layout) };
        self.alloc_size = self.alloc_size.saturating_sub(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_is_enforced() {
        let mut host = HostMemAllocator::new(8192);
        let a = host.acquire(4096).unwrap();
        assert_eq!(a % DEFAULT_HOST_ALIGN, 0);
        let b = host.acquire(4096).unwrap();
        assert_eq!(host.allocated_size(), 8192);
        assert_eq!(host.acquire(4096), Err(AllocError::NoMemory));

        host.release(a, 4096);
        assert_eq!(host.allocated_size(), 4096);
        let c = host.acquire(4096).unwrap();
        host.release(b, 4096);
        host.release(c, 4096);
        assert_eq!(host.allocated_size(), 0);
    }

    #[test]
    fn test_alignment() {
        assert!(HostMemAllocator::new(0).with_align(3).is_err());

        let mut host = HostMemAllocator::new(1 << 20).with_align(1 << 16).unwrap();
        let addr = host.acquire(1 << 16).unwrap();
        assert_eq!(addr % (1 << 16), 0);
        host.release(addr, 1 << 16);
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut host = HostMemAllocator::new(4096);
        assert_eq!(host.acquire(0), Err(AllocError::InvalidParam));
    }
}
