//! Paged buddy heap
//!
//! A buddy-system heap that carves power-of-two blocks out of one or more
//! fixed-size pages, featuring:
//! - Single-page buddy engine with lazy, demand-driven merging
//! - Optional internal fragmentation cap via chained sub-blocks
//! - Multi-page registry that grows on demand from a pluggable backing allocator
//!   and releases or resets empty pages
//! - Per-page and per-category statistics

#![no_std]

extern crate alloc;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Default growth granularity for new pages (2 MiB).
pub const DEFAULT_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Default size of the smallest buddy block.
pub const DEFAULT_MIN_BLOCK_SIZE: usize = 2048;

/// Number of bits in a machine word, and thus the number of distinct levels
/// a histogram may need to hold.
pub const BITS_PER_WORD: usize = usize::BITS as usize;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid `size` or configuration. (e.g. not a power of two)
    InvalidParam,
    /// A new page overlapped with an existing page.
    MemoryOverlap,
    /// No enough memory to allocate.
    NoMemory,
    /// Address does not belong to a live allocation.
    NotAllocated,
    /// `init` was called on a heap that is already initialized.
    AlreadyInitialized,
    /// The heap was used before `init`.
    NotInitialized,
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// Supplies and reclaims whole address ranges used as heap pages.
///
/// Sizes passed in are always power-of-two multiples of the page granularity.
pub trait BackingAllocator {
    /// Acquire an address range of `size` bytes and return its base address.
    fn acquire(&mut self, size: usize) -> AllocResult<usize>;

    /// Give back a range previously returned by [`BackingAllocator::acquire`].
    fn release(&mut self, addr: usize, size: usize);
}

impl<A: BackingAllocator + ?Sized> BackingAllocator for alloc::boxed::Box<A> {
    fn acquire(&mut self, size: usize) -> AllocResult<usize> {
        (**self).acquire(size)
    }

    fn release(&mut self, addr: usize, size: usize) {
        (**self).release(addr, size)
    }
}

/// Opaque allocation category. Only used for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AllocId(pub u16);

impl AllocId {
    pub const UNASSIGNED: AllocId = AllocId(0);
}

/// Searches the smallest `pow` in `[min, max]` with `2^pow >= val`.
///
/// Returns `None` when no such power exists in the range.
#[inline]
pub(crate) const fn next_pow2_log2(val: usize, min: u32, max: u32) -> Option<u32> {
    let mut pow = min;
    while pow <= max && pow < usize::BITS {
        if (1usize << pow) >= val {
            return Some(pow);
        }
        pow += 1;
    }
    None
}

/// Smallest power of two `>= val` whose exponent is at least `min`.
#[inline]
pub(crate) const fn next_pow2(val: usize, min: u32) -> Option<usize> {
    match next_pow2_log2(val, min, usize::BITS - 1) {
        Some(pow) => Some(1 << pow),
        None => None,
    }
}

/// Exponent of `val` if it is an exact power of two.
#[inline]
pub(crate) const fn exact_log2(val: usize) -> Option<u32> {
    if val.is_power_of_two() {
        Some(val.trailing_zeros())
    } else {
        None
    }
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod buddy;
pub use buddy::{
    Buddy, BuddyPool, HeapConfig, HeapPage, HeapStats, LeakReporter, LogLeakReporter,
    MemoryLeak, NodePoolStats, PagedHeap, StatsFlags,
};
pub use buddy::{AllocIdStats, Heap};

pub mod heap_manager;
pub use heap_manager::HeapManager;

pub mod host_allocator;
pub use host_allocator::HostMemAllocator;
