//! Statistics and debugging for the buddy heap
//!
//! Provides per-page snapshots, manager-wide counters per allocation category
//! and failure reporting.

use alloc::collections::BTreeMap;

use bitflags::bitflags;

use crate::{AllocId, BITS_PER_WORD};

bitflags! {
    /// Selects which parts of [`HeapStats`] are filled in
    pub struct StatsFlags: u32 {
        const BASIC_STATS            = 0b0000_0001;
        const INTERNAL_FRAGMENTATION = 0b0000_0010;
        const BIGGEST_FREE_BLOCK     = 0b0000_0100;
        const HISTOGRAM              = 0b0000_1000;
        const ALLOC_ID_STATS         = 0b0001_0000;
    }
}

/// Live and peak usage of one allocation category
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocIdStats {
    pub elements: usize,
    pub size: usize,
    pub max_elements: usize,
    pub max_size: usize,
}

/// Heap statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    pub heap_size: usize,
    pub total_allocated: usize,
    pub max_allocated: usize,
    pub internal_fragmentation: usize,
    pub max_internal_fragmentation: usize,
    pub biggest_free_block: usize,
    /// Number of meaningful histogram entries (highest level + 1)
    pub num_entries: usize,
    pub free_buddy_histogram: [usize; BITS_PER_WORD],
    pub allocated_buddy_histogram: [usize; BITS_PER_WORD],
    pub alloc_id_stats: BTreeMap<AllocId, AllocIdStats>,
}

impl Default for HeapStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapStats {
    pub const fn new() -> Self {
        Self {
            heap_size: 0,
            total_allocated: 0,
            max_allocated: 0,
            internal_fragmentation: 0,
            max_internal_fragmentation: 0,
            biggest_free_block: 0,
            num_entries: 0,
            free_buddy_histogram: [0; BITS_PER_WORD],
            allocated_buddy_histogram: [0; BITS_PER_WORD],
            alloc_id_stats: BTreeMap::new(),
        }
    }

    /// Add the per-page parts of another snapshot selected by `flags`
    pub fn add(&mut self, other: &HeapStats, flags: StatsFlags) {
        if flags.contains(StatsFlags::BASIC_STATS) {
            self.heap_size += other.heap_size;
        }
        if flags.contains(StatsFlags::BIGGEST_FREE_BLOCK) {
            self.biggest_free_block = self.biggest_free_block.max(other.biggest_free_block);
        }
        if flags.contains(StatsFlags::HISTOGRAM) {
            self.num_entries = self.num_entries.max(other.num_entries);
            for i in 0..BITS_PER_WORD {
                self.free_buddy_histogram[i] += other.free_buddy_histogram[i];
                self.allocated_buddy_histogram[i] += other.allocated_buddy_histogram[i];
            }
        }
    }
}

/// Manager-wide counters, independent of any single page
///
/// Every page operation reports into one instance owned by the manager.
#[derive(Debug, Default, Clone)]
pub struct GlobalStats {
    pub alloc_mem: usize,
    pub max_alloc_mem: usize,
    pub internal_fragmentation: usize,
    pub max_internal_fragmentation: usize,
    pub per_id: BTreeMap<AllocId, AllocIdStats>,
}

impl GlobalStats {
    pub const fn new() -> Self {
        Self {
            alloc_mem: 0,
            max_alloc_mem: 0,
            internal_fragmentation: 0,
            max_internal_fragmentation: 0,
            per_id: BTreeMap::new(),
        }
    }

    /// A new allocation of `size` block bytes, `fragmentation` of them unused
    pub fn add_allocation(&mut self, id: AllocId, size: usize, fragmentation: usize) {
        let id_stats = self.per_id.entry(id).or_default();
        id_stats.elements += 1;
        id_stats.size += size;
        id_stats.max_elements = id_stats.max_elements.max(id_stats.elements);
        id_stats.max_size = id_stats.max_size.max(id_stats.size);
        self.grow_totals(size, fragmentation);
    }

    /// An allocation released as a whole
    pub fn remove_allocation(&mut self, id: AllocId, size: usize, fragmentation: usize) {
        let id_stats = self.per_id.entry(id).or_default();
        debug_assert!(id_stats.elements > 0);
        debug_assert!(id_stats.size >= size);
        id_stats.elements = id_stats.elements.saturating_sub(1);
        id_stats.size = id_stats.size.saturating_sub(size);
        self.shrink_totals(size, fragmentation);
    }

    /// An existing allocation grew in place
    pub fn grow_allocation(&mut self, id: AllocId, size: usize, fragmentation: usize) {
        let id_stats = self.per_id.entry(id).or_default();
        id_stats.size += size;
        id_stats.max_size = id_stats.max_size.max(id_stats.size);
        self.grow_totals(size, fragmentation);
    }

    /// An existing allocation shrank in place
    pub fn shrink_allocation(&mut self, id: AllocId, size: usize, fragmentation: usize) {
        let id_stats = self.per_id.entry(id).or_default();
        debug_assert!(id_stats.size >= size);
        id_stats.size = id_stats.size.saturating_sub(size);
        self.shrink_totals(size, fragmentation);
    }

    fn grow_totals(&mut self, size: usize, fragmentation: usize) {
        self.alloc_mem += size;
        self.max_alloc_mem = self.max_alloc_mem.max(self.alloc_mem);
        self.internal_fragmentation += fragmentation;
        self.max_internal_fragmentation = self
            .max_internal_fragmentation
            .max(self.internal_fragmentation);
    }

    fn shrink_totals(&mut self, size: usize, fragmentation: usize) {
        self.alloc_mem = self.alloc_mem.saturating_sub(size);
        self.internal_fragmentation = self.internal_fragmentation.saturating_sub(fragmentation);
    }

    /// Copy the manager-wide parts selected by `flags` into a snapshot
    pub fn fill(&self, stats: &mut HeapStats, flags: StatsFlags) {
        if flags.contains(StatsFlags::BASIC_STATS) {
            stats.total_allocated = self.alloc_mem;
            stats.max_allocated = self.max_alloc_mem;
        }
        if flags.contains(StatsFlags::INTERNAL_FRAGMENTATION) {
            stats.internal_fragmentation = self.internal_fragmentation;
            stats.max_internal_fragmentation = self.max_internal_fragmentation;
        }
        if flags.contains(StatsFlags::ALLOC_ID_STATS) {
            stats.alloc_id_stats = self.per_id.clone();
        }
    }
}

/// Address range and shape of one page, for reports
#[derive(Debug, Clone, Copy)]
pub struct PageInfo {
    pub base_addr: usize,
    pub total_size: usize,
    pub min_block_size: usize,
    pub is_persistent: bool,
}

/// Detailed memory statistics reporter
pub struct MemoryStatsReporter;

impl MemoryStatsReporter {
    /// Print detailed allocation failure statistics
    /// This is a standalone function to keep allocation logic clean
    #[allow(unused_variables)]
    pub fn print_alloc_failure_stats(
        total_stats: &HeapStats,
        page_infos: &[PageInfo],
        page_stats: &[HeapStats],
        request_size: usize,
    ) {
        #[cfg(feature = "log")]
        use log::error;
        error!("========================================");
        error!(
            "Request: {} bytes ({} KB)",
            request_size,
            request_size / 1024
        );

        error!("Overall Memory State:");
        error!("  Total pages: {}", page_infos.len());
        error!(
            "  Heap size: {} ({} KB)",
            total_stats.heap_size,
            total_stats.heap_size / 1024
        );
        error!(
            "  Allocated: {} ({} KB)",
            total_stats.total_allocated,
            total_stats.total_allocated / 1024
        );
        error!(
            "  Biggest free block: {} ({} KB)",
            total_stats.biggest_free_block,
            total_stats.biggest_free_block / 1024
        );
        error!("========================================");

        for (i, (info, stats)) in page_infos.iter().zip(page_stats).enumerate() {
            error!("Page {}:", i);
            error!(
                "  Range: [{:#x}, {:#x}){}",
                info.base_addr,
                info.base_addr + info.total_size,
                if info.is_persistent { " persistent" } else { "" }
            );
            error!(
                "  Allocated: {} / {}",
                stats.total_allocated, info.total_size
            );
            error!("  Free blocks by level:");

            for level in (0..stats.num_entries).rev() {
                let count = stats.free_buddy_histogram[level];
                if count > 0 {
                    let block_size = info.min_block_size << level;
                    error!(
                        "    Level {}: {} blocks ({} bytes each, {} KB total)",
                        level,
                        count,
                        block_size,
                        (count * block_size) / 1024
                    );
                }
            }
            error!("----------------------------------------");
        }

        error!("========================================");
    }
}
