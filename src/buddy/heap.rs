//! Single-page buddy heap
//!
//! Implements the buddy engine for one page. Free blocks are kept in one
//! address-sorted list per level, allocated blocks in a single address-sorted
//! list used to find an allocation again on free/realloc. All list nodes live
//! in the manager's shared [`BuddyPool`].
//!
//! Freed blocks are never coalesced eagerly. Merging happens on demand, when an
//! allocation finds no free block at its level and splitting a bigger block
//! fails too.

#[cfg(feature = "tracking")]
use core::panic::Location;

use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::{debug, error, trace, warn};

use crate::{exact_log2, is_aligned, next_pow2_log2, AllocError, AllocId, AllocResult};

use super::{
    buddy_block::Buddy,
    global_node_pool::BuddyPool,
    pooled_list::PooledLinkedList,
    stats::{GlobalStats, HeapStats, StatsFlags},
};

/// Allocation still alive when its page was torn down
#[derive(Debug, Clone, Copy)]
pub struct MemoryLeak {
    pub address: usize,
    pub block_size: usize,
    pub occupied_size: usize,
    pub alloc_id: AllocId,
    #[cfg(feature = "tracking")]
    pub location: Option<&'static Location<'static>>,
}

/// Receives leak diagnostics when a page is torn down
pub trait LeakReporter {
    fn report_leak(&self, leak: &MemoryLeak);
}

/// Reports leaks through the logger
#[derive(Debug, Default, Clone, Copy)]
pub struct LogLeakReporter;

impl LeakReporter for LogLeakReporter {
    #[allow(unused_variables)]
    fn report_leak(&self, leak: &MemoryLeak) {
        #[cfg(feature = "tracking")]
        if let Some(location) = leak.location {
            warn!(
                "Memory leak at address {:#x} ({} of {} bytes, id {}), allocated at {}",
                leak.address, leak.occupied_size, leak.block_size, leak.alloc_id.0, location
            );
            return;
        }
        warn!(
            "Memory leak at address {:#x} ({} of {} bytes, id {})",
            leak.address, leak.occupied_size, leak.block_size, leak.alloc_id.0
        );
    }
}

/// One page's buddy engine
pub struct Heap {
    base_addr: usize,
    total_size: usize,
    min_block_size: usize,
    min_block_log2: u32,
    /// `total_size == min_block_size << max_level`
    max_level: u8,
    max_int_frag: Option<usize>,
    /// Free lists for each level
    free_lists: Vec<PooledLinkedList>,
    allocated: PooledLinkedList,

    /// Block bytes handed out, including internal fragmentation
    alloc_mem: usize,
    max_alloc_mem: usize,
    internal_fragmentation: usize,
    max_internal_fragmentation: usize,
}

impl Heap {
    /// Create a heap over `[base_addr, base_addr + total_size)`
    ///
    /// `min_block_size` and `total_size / min_block_size` must be powers of two
    /// and `max_int_frag`, if set, a power of two too. On failure nothing is
    /// taken from the pool.
    pub fn new(
        pool: &mut BuddyPool,
        base_addr: usize,
        total_size: usize,
        min_block_size: usize,
        max_int_frag: Option<usize>,
    ) -> AllocResult<Self> {
        let min_block_log2 = exact_log2(min_block_size).ok_or(AllocError::InvalidParam)?;

        if let Some(frag) = max_int_frag {
            if !frag.is_power_of_two() {
                return Err(AllocError::InvalidParam);
            }
        }

        if base_addr == 0 {
            error!("heap: base address must not be null");
            return Err(AllocError::InvalidParam);
        }

        if total_size == 0 || !is_aligned(total_size, min_block_size) {
            return Err(AllocError::InvalidParam);
        }

        // allow only pages holding a power-of-two number of blocks
        let max_level = exact_log2(total_size >> min_block_log2).ok_or(AllocError::InvalidParam)?;
        if base_addr.checked_add(total_size).is_none() {
            return Err(AllocError::InvalidParam);
        }
        let max_level = max_level as u8;

        let mut free_lists = Vec::with_capacity(max_level as usize + 1);
        free_lists.resize_with(max_level as usize + 1, PooledLinkedList::new);

        let root = pool.alloc_node(Buddy::new(0, max_level));
        free_lists[max_level as usize].push_front(pool, root);

        debug!(
            "heap: new page [{:#x}, {:#x}) min block {:#x} levels {}",
            base_addr,
            base_addr + total_size,
            min_block_size,
            max_level as usize + 1
        );

        Ok(Self {
            base_addr,
            total_size,
            min_block_size,
            min_block_log2,
            max_level,
            max_int_frag,
            free_lists,
            allocated: PooledLinkedList::new(),
            alloc_mem: 0,
            max_alloc_mem: 0,
            internal_fragmentation: 0,
            max_internal_fragmentation: 0,
        })
    }

    pub fn base_addr(&self) -> usize {
        self.base_addr
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn min_block_size(&self) -> usize {
        self.min_block_size
    }

    pub fn max_level(&self) -> u8 {
        self.max_level
    }

    /// Block bytes currently handed out
    pub fn allocated_size(&self) -> usize {
        self.alloc_mem
    }

    pub fn free_size(&self) -> usize {
        self.total_size - self.alloc_mem
    }

    /// Whether no allocation lives in this page
    pub fn is_empty(&self) -> bool {
        self.alloc_mem == 0
    }

    /// Check if an address belongs to this page
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base_addr && addr - self.base_addr < self.total_size
    }

    /// Number of free blocks at `level`
    pub fn free_block_count(&self, level: usize) -> usize {
        self.free_lists.get(level).map_or(0, PooledLinkedList::len)
    }

    /// Number of nodes in the allocated list
    pub fn allocated_block_count(&self) -> usize {
        self.allocated.len()
    }

    /// Page address to block units, if `addr` is a block boundary in this page
    fn to_internal(&self, addr: usize) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        let offset = addr - self.base_addr;
        if !is_aligned(offset, self.min_block_size) {
            return None;
        }
        Some(offset >> self.min_block_log2)
    }

    fn to_external(&self, internal: usize) -> usize {
        (internal << self.min_block_log2) + self.base_addr
    }

    fn level_size(&self, level: u8) -> usize {
        self.min_block_size << level
    }

    /// Level whose blocks are the smallest able to hold `size` bytes
    fn level_for(&self, size: usize) -> u8 {
        match next_pow2_log2(size, self.min_block_log2, usize::BITS - 1) {
            Some(pow) => ((pow - self.min_block_log2) as u8).min(self.max_level),
            None => self.max_level,
        }
    }

    /// Allocate `size` bytes tagged with `alloc_id`
    ///
    /// Returns the address of the allocation. Fails with
    /// [`AllocError::NoMemory`] when neither splitting nor merging produces a
    /// block big enough.
    #[cfg_attr(feature = "tracking", track_caller)]
    pub fn alloc(
        &mut self,
        pool: &mut BuddyPool,
        stats: &mut GlobalStats,
        size: usize,
        alloc_id: AllocId,
    ) -> AllocResult<usize> {
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }
        if size > self.total_size {
            return Err(AllocError::NoMemory);
        }

        let level = self.level_for(size);

        let node_idx = match self.free_lists[level as usize].pop_front(pool) {
            Some(idx) => Some(idx),
            None => {
                // prefer splitting
                let mut found = None;
                if level < self.max_level {
                    found = self.find_by_splitting(pool, level);
                }
                // else try merging
                if found.is_none() && level > 0 {
                    found = self.find_by_merging(pool, level);
                }
                found
            }
        };

        let Some(node_idx) = node_idx else {
            trace!(
                "heap {:#x}: no block for {} bytes at level {}",
                self.base_addr,
                size,
                level
            );
            debug_assert!(self.sanity_test(pool));
            return Err(AllocError::NoMemory);
        };

        let addr = {
            let buddy = pool.buddy_mut(node_idx);
            buddy.occupied_size = size;
            buddy.alloc_id = alloc_id;
            buddy.is_last_buddy = true;
            #[cfg(feature = "tracking")]
            {
                buddy.location = Some(Location::caller());
            }
            buddy.addr
        };

        let alloc_size = match self.max_int_frag {
            Some(threshold) => self.reduce_int_fragment(pool, node_idx, threshold),
            None => {
                self.allocated.insert_sorted(pool, node_idx);
                self.level_size(level)
            }
        };

        let fragmentation = alloc_size - size;
        self.alloc_mem += alloc_size;
        self.internal_fragmentation += fragmentation;
        self.max_alloc_mem = self.max_alloc_mem.max(self.alloc_mem);
        self.max_internal_fragmentation = self
            .max_internal_fragmentation
            .max(self.internal_fragmentation);
        stats.add_allocation(alloc_id, alloc_size, fragmentation);

        debug_assert!(self.sanity_test(pool));
        Ok(self.to_external(addr))
    }

    /// Resize an allocation without moving it
    ///
    /// Growing only uses the unused tail of the allocation's last block.
    /// Shrinking gives whole trailing blocks of a chained allocation back to
    /// the free lists. A zero `size` is rejected, use [`Heap::free`].
    #[cfg_attr(feature = "tracking", track_caller)]
    pub fn realloc(
        &mut self,
        pool: &mut BuddyPool,
        stats: &mut GlobalStats,
        addr: usize,
        size: usize,
    ) -> AllocResult {
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }
        if size > self.total_size {
            return Err(AllocError::NoMemory);
        }

        let mut internal = self.to_internal(addr).ok_or(AllocError::NotAllocated)?;
        if self.is_chain_interior(pool, internal) {
            return Err(AllocError::NotAllocated);
        }

        // collect all buddies backing this allocation
        let mut chain = Vec::new();
        let mut total_occupied = 0;
        loop {
            let (idx, _) = self
                .allocated
                .find_by_addr(pool, internal)
                .ok_or(AllocError::NotAllocated)?;
            let buddy = pool.buddy(idx);
            chain.push(idx);
            total_occupied += buddy.occupied_size;
            internal += buddy.units();
            if buddy.is_last_buddy {
                break;
            }
        }

        let Some(mut cur) = chain.pop() else {
            return Err(AllocError::NotAllocated);
        };
        let alloc_id = pool.buddy(cur).alloc_id;

        if total_occupied < size {
            let buddy = pool.buddy_mut(cur);
            let left_space = buddy.block_size(self.min_block_log2) - buddy.occupied_size;
            let needed_space = size - total_occupied;
            if needed_space > left_space {
                return Err(AllocError::NoMemory);
            }
            buddy.occupied_size += needed_space;
            #[cfg(feature = "tracking")]
            {
                buddy.location = Some(Location::caller());
            }

            self.internal_fragmentation -= needed_space;
            stats.shrink_allocation(alloc_id, 0, needed_space);
        } else {
            let old_frag = {
                let buddy = pool.buddy(cur);
                buddy.block_size(self.min_block_log2) - buddy.occupied_size
            };
            self.internal_fragmentation -= old_frag;
            stats.shrink_allocation(alloc_id, 0, old_frag);

            // release trailing buddies until the rest covers the new size
            let mut diff = total_occupied - size;
            while diff >= pool.buddy(cur).occupied_size {
                let buddy = *pool.buddy(cur);
                diff -= buddy.occupied_size;
                self.allocated.remove(pool, cur);
                pool.buddy_mut(cur).mark_free();
                self.free_lists[buddy.level as usize].insert_sorted(pool, cur);

                let block_size = buddy.block_size(self.min_block_log2);
                self.alloc_mem -= block_size;
                stats.shrink_allocation(alloc_id, block_size, 0);

                cur = match chain.pop() {
                    Some(idx) => idx,
                    None => {
                        error!("heap {:#x}: realloc chain underflow", self.base_addr);
                        return Err(AllocError::InvalidParam);
                    }
                };
            }

            let buddy = pool.buddy_mut(cur);
            buddy.is_last_buddy = true;
            buddy.occupied_size -= diff;
            #[cfg(feature = "tracking")]
            {
                buddy.location = Some(Location::caller());
            }
            let new_frag = buddy.block_size(self.min_block_log2) - buddy.occupied_size;

            self.internal_fragmentation += new_frag;
            self.max_internal_fragmentation = self
                .max_internal_fragmentation
                .max(self.internal_fragmentation);
            stats.grow_allocation(alloc_id, 0, new_frag);
        }

        debug_assert!(self.sanity_test(pool));
        Ok(())
    }

    /// Free the allocation starting at `addr`
    ///
    /// Blocks go back to the free list of their level as they are; adjacent
    /// free buddies are not merged here.
    pub fn free(&mut self, pool: &mut BuddyPool, stats: &mut GlobalStats, addr: usize) -> AllocResult {
        let mut internal = self.to_internal(addr).ok_or(AllocError::NotAllocated)?;
        if self.is_chain_interior(pool, internal) {
            warn!("heap {:#x}: free of interior address {:#x}", self.base_addr, addr);
            return Err(AllocError::NotAllocated);
        }

        let mut released = 0;
        let mut released_frag = 0;
        let mut alloc_id = AllocId::UNASSIGNED;
        loop {
            let Some(idx) = self.allocated.find_and_pop(pool, internal) else {
                if released == 0 {
                    return Err(AllocError::NotAllocated);
                }
                error!("heap {:#x}: broken buddy chain at unit {}", self.base_addr, internal);
                break;
            };

            let buddy = *pool.buddy(idx);
            let block_size = buddy.block_size(self.min_block_log2);
            alloc_id = buddy.alloc_id;
            released += block_size;
            released_frag += block_size - buddy.occupied_size;

            pool.buddy_mut(idx).mark_free();
            self.free_lists[buddy.level as usize].insert_sorted(pool, idx);

            // check if this allocation occupied another buddy
            if buddy.is_last_buddy {
                break;
            }
            internal += buddy.units();
        }

        self.alloc_mem -= released;
        self.internal_fragmentation -= released_frag;
        stats.remove_allocation(alloc_id, released, released_frag);

        debug_assert!(self.sanity_test(pool));
        Ok(())
    }

    /// Whether `internal` is a non-first block of a chained allocation
    fn is_chain_interior(&self, pool: &BuddyPool, internal: usize) -> bool {
        match self.allocated.find_by_addr(pool, internal) {
            Some((_, Some(prev))) => {
                let prev = pool.buddy(prev);
                !prev.is_last_buddy && prev.end_addr() == internal
            }
            _ => false,
        }
    }

    /// Split a free, unlinked block in place: the node keeps the lower half,
    /// the upper half goes to the free list one level down.
    fn split_buddy(&mut self, pool: &mut BuddyPool, node_idx: usize) -> bool {
        let upper = {
            let buddy = pool.buddy_mut(node_idx);
            if buddy.level == 0 {
                return false;
            }
            buddy.level -= 1;
            let mut upper = Buddy::new(buddy.addr, buddy.level);
            upper.addr += upper.units();
            upper
        };

        let upper_idx = pool.alloc_node(upper);
        self.free_lists[upper.level as usize].insert_sorted(pool, upper_idx)
    }

    /// Merge two unlinked free buddies into one block a level up
    fn merge_buddies(&mut self, pool: &mut BuddyPool, b0: usize, b1: usize) -> bool {
        let (lower, upper) = (*pool.buddy(b0), *pool.buddy(b1));
        if lower.level != upper.level
            || lower.level >= self.max_level
            || !lower.is_left_buddy()
            || upper.addr != lower.end_addr()
        {
            error!(
                "heap {:#x}: cannot merge units {} and {} at level {}",
                self.base_addr, lower.addr, upper.addr, lower.level
            );
            self.free_lists[lower.level as usize].insert_sorted(pool, b0);
            self.free_lists[upper.level as usize].insert_sorted(pool, b1);
            return false;
        }

        let merged = pool.buddy_mut(b0);
        merged.mark_free();
        merged.level += 1;
        let level = merged.level as usize;
        self.free_lists[level].insert_sorted(pool, b0);

        pool.dealloc_node(b1);
        true
    }

    /// Find a block at `search_level` by splitting the smallest bigger one
    fn find_by_splitting(&mut self, pool: &mut BuddyPool, search_level: u8) -> Option<usize> {
        let mut cur_level = search_level;

        // walk up for a free buddy at level >= search_level
        while self.free_lists[cur_level as usize].is_empty() && cur_level < self.max_level {
            cur_level += 1;
        }

        let node_idx = self.free_lists[cur_level as usize].pop_front(pool)?;
        while cur_level > search_level {
            self.split_buddy(pool, node_idx);
            cur_level -= 1;
        }
        Some(node_idx)
    }

    /// Build a block at `search_level` by merging free buddies of lower levels
    ///
    /// Pairs found at a level climb one level up; when a level has no pairs the
    /// search drops a level to produce some. Every climb consumes a merge, so the
    /// walk ends.
    fn find_by_merging(&mut self, pool: &mut BuddyPool, search_level: u8) -> Option<usize> {
        if search_level == 0 {
            return None;
        }

        let mut cur_level = search_level - 1;
        loop {
            // pairs needed at this level to make one block at search_level
            let num_to_find = 1usize << (search_level - 1 - cur_level);
            let found = self.find_pair_and_merge(pool, cur_level, num_to_find);
            if found > 0 {
                if cur_level == search_level - 1 {
                    break;
                }
                cur_level += 1;
            } else if cur_level > 0 {
                cur_level -= 1;
            } else {
                return None;
            }
        }

        self.free_lists[search_level as usize].pop_front(pool)
    }

    fn find_pair_and_merge(&mut self, pool: &mut BuddyPool, level: u8, num_to_find: usize) -> usize {
        let mut found = 0;
        while found < num_to_find {
            match self.free_lists[level as usize].take_buddy_pair(pool) {
                Some((b0, b1)) => {
                    if self.merge_buddies(pool, b0, b1) {
                        found += 1;
                    }
                }
                None => break,
            }
        }
        found
    }

    /// Cut the unused tail off a fresh allocation
    ///
    /// While the block wastes more than `threshold` bytes it is halved: a
    /// completely filled lower half becomes a chain link in the allocated list
    /// and the upper half carries on, otherwise the empty upper half is freed
    /// and the lower half carries on. Returns the block bytes allocated.
    fn reduce_int_fragment(&mut self, pool: &mut BuddyPool, node_idx: usize, threshold: usize) -> usize {
        let mut alloc_size = 0;
        let cur = node_idx;
        pool.buddy_mut(cur).is_last_buddy = false;

        loop {
            let buddy = *pool.buddy(cur);
            let block_size = buddy.block_size(self.min_block_log2);
            if buddy.level == 0 || block_size - buddy.occupied_size <= threshold {
                break;
            }

            let half_level = buddy.level - 1;
            let half_size = self.level_size(half_level);

            let mut lower = buddy;
            lower.level = half_level;
            let mut upper = buddy;
            upper.level = half_level;
            upper.addr += upper.units();

            if half_size < buddy.occupied_size {
                // lower half is full, upper half holds the rest
                lower.occupied_size = half_size;
                upper.occupied_size -= half_size;
                let lower_idx = pool.alloc_node(lower);
                self.allocated.insert_sorted(pool, lower_idx);
                alloc_size += half_size;
                *pool.buddy_mut(cur) = upper;
            } else {
                // upper half is unused
                *pool.buddy_mut(cur) = lower;
                upper.mark_free();
                let upper_idx = pool.alloc_node(upper);
                self.free_lists[half_level as usize].insert_sorted(pool, upper_idx);
            }
        }

        let last = pool.buddy_mut(cur);
        last.is_last_buddy = true;
        alloc_size += last.block_size(self.min_block_log2);
        self.allocated.insert_sorted(pool, cur);
        alloc_size
    }

    /// Fill a snapshot with the per-page parts selected by `flags`
    pub fn get_stats(&self, pool: &BuddyPool, flags: StatsFlags) -> HeapStats {
        let mut stats = HeapStats::new();

        if flags.contains(StatsFlags::BASIC_STATS) {
            stats.heap_size = self.total_size;
            stats.total_allocated = self.alloc_mem;
            stats.max_allocated = self.max_alloc_mem;
        }
        if flags.contains(StatsFlags::INTERNAL_FRAGMENTATION) {
            stats.internal_fragmentation = self.internal_fragmentation;
            stats.max_internal_fragmentation = self.max_internal_fragmentation;
        }
        if flags.contains(StatsFlags::BIGGEST_FREE_BLOCK) {
            stats.biggest_free_block = (0..=self.max_level)
                .rev()
                .find(|&level| !self.free_lists[level as usize].is_empty())
                .map_or(0, |level| self.level_size(level));
        }
        if flags.contains(StatsFlags::HISTOGRAM) {
            for (level, list) in self.free_lists.iter().enumerate() {
                stats.free_buddy_histogram[level] = list.len();
            }
            for (_, buddy) in self.allocated.iter(pool) {
                stats.allocated_buddy_histogram[buddy.level as usize] += 1;
            }
            stats.num_entries = self.max_level as usize + 1;
        }

        stats
    }

    /// Rasterize occupancy into `out`: each byte covering an allocated block
    /// holds `level + 1`, free space stays 0.
    pub fn visualize_memory(&self, pool: &BuddyPool, out: &mut [u8]) {
        out.fill(0);
        let units = 1u128 << self.max_level;
        let len = out.len() as u128;
        let scale = |unit: usize| ((unit as u128 * len) / units) as usize;

        for (_, buddy) in self.allocated.iter(pool) {
            let start = scale(buddy.addr);
            let end = scale(buddy.end_addr()).min(out.len());
            out[start..end].fill(buddy.level + 1);
        }
    }

    /// Recompute bookkeeping from the lists and compare it to the counters
    ///
    /// Free and allocated blocks must tile the page exactly, list lengths must
    /// match their nodes and no level may hold more blocks than fit the page.
    pub fn sanity_test(&self, pool: &BuddyPool) -> bool {
        let mut sum = 0;

        for (level, list) in self.free_lists.iter().enumerate() {
            let mut count = 0;
            for (_, buddy) in list.iter(pool) {
                if buddy.level as usize != level || buddy.occupied_size != 0 {
                    return false;
                }
                sum += buddy.block_size(self.min_block_log2);
                count += 1;
            }
            if count != list.len() || count > (1usize << (self.max_level as usize - level)) {
                return false;
            }
        }

        let mut count = 0;
        let mut allocated = 0;
        for (_, buddy) in self.allocated.iter(pool) {
            let block_size = buddy.block_size(self.min_block_log2);
            if buddy.level > self.max_level || buddy.occupied_size > block_size {
                return false;
            }
            sum += block_size;
            allocated += block_size;
            count += 1;
        }

        count == self.allocated.len() && allocated == self.alloc_mem && sum == self.total_size
    }

    /// Tear the heap down, returning every node to the pool
    ///
    /// Allocations still alive are reported to `reporter`. Returns the number
    /// of leaked blocks.
    pub fn destroy(mut self, pool: &mut BuddyPool, reporter: &dyn LeakReporter) -> usize {
        for list in &mut self.free_lists {
            list.clear(pool);
        }

        let mut leaks = 0;
        while let Some(idx) = self.allocated.pop_front(pool) {
            let buddy = *pool.buddy(idx);
            reporter.report_leak(&MemoryLeak {
                address: self.to_external(buddy.addr),
                block_size: buddy.block_size(self.min_block_log2),
                occupied_size: buddy.occupied_size,
                alloc_id: buddy.alloc_id,
                #[cfg(feature = "tracking")]
                location: buddy.location,
            });
            pool.dealloc_node(idx);
            leaks += 1;
        }
        leaks
    }
}
