//! Shared buddy node pool
//!
//! Provides a single arena of list nodes shared by every page and level of a
//! heap manager. Nodes are addressed by index; freed slots are threaded onto an
//! internal free list and recycled before the arena grows.

use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::error;

use super::buddy_block::Buddy;

/// Number of nodes the pool is sized for up front
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Linked list node stored in the pool
#[derive(Debug, Clone, Copy)]
pub struct ListNode<T> {
    pub data: T,
    pub next: Option<usize>,
}

/// Buddy node pool - all pages and levels share nodes from this pool
pub struct BuddyPool {
    nodes: Vec<ListNode<Buddy>>,
    /// Free list head - first recyclable slot
    free_head: Option<usize>,
    /// Current number of free slots in the pool
    free_nodes: usize,
    /// Allocation statistics
    total_allocations: usize,
    total_deallocations: usize,
}

impl BuddyPool {
    /// Create an empty pool; the arena grows on first use
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free_head: None,
            free_nodes: 0,
            total_allocations: 0,
            total_deallocations: 0,
        }
    }

    /// Create a pool with room for `capacity` nodes before reallocating
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            ..Self::new()
        }
    }

    /// Take a node from the pool and fill it with `data`
    ///
    /// The returned node is unlinked (`next == None`).
    pub fn alloc_node(&mut self, data: Buddy) -> usize {
        self.total_allocations += 1;
        match self.free_head {
            Some(idx) => {
                let node = &mut self.nodes[idx];
                self.free_head = node.next;
                node.data = data;
                node.next = None;
                self.free_nodes -= 1;
                idx
            }
            None => {
                self.nodes.push(ListNode { data, next: None });
                self.nodes.len() - 1
            }
        }
    }

    /// Return a node to the pool
    ///
    /// The node must not be part of any active list when freed.
    pub fn dealloc_node(&mut self, node_idx: usize) {
        let free_head = self.free_head;
        match self.nodes.get_mut(node_idx) {
            Some(node) => {
                node.data = Buddy::new(0, 0);
                node.next = free_head;
            }
            None => {
                error!("buddy pool: dealloc of invalid node index {}", node_idx);
                return;
            }
        }

        self.free_head = Some(node_idx);
        self.total_deallocations += 1;
        self.free_nodes += 1;
    }

    /// Get a reference to a node by index
    #[inline]
    pub fn get_node(&self, node_idx: usize) -> Option<&ListNode<Buddy>> {
        self.nodes.get(node_idx)
    }

    /// Get a mutable reference to a node by index
    #[inline]
    pub fn get_node_mut(&mut self, node_idx: usize) -> Option<&mut ListNode<Buddy>> {
        self.nodes.get_mut(node_idx)
    }

    /// Buddy data of a live node
    ///
    /// Panics on an out-of-range index, which only a corrupted list can produce.
    #[inline]
    pub fn buddy(&self, node_idx: usize) -> &Buddy {
        &self.nodes[node_idx].data
    }

    /// Mutable buddy data of a live node
    #[inline]
    pub fn buddy_mut(&mut self, node_idx: usize) -> &mut Buddy {
        &mut self.nodes[node_idx].data
    }

    /// Get the number of free nodes in the pool
    pub fn free_node_count(&self) -> usize {
        self.free_nodes
    }

    /// Get the number of nodes currently handed out
    pub fn allocated_node_count(&self) -> usize {
        self.nodes.len() - self.free_nodes
    }

    /// Get pool statistics
    pub fn get_stats(&self) -> NodePoolStats {
        NodePoolStats {
            total_nodes: self.nodes.len(),
            free_nodes: self.free_nodes,
            allocated_nodes: self.allocated_node_count(),
            total_allocations: self.total_allocations,
            total_deallocations: self.total_deallocations,
        }
    }
}

impl Default for BuddyPool {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }
}

/// Node pool statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodePoolStats {
    pub total_nodes: usize,
    pub free_nodes: usize,
    pub allocated_nodes: usize,
    pub total_allocations: usize,
    pub total_deallocations: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_dealloc() {
        let mut pool = BuddyPool::new();

        let idx1 = pool.alloc_node(Buddy::new(0x10, 0));
        assert_eq!(pool.free_node_count(), 0);
        assert_eq!(pool.allocated_node_count(), 1);

        let idx2 = pool.alloc_node(Buddy::new(0x20, 0));
        assert_ne!(idx1, idx2);
        assert_eq!(pool.allocated_node_count(), 2);

        pool.dealloc_node(idx1);
        assert_eq!(pool.free_node_count(), 1);

        pool.dealloc_node(idx2);
        assert_eq!(pool.free_node_count(), 2);
        assert_eq!(pool.allocated_node_count(), 0);
    }

    #[test]
    fn test_slots_are_recycled() {
        let mut pool = BuddyPool::new();
        let idx = pool.alloc_node(Buddy::new(1, 0));
        pool.dealloc_node(idx);

        let again = pool.alloc_node(Buddy::new(2, 1));
        assert_eq!(idx, again);
        assert_eq!(pool.get_stats().total_nodes, 1);
        assert_eq!(pool.buddy(again).addr, 2);
        assert_eq!(pool.buddy(again).level, 1);
        assert!(pool.get_node(again).unwrap().next.is_none());
    }

    #[test]
    fn test_node_access() {
        let mut pool = BuddyPool::new();
        let idx = pool.alloc_node(Buddy::new(0, 0));

        if let Some(node) = pool.get_node_mut(idx) {
            node.data.addr = 0x40;
            node.data.occupied_size = 100;
        }

        let node = pool.get_node(idx).unwrap();
        assert_eq!(node.data.addr, 0x40);
        assert_eq!(node.data.occupied_size, 100);
        assert!(pool.get_node(idx + 1).is_none());
    }

    #[test]
    fn test_stats() {
        let mut pool = BuddyPool::default();
        let idx1 = pool.alloc_node(Buddy::new(0, 0));
        let _idx2 = pool.alloc_node(Buddy::new(1, 0));

        let stats = pool.get_stats();
        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.free_nodes, 0);
        assert_eq!(stats.allocated_nodes, 2);
        assert_eq!(stats.total_allocations, 2);
        assert_eq!(stats.total_deallocations, 0);

        pool.dealloc_node(idx1);
        let stats2 = pool.get_stats();
        assert_eq!(stats2.free_nodes, 1);
        assert_eq!(stats2.total_deallocations, 1);
    }
}
