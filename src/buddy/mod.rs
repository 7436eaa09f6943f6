//! Buddy heap module
//!
//! This module provides a complete paged buddy heap with:
//! - Address-sorted pooled linked lists per level
//! - Lazy merging and optional fragmentation capping per page
//! - Multi-page growth and reclamation
//! - Detailed statistics and debugging

pub mod buddy_block;
pub mod global_node_pool;
pub mod heap;
pub mod paged_heap;
pub mod pooled_list;
pub mod stats;

pub use buddy_block::Buddy;
pub use global_node_pool::{BuddyPool, ListNode, NodePoolStats};
pub use heap::{Heap, LeakReporter, LogLeakReporter, MemoryLeak};
pub use paged_heap::{HeapConfig, HeapPage, PagedHeap};
pub use pooled_list::PooledLinkedList;
pub use stats::{AllocIdStats, GlobalStats, HeapStats, StatsFlags};
