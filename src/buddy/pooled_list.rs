//! Pooled linked list implementation using the shared buddy pool
//!
//! Provides address-sorted singly linked lists whose nodes live in a
//! [`BuddyPool`]. Lists only hold the structure (head/len); ownership of a node
//! moves between lists by relinking its index.

#[cfg(feature = "log")]
use log::{error, warn};

use super::global_node_pool::BuddyPool;
use super::Buddy;

/// Pooled linked list - links nodes owned by the pool
pub struct PooledLinkedList {
    head: Option<usize>,
    len: usize,
}

impl PooledLinkedList {
    /// Create a new empty pooled linked list
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Link a node at the front of the list, ignoring sort order
    pub fn push_front(&mut self, pool: &mut BuddyPool, node_idx: usize) {
        if let Some(node) = pool.get_node_mut(node_idx) {
            node.next = self.head;
            self.head = Some(node_idx);
            self.len += 1;
        } else {
            error!("Invalid node reference {} in push_front", node_idx);
        }
    }

    /// Link a node in sorted order (ascending by address)
    ///
    /// Sorted free lists let neighbouring buddies be found by comparing
    /// adjacent list entries only.
    pub fn insert_sorted(&mut self, pool: &mut BuddyPool, node_idx: usize) -> bool {
        let addr = match pool.get_node(node_idx) {
            Some(node) => node.data.addr,
            None => {
                error!("Invalid node reference {} in insert_sorted", node_idx);
                return false;
            }
        };

        // Find insertion position
        let mut prev_idx = None;
        let mut current_idx = self.head;
        let mut visited = 0;

        while let Some(idx) = current_idx {
            if visited > self.len {
                error!("Potential cycle detected during insert");
                return false;
            }

            let node = match pool.get_node(idx) {
                Some(node) => node,
                None => {
                    error!("Invalid node reference in list");
                    return false;
                }
            };
            if node.data.addr > addr {
                break; // Found position
            }
            prev_idx = current_idx;
            current_idx = node.next;
            visited += 1;
        }

        if let Some(node) = pool.get_node_mut(node_idx) {
            node.next = current_idx;
        }

        // Update links
        match prev_idx {
            Some(prev) => {
                if let Some(prev_node) = pool.get_node_mut(prev) {
                    prev_node.next = Some(node_idx);
                }
            }
            None => self.head = Some(node_idx),
        }

        self.len += 1;
        true
    }

    /// Unlink the first node of the list
    pub fn pop_front(&mut self, pool: &mut BuddyPool) -> Option<usize> {
        let head_idx = self.head?;

        match pool.get_node_mut(head_idx) {
            Some(head_node) => {
                self.head = head_node.next.take();
                self.len -= 1;
                Some(head_idx)
            }
            None => {
                error!("Head node {} is corrupted", head_idx);
                None
            }
        }
    }

    /// Check if the list is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the length of the list
    pub fn len(&self) -> usize {
        self.len
    }

    /// Find a node by address
    ///
    /// Returns (node_idx, prev_idx) where prev_idx is the node before it (or None if head)
    pub fn find_by_addr(&self, pool: &BuddyPool, addr: usize) -> Option<(usize, Option<usize>)> {
        let mut prev_idx = None;
        let mut current_idx = self.head;
        let mut visited = 0;

        while let Some(idx) = current_idx {
            if visited > self.len {
                error!("Potential cycle detected during search");
                return None;
            }

            let node = pool.get_node(idx)?;
            // Early termination: list is sorted by address
            if node.data.addr > addr {
                break;
            }
            if node.data.addr == addr {
                return Some((idx, prev_idx));
            }
            prev_idx = current_idx;
            current_idx = node.next;
            visited += 1;
        }

        None
    }

    /// Find the node at `addr` and unlink it
    pub fn find_and_pop(&mut self, pool: &mut BuddyPool, addr: usize) -> Option<usize> {
        let (node_idx, prev_idx) = self.find_by_addr(pool, addr)?;
        self.unlink(pool, node_idx, prev_idx);
        Some(node_idx)
    }

    /// Unlink a node from anywhere in the list
    pub fn remove(&mut self, pool: &mut BuddyPool, node_idx: usize) -> bool {
        let mut prev_idx = None;
        let mut current_idx = self.head;
        let mut visited = 0;

        while let Some(idx) = current_idx {
            if visited > self.len {
                warn!("Potential cycle detected during remove");
                return false;
            }
            if idx == node_idx {
                self.unlink(pool, node_idx, prev_idx);
                return true;
            }
            prev_idx = current_idx;
            current_idx = match pool.get_node(idx) {
                Some(node) => node.next,
                None => break,
            };
            visited += 1;
        }

        false
    }

    /// Unlink the first pair of neighbouring buddies in the list
    ///
    /// A pair is a left buddy (aligned to twice its size) immediately followed
    /// in address space by its right buddy. Since the list is sorted only
    /// list neighbours have to be compared.
    pub fn take_buddy_pair(&mut self, pool: &mut BuddyPool) -> Option<(usize, usize)> {
        let mut prev_idx = None;
        let mut current_idx = self.head;

        while let Some(idx) = current_idx {
            let node = pool.get_node(idx)?;
            let next_idx = node.next?;
            let next = pool.get_node(next_idx)?;

            if node.data.is_left_buddy() && next.data.addr == node.data.end_addr() {
                let after = next.next;
                match prev_idx {
                    Some(prev) => {
                        if let Some(prev_node) = pool.get_node_mut(prev) {
                            prev_node.next = after;
                        }
                    }
                    None => self.head = after,
                }
                if let Some(n) = pool.get_node_mut(idx) {
                    n.next = None;
                }
                if let Some(n) = pool.get_node_mut(next_idx) {
                    n.next = None;
                }
                self.len -= 2;
                return Some((idx, next_idx));
            }

            prev_idx = current_idx;
            current_idx = Some(next_idx);
        }

        None
    }

    fn unlink(&mut self, pool: &mut BuddyPool, node_idx: usize, prev_idx: Option<usize>) {
        let next_idx = pool.get_node_mut(node_idx).and_then(|n| n.next.take());

        match prev_idx {
            Some(prev) => {
                if let Some(prev_node) = pool.get_node_mut(prev) {
                    prev_node.next = next_idx;
                }
            }
            None => self.head = next_idx,
        }

        self.len -= 1;
    }

    /// Get iterator over node indices and their buddies
    pub fn iter<'a>(&'a self, pool: &'a BuddyPool) -> PooledListIter<'a> {
        PooledListIter {
            pool,
            current: self.head,
        }
    }

    /// Unlink every node and return it to the pool
    pub fn clear(&mut self, pool: &mut BuddyPool) {
        while let Some(idx) = self.pop_front(pool) {
            pool.dealloc_node(idx);
        }
    }
}

impl Default for PooledLinkedList {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator for PooledLinkedList
pub struct PooledListIter<'a> {
    pool: &'a BuddyPool,
    current: Option<usize>,
}

impl<'a> Iterator for PooledListIter<'a> {
    type Item = (usize, &'a Buddy);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.current?;
        match self.pool.get_node(idx) {
            Some(node) => {
                self.current = node.next;
                Some((idx, &node.data))
            }
            None => {
                self.current = None;
                None
            }
        }
    }
}
