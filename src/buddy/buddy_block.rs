//! Buddy block metadata
//!
//! Represents one power-of-two block of a page, free or allocated.

#[cfg(feature = "tracking")]
use core::panic::Location;

use crate::AllocId;

/// Buddy block metadata
///
/// `addr` is an offset from the page base in units of the page's minimum
/// block size; the block spans `1 << level` such units.
#[derive(Debug, Clone, Copy)]
pub struct Buddy {
    pub addr: usize,
    pub level: u8,
    /// Bytes handed out to the client, 0 while free.
    pub occupied_size: usize,
    pub alloc_id: AllocId,
    /// Cleared on every link but the last of a chain backing one allocation.
    pub is_last_buddy: bool,
    #[cfg(feature = "tracking")]
    pub location: Option<&'static Location<'static>>,
}

impl Buddy {
    /// Create a free buddy
    pub const fn new(addr: usize, level: u8) -> Self {
        Self {
            addr,
            level,
            occupied_size: 0,
            alloc_id: AllocId::UNASSIGNED,
            is_last_buddy: true,
            #[cfg(feature = "tracking")]
            location: None,
        }
    }

    /// Block span in minimum-block units
    #[inline]
    pub const fn units(&self) -> usize {
        1 << self.level
    }

    /// Block size in bytes for a page with the given minimum block size exponent
    #[inline]
    pub const fn block_size(&self, min_block_log2: u32) -> usize {
        1 << (self.level as u32 + min_block_log2)
    }

    /// Address of the block one past this one, in minimum-block units
    #[inline]
    pub const fn end_addr(&self) -> usize {
        self.addr + self.units()
    }

    /// Whether this block is the lower half of its parent
    #[inline]
    pub const fn is_left_buddy(&self) -> bool {
        self.addr & self.units() == 0
    }

    /// Put the node back into its pristine free state
    pub fn mark_free(&mut self) {
        self.occupied_size = 0;
        self.alloc_id = AllocId::UNASSIGNED;
        self.is_last_buddy = true;
        #[cfg(feature = "tracking")]
        {
            self.location = None;
        }
    }
}

impl PartialEq for Buddy {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.level == other.level
    }
}

impl PartialOrd for Buddy {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        (self.addr, self.level).partial_cmp(&(other.addr, other.level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buddy_geometry() {
        let b = Buddy::new(8, 3);
        assert_eq!(b.units(), 8);
        assert_eq!(b.end_addr(), 16);
        assert_eq!(b.block_size(8), 2048);
        // [8, 16) is the upper half of [0, 16), and itself splits into [8, 12) and [12, 16)
        assert!(!b.is_left_buddy());
        assert!(Buddy::new(0, 3).is_left_buddy());
        assert!(Buddy::new(8, 2).is_left_buddy());
        assert!(!Buddy::new(12, 2).is_left_buddy());
    }

    #[test]
    fn test_mark_free() {
        let mut b = Buddy::new(0, 1);
        b.occupied_size = 12;
        b.alloc_id = AllocId(3);
        b.is_last_buddy = false;
        b.mark_free();
        assert_eq!(b.occupied_size, 0);
        assert_eq!(b.alloc_id, AllocId::UNASSIGNED);
        assert!(b.is_last_buddy);
    }
}
