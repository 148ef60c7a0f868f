//! IPv4 range allocation.
//!
//! Tracks which addresses inside an inclusive `[start, end]` window are in
//! use. The bitmap is dense: bit `i` set means `start + i` is allocated.
//! Allocation scans from a rotating cursor so repeated grants spread across
//! the range instead of clustering at the low end.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

const WORD_BITS: u32 = 64;

/// Dense-bitmap allocator over a contiguous IPv4 window.
#[derive(Debug, Clone)]
pub struct RangeAllocator {
    start: u32,
    end: u32,
    words: Vec<u64>,
    /// Index the next unhinted allocation starts scanning from.
    cursor: u32,
    allocated: u32,
}

impl RangeAllocator {
    /// Creates an allocator for the inclusive range `[start, end]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] unless `start < end` compared as
    /// big-endian 32-bit integers.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        let start = u32::from(start);
        let end = u32::from(end);

        if start >= end {
            return Err(Error::InvalidConfig(format!(
                "range start {} must be lower than range end {}",
                Ipv4Addr::from(start),
                Ipv4Addr::from(end)
            )));
        }

        let capacity = end - start + 1;
        let words = capacity.div_ceil(WORD_BITS) as usize;

        Ok(Self {
            start,
            end,
            words: vec![0; words],
            cursor: 0,
            allocated: 0,
        })
    }

    /// Number of addresses in the range.
    pub fn capacity(&self) -> u32 {
        self.end - self.start + 1
    }

    /// Number of addresses currently allocated.
    pub fn allocated_count(&self) -> u32 {
        self.allocated
    }

    /// Allocates a free address.
    ///
    /// A `hint` that is in-range and free is honoured exactly; an absent,
    /// out-of-range, or taken hint falls back to the cursor scan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exhausted`] when every address is in use.
    pub fn allocate(&mut self, hint: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
        if let Some(hint) = hint
            && let Some(index) = self.index_of(hint)
            && !self.bit(index)
        {
            self.set_bit(index);
            self.cursor = (index + 1) % self.capacity();
            return Ok(hint);
        }

        let index = self.next_free().ok_or(Error::Exhausted)?;
        self.set_bit(index);
        self.cursor = (index + 1) % self.capacity();
        Ok(Ipv4Addr::from(self.start + index))
    }

    /// Marks `ip` free again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for addresses outside the window and
    /// [`Error::NotAllocated`] when the address is already free.
    pub fn free(&mut self, ip: Ipv4Addr) -> Result<()> {
        let index = self.index_of(ip).ok_or(Error::OutOfRange(ip))?;
        if !self.bit(index) {
            return Err(Error::NotAllocated(ip));
        }
        self.clear_bit(index);
        // Rewind so a freed address is reused before the window wraps.
        self.cursor = self.cursor.min(index);
        Ok(())
    }

    /// Whether `ip` is currently allocated. Out-of-range addresses are
    /// never allocated.
    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.index_of(ip).is_some_and(|index| self.bit(index))
    }

    /// Whether `ip` falls inside the configured window.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.index_of(ip).is_some()
    }

    fn index_of(&self, ip: Ipv4Addr) -> Option<u32> {
        let addr = u32::from(ip);
        (self.start..=self.end)
            .contains(&addr)
            .then(|| addr - self.start)
    }

    fn bit(&self, index: u32) -> bool {
        self.words[(index / WORD_BITS) as usize] & (1 << (index % WORD_BITS)) != 0
    }

    fn set_bit(&mut self, index: u32) {
        self.words[(index / WORD_BITS) as usize] |= 1 << (index % WORD_BITS);
        self.allocated += 1;
    }

    fn clear_bit(&mut self, index: u32) {
        self.words[(index / WORD_BITS) as usize] &= !(1 << (index % WORD_BITS));
        self.allocated -= 1;
    }

    /// First free index at or after the cursor, wrapping to the bottom.
    fn next_free(&self) -> Option<u32> {
        let capacity = self.capacity();
        if self.allocated == capacity {
            return None;
        }
        (self.cursor..capacity)
            .chain(0..self.cursor)
            .find(|&index| !self.bit(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 0, last)
    }

    fn allocator(start: u8, end: u8) -> RangeAllocator {
        RangeAllocator::new(ip(start), ip(end)).unwrap()
    }

    #[test]
    fn test_rejects_inverted_range() {
        assert!(RangeAllocator::new(ip(10), ip(5)).is_err());
        assert!(RangeAllocator::new(ip(10), ip(10)).is_err());
    }

    #[test]
    fn test_capacity() {
        assert_eq!(allocator(1, 3).capacity(), 3);
        let wide = RangeAllocator::new(
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::new(10, 0, 255, 255),
        )
        .unwrap();
        assert_eq!(wide.capacity(), 65536);
    }

    #[test]
    fn test_allocates_from_the_bottom_first() {
        let mut alloc = allocator(1, 3);
        assert_eq!(alloc.allocate(None).unwrap(), ip(1));
        assert_eq!(alloc.allocate(None).unwrap(), ip(2));
        assert_eq!(alloc.allocate(None).unwrap(), ip(3));
        assert!(matches!(alloc.allocate(None), Err(Error::Exhausted)));
    }

    #[test]
    fn test_honours_free_hint() {
        let mut alloc = allocator(1, 10);
        assert_eq!(alloc.allocate(Some(ip(7))).unwrap(), ip(7));
        assert!(alloc.is_allocated(ip(7)));
    }

    #[test]
    fn test_taken_hint_falls_back() {
        let mut alloc = allocator(1, 3);
        assert_eq!(alloc.allocate(Some(ip(2))).unwrap(), ip(2));
        let other = alloc.allocate(Some(ip(2))).unwrap();
        assert_ne!(other, ip(2));
        assert!(alloc.contains(other));
    }

    #[test]
    fn test_out_of_range_hint_falls_back() {
        let mut alloc = allocator(1, 3);
        let granted = alloc.allocate(Some(Ipv4Addr::new(10, 0, 0, 1))).unwrap();
        assert!(alloc.contains(granted));
    }

    #[test]
    fn test_unspecified_hint_is_ignored() {
        let mut alloc = allocator(1, 3);
        let granted = alloc.allocate(Some(Ipv4Addr::UNSPECIFIED)).unwrap();
        assert_eq!(granted, ip(1));
    }

    #[test]
    fn test_cursor_rotates_past_last_grant() {
        let mut alloc = allocator(1, 4);
        assert_eq!(alloc.allocate(None).unwrap(), ip(1));
        assert_eq!(alloc.allocate(None).unwrap(), ip(2));
        assert_eq!(alloc.allocate(None).unwrap(), ip(3));
        assert_eq!(alloc.allocate(None).unwrap(), ip(4));
    }

    #[test]
    fn test_freed_address_is_reused_first() {
        let mut alloc = allocator(1, 4);
        assert_eq!(alloc.allocate(None).unwrap(), ip(1));
        assert_eq!(alloc.allocate(None).unwrap(), ip(2));
        alloc.free(ip(1)).unwrap();
        assert_eq!(alloc.allocate(None).unwrap(), ip(1));
        // With nothing freed the scan continues past the last grant.
        assert_eq!(alloc.allocate(None).unwrap(), ip(3));
    }

    #[test]
    fn test_free_errors() {
        let mut alloc = allocator(1, 3);
        assert!(matches!(
            alloc.free(Ipv4Addr::new(10, 0, 0, 1)),
            Err(Error::OutOfRange(_))
        ));
        assert!(matches!(alloc.free(ip(2)), Err(Error::NotAllocated(_))));

        alloc.allocate(Some(ip(2))).unwrap();
        alloc.free(ip(2)).unwrap();
        assert!(!alloc.is_allocated(ip(2)));
        assert!(matches!(alloc.free(ip(2)), Err(Error::NotAllocated(_))));
    }

    #[test]
    fn test_allocated_count_tracks_grants() {
        let mut alloc = allocator(1, 10);
        assert_eq!(alloc.allocated_count(), 0);
        alloc.allocate(None).unwrap();
        alloc.allocate(None).unwrap();
        assert_eq!(alloc.allocated_count(), 2);
        alloc.free(ip(1)).unwrap();
        assert_eq!(alloc.allocated_count(), 1);
    }

    #[test]
    fn test_fill_and_drain_across_word_boundary() {
        let mut alloc = RangeAllocator::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 130),
        )
        .unwrap();
        let capacity = alloc.capacity();

        let mut granted = Vec::new();
        for _ in 0..capacity {
            granted.push(alloc.allocate(None).unwrap());
        }
        assert!(matches!(alloc.allocate(None), Err(Error::Exhausted)));

        granted.sort();
        granted.dedup();
        assert_eq!(granted.len() as u32, capacity);

        for addr in granted {
            alloc.free(addr).unwrap();
        }
        assert_eq!(alloc.allocated_count(), 0);
    }
}
