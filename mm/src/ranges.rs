//! Free virtual-range bookkeeping for one worker.
//!
//! An ordered map from range start to length, covering the addresses a
//! worker owns but has not handed to a VMA. Adjacent ranges are merged on
//! insert, so the map never contains two entries `(a, la)`, `(b, lb)` with
//! `a + la == b`.

use alloc::collections::BTreeMap;

/// Coalescing map of free virtual ranges.
#[derive(Debug, Default)]
pub struct FreeRanges {
    map: BTreeMap<usize, usize>,
}

impl FreeRanges {
    pub const fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Number of distinct free ranges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total free bytes.
    #[must_use]
    pub fn total(&self) -> usize {
        self.map.values().sum()
    }

    /// The free range starting at or before `addr`, if any.
    fn prev_range(&self, addr: usize) -> Option<(usize, usize)> {
        self.map
            .range(..=addr)
            .next_back()
            .map(|(&start, &len)| (start, len))
    }

    /// Whether `[addr, addr + size)` is entirely free.
    #[must_use]
    pub fn contains(&self, addr: usize, size: usize) -> bool {
        match self.prev_range(addr) {
            Some((start, len)) => addr + size <= start + len,
            None => false,
        }
    }

    /// Return a range to the map, merging with both neighbours.
    pub fn free(&mut self, addr: usize, size: usize) {
        debug_assert!(size > 0);
        debug_assert!(!self.contains(addr, 1), "double free of virtual range");

        // Merge with the preceding range if physically adjacent.
        let (start, len) = match self.prev_range(addr) {
            Some((pstart, plen)) if pstart + plen == addr => (pstart, plen + size),
            _ => (addr, size),
        };
        self.map.insert(start, len);

        // Merge with the following range if physically adjacent.
        let next = self.map.range(start + 1..).next().map(|(&s, &l)| (s, l));
        if let Some((nstart, nlen)) = next {
            if nstart == start + len {
                self.map.remove(&nstart);
                self.map.insert(start, len + nlen);
            }
        }
    }

    /// Remove `[addr, addr + size)` from the map, splitting the covering
    /// free range. The range must be entirely free.
    pub fn allocate(&mut self, addr: usize, size: usize) {
        let (start, len) = self
            .prev_range(addr)
            .expect("allocate: range not in free map");
        assert!(
            addr + size <= start + len,
            "allocate: range not entirely free"
        );

        if start == addr {
            // Allocating the beginning of a free range.
            self.map.remove(&start);
            if len > size {
                self.map.insert(addr + size, len - size);
            }
        } else {
            // Allocating the middle or end of a free range.
            let head = addr - start;
            self.map.insert(start, head);
            let tail = start + len - (addr + size);
            if tail > 0 {
                self.map.insert(addr + size, tail);
            }
        }
    }

    /// First-fit reservation of `size` bytes. A larger range is shrunk and
    /// its tail returned, so repeated small reservations do not fragment
    /// the low end of the worker's territory.
    pub fn reserve(&mut self, size: usize) -> Option<usize> {
        let mut exact: Option<usize> = None;
        for (&start, len) in self.map.iter_mut() {
            if *len > size {
                *len -= size;
                return Some(start + *len);
            }
            if *len == size {
                exact = Some(start);
                break;
            }
        }
        if let Some(start) = exact {
            self.map.remove(&start);
        }
        exact
    }

    /// Iterate over `(start, len)` pairs in address order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.map.iter().map(|(&s, &l)| (s, l))
    }
}
