//! Dynamic header table shared by HPACK (RFC 7541 §2.3.2) and QPACK
//! (RFC 9204 §3.2).
//!
//! Entries are kept oldest-first in one contiguous byte store. Every
//! insertion gets an absolute index (0 for the first entry ever inserted);
//! HPACK addresses entries relative to the newest one, QPACK mostly by
//! absolute index. Eviction always removes the oldest entry, so encoder and
//! decoder agree on the table contents as long as they apply the same
//! insertions in the same order.

use std::collections::VecDeque;

use crate::error::Error;

/// Per-entry accounting overhead (RFC 7541 §4.1).
pub const ENTRY_OVERHEAD: usize = 32;

/// Size of an entry as counted against the table capacity.
pub const fn entry_size(name: &[u8], value: &[u8]) -> usize {
    name.len() + value.len() + ENTRY_OVERHEAD
}

#[derive(Debug, Clone, Copy)]
struct Meta {
    /// Logical offset into the byte store (not adjusted on eviction).
    start: usize,
    name_len: u32,
    value_len: u32,
}

impl Meta {
    fn bytes(&self) -> usize {
        self.name_len as usize + self.value_len as usize
    }
}

/// A borrowed table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<'a> {
    pub name: &'a [u8],
    pub value: &'a [u8],
}

/// Best match found by [`DynamicTable::find`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub absolute: u64,
    /// Value matched too, not just the name.
    pub exact: bool,
}

#[derive(Debug)]
pub struct DynamicTable {
    data: Vec<u8>,
    /// Logical offset of `data[0]`.
    drained: usize,
    entries: VecDeque<Meta>,
    size: usize,
    capacity: usize,
    max_capacity: usize,
    inserted: u64,
}

impl DynamicTable {
    /// A table whose capacity may later be lowered or raised up to `max_capacity`.
    pub fn new(max_capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(max_capacity),
            drained: 0,
            entries: VecDeque::with_capacity(max_capacity / ENTRY_OVERHEAD),
            size: 0,
            capacity: max_capacity,
            max_capacity,
            inserted: 0,
        }
    }

    /// Insert an entry, evicting oldest entries until it fits.
    ///
    /// Returns the number of evicted entries. An entry larger than the
    /// whole capacity is rejected and leaves the table untouched.
    pub fn insert(&mut self, name: &[u8], value: &[u8]) -> Result<usize, Error> {
        let size = entry_size(name, value);
        if size > self.capacity {
            return Err(Error::TableCapacityExceeded);
        }
        let evicted = self.evict_to(self.capacity - size);
        let start = self.drained + self.data.len();
        self.data.extend_from_slice(name);
        self.data.extend_from_slice(value);
        self.entries.push_back(Meta { start, name_len: name.len() as u32, value_len: value.len() as u32 });
        self.size += size;
        self.inserted += 1;
        Ok(evicted)
    }

    /// Insert a new entry reusing the name of the entry at `absolute`.
    pub fn insert_with_name_of(&mut self, absolute: u64, value: &[u8]) -> Result<usize, Error> {
        let name = self.get_absolute(absolute)?.name.to_vec();
        self.insert(&name, value)
    }

    /// Re-insert a copy of the entry at `absolute` (QPACK Duplicate).
    pub fn duplicate(&mut self, absolute: u64) -> Result<usize, Error> {
        let entry = self.get_absolute(absolute)?;
        let (name, value) = (entry.name.to_vec(), entry.value.to_vec());
        self.insert(&name, &value)
    }

    /// Entry by relative index, 0 being the most recent insertion.
    pub fn get_relative(&self, index: u64) -> Result<Entry<'_>, Error> {
        let len = self.entries.len() as u64;
        if index >= len {
            return Err(Error::InvalidIndex { index });
        }
        Ok(self.entry_at((len - 1 - index) as usize))
    }

    /// Entry by absolute index.
    pub fn get_absolute(&self, absolute: u64) -> Result<Entry<'_>, Error> {
        let base = self.dropped();
        if absolute < base || absolute >= self.inserted {
            return Err(Error::InvalidIndex { index: absolute });
        }
        Ok(self.entry_at((absolute - base) as usize))
    }

    /// Newest entry matching `name` (and `value` if possible).
    pub fn find(&self, name: &[u8], value: &[u8]) -> Option<Match> {
        let base = self.dropped();
        let mut name_match = None;
        for i in (0..self.entries.len()).rev() {
            let e = self.entry_at(i);
            if e.name == name {
                let absolute = base + i as u64;
                if e.value == value {
                    return Some(Match { absolute, exact: true });
                }
                name_match.get_or_insert(Match { absolute, exact: false });
            }
        }
        name_match
    }

    /// Change the capacity, evicting as needed.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<(), Error> {
        if capacity > self.max_capacity {
            return Err(Error::TableCapacityExceeded);
        }
        self.capacity = capacity;
        self.evict_to(capacity);
        Ok(())
    }

    /// Whether `size` bytes can be inserted while evicting only entries
    /// with an absolute index below `protect_from`.
    pub fn can_insert(&self, size: usize, protect_from: u64) -> bool {
        if size > self.capacity {
            return false;
        }
        let mut free = self.capacity - self.size;
        let mut abs = self.dropped();
        for meta in &self.entries {
            if free >= size {
                break;
            }
            if abs >= protect_from {
                return false;
            }
            free += meta.bytes() + ENTRY_OVERHEAD;
            abs += 1;
        }
        free >= size
    }

    pub fn clear(&mut self) {
        self.evict_to(0);
    }

    pub fn current_size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total insertions so far (QPACK Insert Count).
    pub fn insert_count(&self) -> u64 {
        self.inserted
    }

    /// Absolute index of the oldest live entry.
    pub fn dropped(&self) -> u64 {
        self.inserted - self.entries.len() as u64
    }

    fn entry_at(&self, i: usize) -> Entry<'_> {
        let meta = self.entries[i];
        let start = meta.start - self.drained;
        let mid = start + meta.name_len as usize;
        let end = mid + meta.value_len as usize;
        Entry { name: &self.data[start..mid], value: &self.data[mid..end] }
    }

    fn evict_to(&mut self, target: usize) -> usize {
        let mut evicted = 0;
        let mut drain = 0;
        while self.size > target {
            let Some(meta) = self.entries.pop_front() else { break };
            drain += meta.bytes();
            self.size -= meta.bytes() + ENTRY_OVERHEAD;
            evicted += 1;
        }
        if drain > 0 {
            self.data.drain(..drain);
            self.drained += drain;
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_index_both_ways() {
        let mut t = DynamicTable::new(4096);
        t.insert(b"custom-key", b"custom-header").unwrap();
        t.insert(b":authority", b"www.example.com").unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.current_size(), 55 + 57);
        assert_eq!(t.get_relative(0).unwrap().name, b":authority");
        assert_eq!(t.get_relative(1).unwrap().value, b"custom-header");
        assert_eq!(t.get_absolute(0).unwrap().name, b"custom-key");
        assert_eq!(t.get_relative(2), Err(Error::InvalidIndex { index: 2 }));
    }

    #[test]
    fn eviction_keeps_indices_consistent() {
        // RFC 7541 C.5.3: 256-byte table, the third response evicts two entries.
        let mut t = DynamicTable::new(256);
        t.insert(b":status", b"302").unwrap();
        t.insert(b"cache-control", b"private").unwrap();
        t.insert(b"date", b"Mon, 21 Oct 2013 20:13:21 GMT").unwrap();
        t.insert(b"location", b"https://www.example.com").unwrap();
        assert_eq!(t.len(), 4);
        assert_eq!(t.current_size(), 222);
        let evicted = t.insert(b":status", b"307").unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(t.dropped(), 1);
        assert_eq!(t.get_absolute(0), Err(Error::InvalidIndex { index: 0 }));
        assert_eq!(t.get_absolute(4).unwrap().value, b"307");
        assert_eq!(t.get_relative(3).unwrap().name, b"cache-control");
    }

    #[test]
    fn oversized_entry_rejected_without_side_effects() {
        let mut t = DynamicTable::new(64);
        t.insert(b"a", b"b").unwrap();
        let big = [b'x'; 64];
        assert_eq!(t.insert(b"k", &big), Err(Error::TableCapacityExceeded));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn find_prefers_newest_exact() {
        let mut t = DynamicTable::new(4096);
        t.insert(b"x", b"1").unwrap();
        t.insert(b"x", b"2").unwrap();
        t.insert(b"x", b"1").unwrap();
        assert_eq!(t.find(b"x", b"1"), Some(Match { absolute: 2, exact: true }));
        assert_eq!(t.find(b"x", b"3"), Some(Match { absolute: 2, exact: false }));
        assert_eq!(t.find(b"y", b"1"), None);
    }

    #[test]
    fn capacity_reduction_evicts() {
        let mut t = DynamicTable::new(4096);
        t.insert(b"aaaa", b"bbbb").unwrap();
        t.insert(b"cccc", b"dddd").unwrap();
        t.set_capacity(40).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.get_relative(0).unwrap().name, b"cccc");
        assert_eq!(t.set_capacity(8192), Err(Error::TableCapacityExceeded));
        t.set_capacity(0).unwrap();
        assert!(t.is_empty());
        assert_eq!(t.insert_count(), 2);
    }

    #[test]
    fn name_reference_survives_eviction_of_source() {
        let mut t = DynamicTable::new(2 * ENTRY_OVERHEAD + 8);
        t.insert(b"name", b"v1").unwrap();
        t.insert(b"zz", b"").unwrap();
        // Inserting must evict entry 0, which holds the referenced name.
        t.insert_with_name_of(0, b"v2").unwrap();
        assert_eq!(t.get_relative(0).unwrap(), Entry { name: b"name", value: b"v2" });
        t.duplicate(2).unwrap();
        assert_eq!(t.get_absolute(3).unwrap().value, b"v2");
    }

    #[test]
    fn protected_entries_block_insertion() {
        let mut t = DynamicTable::new(100);
        t.insert(b"k", b"0123456789").unwrap(); // 43 bytes, abs 0
        t.insert(b"k", b"0123456789").unwrap(); // abs 1
        assert!(t.can_insert(43, 1));
        assert!(!t.can_insert(43, 0));
        assert!(!t.can_insert(101, 10));
    }
}
