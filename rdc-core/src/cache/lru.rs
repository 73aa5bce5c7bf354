//! Fixed-capacity slot array with an index-linked LRU chain.
//!
//! Slots are addressed by protocol-assigned indices. Occupied slots are
//! threaded into one doubly-linked list through `prev`/`next` indices,
//! with `-1` marking either end. Nothing is evicted implicitly; a slot
//! only changes content when it is explicitly overwritten or removed.

use crate::error::{RdcError, Result};

/// List terminus.
pub const NOT_SET: i16 = -1;

#[derive(Debug, Clone)]
struct Slot<T> {
    value: Option<T>,
    prev: i16,
    next: i16,
}

/// An arena of `capacity` slots plus the LRU chain over occupied ones.
#[derive(Debug, Clone)]
pub struct LruCache<T> {
    slots: Vec<Slot<T>>,
    lru: i16,
    mru: i16,
    count: usize,
}

impl<T> LruCache<T> {
    /// Capacity is clamped to what an `i16` index can address.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(i16::MAX as usize);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot {
            value: None,
            prev: NOT_SET,
            next: NOT_SET,
        });
        Self {
            slots,
            lru: NOT_SET,
            mru: NOT_SET,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mru(&self) -> Option<u16> {
        (self.mru >= 0).then_some(self.mru as u16)
    }

    pub fn lru(&self) -> Option<u16> {
        (self.lru >= 0).then_some(self.lru as u16)
    }

    /// Content of `idx` without touching recency.
    pub fn peek(&self, idx: u16) -> Option<&T> {
        self.slots.get(usize::from(idx))?.value.as_ref()
    }

    /// Content of `idx`, moving it to the MRU end on a hit.
    pub fn get(&mut self, idx: u16) -> Option<&T> {
        let i = usize::from(idx);
        if self.slots.get(i)?.value.is_none() {
            return None;
        }
        self.unlink(idx as i16);
        self.link_mru(idx as i16);
        self.slots[i].value.as_ref()
    }

    /// Install `value` at `idx` as the most recently used entry.
    ///
    /// Returns the previous occupant, if any.
    pub fn put(&mut self, idx: u16, value: T) -> Result<Option<T>> {
        let i = usize::from(idx);
        if i >= self.slots.len() {
            return Err(RdcError::malformed("cache index out of range"));
        }
        let old = if self.slots[i].value.is_some() {
            self.unlink(idx as i16);
            self.count -= 1;
            self.slots[i].value.take()
        } else {
            None
        };
        self.slots[i].value = Some(value);
        self.count += 1;
        self.link_mru(idx as i16);
        Ok(old)
    }

    /// Empty `idx`, returning what it held.
    pub fn remove(&mut self, idx: u16) -> Option<T> {
        let i = usize::from(idx);
        self.slots.get(i)?.value.as_ref()?;
        self.unlink(idx as i16);
        self.count -= 1;
        self.slots[i].value.take()
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.value = None;
            slot.prev = NOT_SET;
            slot.next = NOT_SET;
        }
        self.lru = NOT_SET;
        self.mru = NOT_SET;
        self.count = 0;
    }

    /// Rebuild the chain from a peer-provided ordering, least recent
    /// first.
    ///
    /// Indices that are empty, out of range or repeated are skipped.
    /// Occupied slots the ordering does not mention are kept at the
    /// least-recent end in index order.
    pub fn rebuild_linked_list(&mut self, order: &[u16]) {
        let mut seen = vec![false; self.slots.len()];
        let mut chain: Vec<i16> = Vec::with_capacity(self.count);

        for &idx in order {
            let i = usize::from(idx);
            if i < self.slots.len() && self.slots[i].value.is_some() && !seen[i] {
                seen[i] = true;
                chain.push(idx as i16);
            }
        }
        let mut unmentioned: Vec<i16> = (0..self.slots.len())
            .filter(|&i| self.slots[i].value.is_some() && !seen[i])
            .map(|i| i as i16)
            .collect();
        unmentioned.append(&mut chain);
        let chain = unmentioned;

        for slot in &mut self.slots {
            slot.prev = NOT_SET;
            slot.next = NOT_SET;
        }
        for pair in chain.windows(2) {
            self.slots[pair[0] as usize].next = pair[1];
            self.slots[pair[1] as usize].prev = pair[0];
        }
        self.lru = chain.first().copied().unwrap_or(NOT_SET);
        self.mru = chain.last().copied().unwrap_or(NOT_SET);
    }

    /// Occupied indices from least to most recently used.
    pub fn iter_lru(&self) -> LruIter<'_, T> {
        LruIter {
            cache: self,
            cursor: self.lru,
            remaining: self.count,
        }
    }

    /// Verify that every occupied slot appears exactly once in the
    /// chain and that both directions agree.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let mut seen = vec![false; self.slots.len()];
        let mut prev = NOT_SET;
        let mut cursor = self.lru;
        let mut walked = 0usize;

        while cursor != NOT_SET {
            let i = usize::try_from(cursor).map_err(|_| format!("bad index {cursor}"))?;
            let slot = self
                .slots
                .get(i)
                .ok_or_else(|| format!("index {i} out of range"))?;
            if seen[i] {
                return Err(format!("index {i} linked twice"));
            }
            if slot.value.is_none() {
                return Err(format!("empty slot {i} is linked"));
            }
            if slot.prev != prev {
                return Err(format!("slot {i} prev {} != {prev}", slot.prev));
            }
            seen[i] = true;
            walked += 1;
            prev = cursor;
            cursor = slot.next;
        }

        if prev != self.mru {
            return Err(format!("chain ends at {prev}, mru is {}", self.mru));
        }
        if walked != self.count {
            return Err(format!("{walked} linked, {} occupied", self.count));
        }
        let occupied = self.slots.iter().filter(|s| s.value.is_some()).count();
        if occupied != self.count {
            return Err(format!("{occupied} occupied, count says {}", self.count));
        }
        Ok(())
    }

    // ── Internal ─────────────────────────────────────────────────

    fn unlink(&mut self, idx: i16) {
        let i = idx as usize;
        let (prev, next) = (self.slots[i].prev, self.slots[i].next);
        if prev >= 0 {
            self.slots[prev as usize].next = next;
        } else if self.lru == idx {
            self.lru = next;
        }
        if next >= 0 {
            self.slots[next as usize].prev = prev;
        } else if self.mru == idx {
            self.mru = prev;
        }
        self.slots[i].prev = NOT_SET;
        self.slots[i].next = NOT_SET;
    }

    fn link_mru(&mut self, idx: i16) {
        let i = idx as usize;
        self.slots[i].prev = self.mru;
        self.slots[i].next = NOT_SET;
        if self.mru >= 0 {
            self.slots[self.mru as usize].next = idx;
        } else {
            self.lru = idx;
        }
        self.mru = idx;
    }
}

/// Iterator over occupied indices, least recent first.
pub struct LruIter<'a, T> {
    cache: &'a LruCache<T>,
    cursor: i16,
    remaining: usize,
}

impl<T> Iterator for LruIter<'_, T> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        if self.cursor < 0 || self.remaining == 0 {
            return None;
        }
        let idx = self.cursor;
        self.cursor = self.cache.slots[idx as usize].next;
        self.remaining -= 1;
        Some(idx as u16)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn order(c: &LruCache<u32>) -> Vec<u16> {
        c.iter_lru().collect()
    }

    #[test]
    fn put_links_at_mru_and_overwrites() {
        let mut c = LruCache::new(8);
        c.put(3, 30).unwrap();
        c.put(1, 10).unwrap();
        c.put(5, 50).unwrap();
        assert_eq!(order(&c), vec![3, 1, 5]);

        assert_eq!(c.put(3, 31).unwrap(), Some(30));
        assert_eq!(order(&c), vec![1, 5, 3]);
        assert_eq!(c.len(), 3);
        c.check_invariants().unwrap();
    }

    #[test]
    fn get_bumps_and_misses_are_none() {
        let mut c = LruCache::new(4);
        c.put(0, 1).unwrap();
        c.put(1, 2).unwrap();
        assert_eq!(c.get(0), Some(&1));
        assert_eq!(order(&c), vec![1, 0]);
        assert_eq!(c.get(2), None);
        assert_eq!(c.get(100), None);
        assert_eq!(c.peek(1), Some(&2));
        assert_eq!(order(&c), vec![1, 0]);
    }

    #[test]
    fn out_of_range_put_is_rejected() {
        let mut c: LruCache<u32> = LruCache::new(2);
        assert!(c.put(2, 0).is_err());
    }

    #[test]
    fn remove_unlinks() {
        let mut c = LruCache::new(4);
        for i in 0..4 {
            c.put(i, u32::from(i)).unwrap();
        }
        assert_eq!(c.remove(0), Some(0));
        assert_eq!(c.remove(3), Some(3));
        assert_eq!(c.remove(3), None);
        assert_eq!(order(&c), vec![1, 2]);
        assert_eq!(c.lru(), Some(1));
        assert_eq!(c.mru(), Some(2));
        c.check_invariants().unwrap();
    }

    #[test]
    fn rebuild_follows_peer_order() {
        let mut c = LruCache::new(8);
        for i in [0u16, 2, 4, 6] {
            c.put(i, u32::from(i)).unwrap();
        }
        // 7 is empty, 4 repeats, 6 is not mentioned
        c.rebuild_linked_list(&[4, 0, 7, 2, 4]);
        assert_eq!(order(&c), vec![6, 4, 0, 2]);
        c.check_invariants().unwrap();

        c.rebuild_linked_list(&[]);
        assert_eq!(order(&c), vec![0, 2, 4, 6]);
        c.check_invariants().unwrap();
    }

    #[test]
    fn invariant_holds_across_mixed_operations() {
        let mut c = LruCache::new(16);
        let mut x: u32 = 12345;
        for step in 0..2000u32 {
            x = x.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let idx = ((x >> 16) % 16) as u16;
            match (x >> 8) % 5 {
                0 | 1 => {
                    c.put(idx, step).unwrap();
                }
                2 => {
                    c.get(idx);
                }
                3 => {
                    c.remove(idx);
                }
                _ => {
                    let ordering: Vec<u16> = (0..16).rev().filter(|i| i % 3 != 0).collect();
                    c.rebuild_linked_list(&ordering);
                }
            }
            c.check_invariants().unwrap();
        }
    }

    #[test]
    fn clear_empties_everything() {
        let mut c = LruCache::new(4);
        c.put(1, 1).unwrap();
        c.clear();
        assert!(c.is_empty());
        assert_eq!(c.mru(), None);
        c.check_invariants().unwrap();
    }
}
