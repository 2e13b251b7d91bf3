// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Bounded-byte LRU partition.
//!
//! One [`LruPartition`] is one shard of the memory tier: a map from key to an
//! arena slot plus a doubly linked recency list threaded through the slots by
//! index. Indices replace the raw pointer cycle a classic intrusive LRU would
//! use; freed slots are recycled through a free list. All operations are
//! `O(1)` expected.
//!
//! # Invariants
//!
//! - `current_bytes == Σ value.len()` over all live entries.
//! - `current_bytes <= capacity` after any completed mutation.
//! - Map and recency list contain exactly the same entries.
//! - Head is most-recently-used, tail least-recently-used.

use std::collections::HashMap;
use std::time::SystemTime;

/// Sentinel index for "no slot" in the recency list.
const NIL: usize = usize::MAX;

/// Smallest initial map capacity.
const MIN_ENTRY_HINT: usize = 16;
/// Largest initial map capacity.
const MAX_ENTRY_HINT: usize = 65536;

#[derive(Debug)]
struct Slot {
    key: Vec<u8>,
    value: Vec<u8>,
    created: SystemTime,
    prev: usize,
    next: usize,
}

/// Outcome of [`LruPartition::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The value is in the partition.
    Stored,
    /// The value does not fit right now; the caller must evict (spill the
    /// tail) and retry. Nothing was inserted.
    NeedsEviction,
    /// The value can never fit, even in an empty partition. Nothing was
    /// inserted and no eviction should be attempted.
    TooLarge,
}

/// A borrowed view of the least-recently-used entry.
#[derive(Debug, Clone, Copy)]
pub struct TailEntry<'a> {
    /// The entry's key.
    pub key: &'a [u8],
    /// The entry's value bytes.
    pub value: &'a [u8],
    /// When the entry was created in this partition.
    pub created: SystemTime,
}

/// One bounded-byte LRU shard of the memory tier.
///
/// The partition itself is not synchronized; the coordinator wraps each one
/// in a mutex and holds it for the full duration of every operation,
/// including the disk traffic of a spill or promotion.
pub struct LruPartition {
    map: HashMap<Vec<u8>, usize>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: usize,
    current_bytes: usize,
}

impl LruPartition {
    /// Create a partition bounded at `capacity` bytes of value data.
    ///
    /// The map's initial capacity assumes ~1 KiB entries at a 0.75 load
    /// factor, rounded up to a power of two and clamped to `[16, 65536]`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(Self::entry_hint(capacity)),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
            current_bytes: 0,
        }
    }

    fn entry_hint(capacity: usize) -> usize {
        let estimated_entries = capacity / 1024;
        let target = estimated_entries + estimated_entries / 3; // ÷ 0.75
        let mut hint = MIN_ENTRY_HINT;
        while hint < target && hint < MAX_ENTRY_HINT {
            hint <<= 1;
        }
        hint
    }

    /// Byte budget of this partition.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes of value data currently held.
    pub fn current_bytes(&self) -> usize {
        self.current_bytes
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the partition holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Fetch a copy of the value for `key` and mark the entry most recently
    /// used. Returns `None` on a miss.
    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let idx = *self.map.get(key)?;
        let value = self.slots[idx].value.clone();
        self.move_to_head(idx);
        Some(value)
    }

    /// Insert or replace `key`, subject to the byte budget.
    ///
    /// A replacement is admitted when the projected total (accounting for the
    /// bytes the old value gives back) fits; otherwise the entry is parked at
    /// the head, so it can never be the spill candidate, and `NeedsEviction`
    /// is returned for the caller's evict-and-retry loop.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> PutOutcome {
        if value.len() >= self.capacity {
            return PutOutcome::TooLarge;
        }
        if let Some(&idx) = self.map.get(key) {
            let projected = self.current_bytes - self.slots[idx].value.len() + value.len();
            if projected >= self.capacity {
                self.move_to_head(idx);
                return PutOutcome::NeedsEviction;
            }
            self.current_bytes = projected;
            self.slots[idx].value = value.to_vec();
            self.move_to_head(idx);
            return PutOutcome::Stored;
        }
        if self.current_bytes + value.len() >= self.capacity {
            return PutOutcome::NeedsEviction;
        }
        let idx = self.alloc_slot(key, value);
        self.map.insert(key.to_vec(), idx);
        self.current_bytes += value.len();
        self.push_head(idx);
        PutOutcome::Stored
    }

    /// Remove `key` from the partition. Returns `true` if it was present.
    pub fn evict(&mut self, key: &[u8]) -> bool {
        let Some(idx) = self.map.remove(key) else {
            return false;
        };
        self.unlink(idx);
        self.release_slot(idx);
        true
    }

    /// The least-recently-used entry, without perturbing recency order.
    pub fn peek_tail(&self) -> Option<TailEntry<'_>> {
        if self.tail == NIL {
            return None;
        }
        let slot = &self.slots[self.tail];
        Some(TailEntry {
            key: &slot.key,
            value: &slot.value,
            created: slot.created,
        })
    }

    /// Remove the least-recently-used entry and release its bytes. Returns
    /// `false` if the partition is empty.
    pub fn pop_tail(&mut self) -> bool {
        if self.tail == NIL {
            return false;
        }
        let idx = self.tail;
        self.unlink(idx);
        let key = std::mem::take(&mut self.slots[idx].key);
        self.map.remove(&key);
        self.release_slot(idx);
        true
    }

    fn alloc_slot(&mut self, key: &[u8], value: &[u8]) -> usize {
        let slot = Slot {
            key: key.to_vec(),
            value: value.to_vec(),
            created: SystemTime::now(),
            prev: NIL,
            next: NIL,
        };
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = slot;
            idx
        } else {
            self.slots.push(slot);
            self.slots.len() - 1
        }
    }

    fn release_slot(&mut self, idx: usize) {
        self.current_bytes -= self.slots[idx].value.len();
        // Drop the heap buffers now; the slot index is recycled later.
        self.slots[idx].key = Vec::new();
        self.slots[idx].value = Vec::new();
        self.free.push(idx);
    }

    fn push_head(&mut self, idx: usize) {
        self.slots[idx].prev = NIL;
        self.slots[idx].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slots[next].prev = prev;
        }
        self.slots[idx].prev = NIL;
        self.slots[idx].next = NIL;
    }

    fn move_to_head(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.push_head(idx);
    }

    #[cfg(test)]
    fn keys_in_recency_order(&self) -> Vec<Vec<u8>> {
        let mut keys = Vec::with_capacity(self.map.len());
        let mut idx = self.head;
        while idx != NIL {
            keys.push(self.slots[idx].key.clone());
            idx = self.slots[idx].next;
        }
        keys
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn assert_invariants(part: &LruPartition) {
        let listed = part.keys_in_recency_order();
        assert_eq!(listed.len(), part.len(), "list and map disagree");
        let mut total = 0;
        for key in &listed {
            let idx = part.map[key];
            total += part.slots[idx].value.len();
        }
        assert_eq!(total, part.current_bytes(), "byte accounting drifted");
        assert!(part.current_bytes() <= part.capacity());
    }

    #[test]
    fn get_on_empty_misses() {
        let mut part = LruPartition::with_capacity(1024);
        assert!(part.get(b"anything").is_none());
        assert!(part.is_empty());
    }

    #[test]
    fn put_get_round_trip() {
        let mut part = LruPartition::with_capacity(1024);
        assert_eq!(part.put(b"k", b"value"), PutOutcome::Stored);
        assert_eq!(part.get(b"k").unwrap(), b"value");
        assert_eq!(part.current_bytes(), 5);
        assert_invariants(&part);
    }

    #[test]
    fn replace_adjusts_bytes_by_delta() {
        let mut part = LruPartition::with_capacity(1024);
        part.put(b"k", b"short");
        part.put(b"k", b"a much longer value");
        assert_eq!(part.len(), 1);
        assert_eq!(part.current_bytes(), b"a much longer value".len());
        assert_eq!(part.get(b"k").unwrap(), b"a much longer value");
        assert_invariants(&part);
    }

    #[test]
    fn full_partition_reports_needs_eviction_without_inserting() {
        let mut part = LruPartition::with_capacity(100);
        assert_eq!(part.put(b"a", &[0u8; 60]), PutOutcome::Stored);
        assert_eq!(part.put(b"b", &[0u8; 40]), PutOutcome::NeedsEviction);
        assert_eq!(part.len(), 1);
        assert_eq!(part.current_bytes(), 60);
        assert_invariants(&part);
    }

    #[test]
    fn value_at_or_above_capacity_is_too_large() {
        let mut part = LruPartition::with_capacity(100);
        assert_eq!(part.put(b"k", &[0u8; 100]), PutOutcome::TooLarge);
        assert_eq!(part.put(b"k", &[0u8; 150]), PutOutcome::TooLarge);
        assert_eq!(part.current_bytes(), 0);
        assert!(part.is_empty());
    }

    #[test]
    fn recency_order_tracks_access() {
        let mut part = LruPartition::with_capacity(1024);
        part.put(b"a", b"1");
        part.put(b"b", b"2");
        part.put(b"c", b"3");
        assert_eq!(
            part.keys_in_recency_order(),
            vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]
        );

        // Hit moves to head.
        part.get(b"a");
        assert_eq!(
            part.keys_in_recency_order(),
            vec![b"a".to_vec(), b"c".to_vec(), b"b".to_vec()]
        );

        // Replace moves to head.
        part.put(b"b", b"2!");
        assert_eq!(
            part.keys_in_recency_order(),
            vec![b"b".to_vec(), b"a".to_vec(), b"c".to_vec()]
        );
        assert_invariants(&part);
    }

    #[test]
    fn peek_tail_does_not_perturb_order() {
        let mut part = LruPartition::with_capacity(1024);
        part.put(b"old", b"1");
        part.put(b"mid", b"2");
        part.put(b"new", b"3");
        assert_eq!(part.peek_tail().unwrap().key, b"old");

        // Touch everything except the tail; the tail must not move.
        part.get(b"mid");
        part.get(b"new");
        assert_eq!(part.peek_tail().unwrap().key, b"old");
        assert_invariants(&part);
    }

    #[test]
    fn pop_tail_removes_lru_entry() {
        let mut part = LruPartition::with_capacity(1024);
        part.put(b"old", b"11");
        part.put(b"new", b"22");
        assert!(part.pop_tail());
        assert!(part.get(b"old").is_none());
        assert_eq!(part.get(b"new").unwrap(), b"22");
        assert_eq!(part.current_bytes(), 2);
        assert!(part.pop_tail());
        assert!(!part.pop_tail());
        assert!(part.is_empty());
        assert_eq!(part.current_bytes(), 0);
    }

    #[test]
    fn evict_unlinks_from_both_structures() {
        let mut part = LruPartition::with_capacity(1024);
        part.put(b"a", b"1");
        part.put(b"b", b"2");
        part.put(b"c", b"3");
        assert!(part.evict(b"b"));
        assert!(!part.evict(b"b"));
        assert_eq!(
            part.keys_in_recency_order(),
            vec![b"c".to_vec(), b"a".to_vec()]
        );
        assert_eq!(part.current_bytes(), 2);
        assert_invariants(&part);
    }

    #[test]
    fn slots_are_recycled_after_eviction() {
        let mut part = LruPartition::with_capacity(1024);
        for round in 0..10 {
            let key = format!("key-{round}");
            part.put(key.as_bytes(), b"payload");
            assert!(part.evict(key.as_bytes()));
        }
        // One live slot at a time means the arena never grew past one.
        assert!(part.slots.len() <= 1, "arena grew to {}", part.slots.len());
        assert_invariants(&part);
    }

    #[test]
    fn shrinking_replacement_near_capacity_is_admitted() {
        let mut part = LruPartition::with_capacity(100);
        part.put(b"a", &[0u8; 30]);
        part.put(b"k", &[0u8; 50]);
        // The raw sum (80 + 40) is over budget; the delta-adjusted total
        // (80 - 50 + 40 = 70) is not. No eviction may be requested.
        assert_eq!(part.put(b"k", &[0u8; 40]), PutOutcome::Stored);
        assert_eq!(part.len(), 2);
        assert_eq!(part.current_bytes(), 70);
        assert_eq!(part.get(b"k").unwrap(), vec![0u8; 40]);
        assert_invariants(&part);
    }

    #[test]
    fn same_size_replacement_in_full_partition_is_admitted() {
        let mut part = LruPartition::with_capacity(100);
        part.put(b"a", &[0u8; 40]);
        part.put(b"k", &[1u8; 50]);
        // current_bytes is 90 of 100; rewriting k at the same size must not
        // spill anything.
        assert_eq!(part.put(b"k", &[2u8; 50]), PutOutcome::Stored);
        assert_eq!(part.current_bytes(), 90);
        assert_eq!(part.get(b"k").unwrap(), vec![2u8; 50]);
        assert_invariants(&part);
    }

    #[test]
    fn replacement_in_full_partition_keeps_entry_off_the_tail() {
        let mut part = LruPartition::with_capacity(100);
        part.put(b"a", &[0u8; 30]);
        part.put(b"b", &[0u8; 30]);
        part.put(b"k", &[0u8; 20]);
        // Growing k's value overflows; k must be parked at the head so the
        // caller spills a/b, not k itself.
        assert_eq!(part.put(b"k", &[0u8; 50]), PutOutcome::NeedsEviction);
        assert_eq!(part.keys_in_recency_order()[0], b"k".to_vec());
        assert_eq!(part.peek_tail().unwrap().key, b"a");
        assert_invariants(&part);
    }

    #[test]
    fn entry_hint_formula() {
        // 1 MiB / 1 KiB = 1024 entries → /0.75 → 1365 → next pow2 = 2048.
        assert_eq!(LruPartition::entry_hint(1024 * 1024), 2048);
        assert_eq!(LruPartition::entry_hint(0), 16);
        // Clamped at 64 Ki even for huge partitions.
        assert_eq!(LruPartition::entry_hint(1 << 30), 65536);
    }
}
