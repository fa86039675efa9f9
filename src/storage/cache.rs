//! # LRU Region Cache
//!
//! This module holds the resident region buffers. Each buffer is exactly
//! `REGION_SIZE` bytes and holds at most one region; the set of buffers is
//! kept on an LRU list so that the least recently touched region is the one
//! paged out when a new region has to come in.
//!
//! ## Why Plain LRU?
//!
//! Access to chunk regions is driven by object lookups, not by scans, and the
//! migration engine already moves hot chunks together. A strict recency list
//! is enough, and it gives migration a simple guarantee: touching a region
//! makes it the last candidate for eviction.
//!
//! ## Arena Layout
//!
//! Buffers live in a `Vec` and never move or get freed; the list links are
//! slot indices rather than pointers:
//!
//! ```text
//! head (MRU)                                   tail (LRU)
//!    │                                            │
//!    ▼                                            ▼
//! slot 3 ──next──▶ slot 0 ──next──▶ slot 2 ──next──▶ None
//!  None ◀──prev── slot 3 ◀──prev── slot 0 ◀──prev── slot 2
//! ```
//!
//! A slot whose `region_id` is `INVALID_REGION_ID` is empty and is handed out
//! before any occupied slot is evicted.
//!
//! ## Budget
//!
//! New buffers are allocated while `buffers * REGION_SIZE < budget`. After
//! that the tail buffer is recycled. The budget is clamped to at least two
//! regions so a migration can hold its source and destination resident at
//! the same time.
//!
//! The cache knows nothing about the swap file; the store writes the evicted
//! occupant out before reusing a slot.

use crate::config::{INVALID_REGION_ID, MIN_CACHE_MEMORY, REGION_SIZE};

#[derive(Debug)]
struct CacheEntry {
    region_id: u16,
    data: Box<[u8]>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            region_id: INVALID_REGION_ID,
            data: vec![0u8; REGION_SIZE].into_boxed_slice(),
            prev: None,
            next: None,
        }
    }
}

#[derive(Debug)]
pub struct RegionCache {
    entries: Vec<CacheEntry>,
    head: Option<usize>,
    tail: Option<usize>,
    budget: usize,
}

impl RegionCache {
    pub fn new(budget: usize) -> Self {
        Self {
            entries: Vec::new(),
            head: None,
            tail: None,
            budget: budget.max(MIN_CACHE_MEMORY),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Number of buffers allocated so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn memory_used(&self) -> usize {
        self.entries.len() * REGION_SIZE
    }

    /// True while another buffer fits in the budget.
    pub fn can_grow(&self) -> bool {
        self.tail.is_none() || self.memory_used() < self.budget
    }

    /// Allocates a new empty buffer, links it at the LRU end and returns
    /// its slot.
    pub fn grow(&mut self) -> usize {
        let slot = self.entries.len();
        self.entries.push(CacheEntry::new());
        self.link_tail(slot);
        slot
    }

    /// Slot of the least recently used buffer.
    pub fn lru(&self) -> Option<usize> {
        self.tail
    }

    pub fn region_of(&self, slot: usize) -> u16 {
        self.entries[slot].region_id
    }

    pub fn set_region(&mut self, slot: usize, region_id: u16) {
        self.entries[slot].region_id = region_id;
    }

    pub fn data(&self, slot: usize) -> &[u8] {
        &self.entries[slot].data
    }

    pub fn data_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.entries[slot].data
    }

    /// Mutable access to two different buffers at once.
    pub fn pair_mut(&mut self, a: usize, b: usize) -> (&mut [u8], &mut [u8]) {
        assert_ne!(a, b, "pair_mut needs two distinct slots");
        if a < b {
            let (left, right) = self.entries.split_at_mut(b);
            (&mut left[a].data, &mut right[0].data)
        } else {
            let (left, right) = self.entries.split_at_mut(a);
            (&mut right[0].data, &mut left[b].data)
        }
    }

    /// Moves a buffer to the MRU end.
    pub fn touch(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.link_head(slot);
    }

    /// Slots from most to least recently used.
    pub fn iter_mru(&self) -> MruIter<'_> {
        MruIter {
            cache: self,
            cursor: self.head,
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.entries[slot].prev, self.entries[slot].next);
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.tail = prev,
        }
        self.entries[slot].prev = None;
        self.entries[slot].next = None;
    }

    fn link_head(&mut self, slot: usize) {
        self.entries[slot].prev = None;
        self.entries[slot].next = self.head;
        match self.head {
            Some(h) => self.entries[h].prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
    }

    fn link_tail(&mut self, slot: usize) {
        self.entries[slot].next = None;
        self.entries[slot].prev = self.tail;
        match self.tail {
            Some(t) => self.entries[t].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }
}

pub struct MruIter<'a> {
    cache: &'a RegionCache,
    cursor: Option<usize>,
}

impl Iterator for MruIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let slot = self.cursor?;
        self.cursor = self.cache.entries[slot].next;
        Some(slot)
    }
}
